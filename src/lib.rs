//! ibackup-rs: reader and editor for iTunes/Finder device backups
//!
//! A backup is a directory holding a catalog (`Manifest.db`), a descriptor
//! (`Manifest.plist`) and one content blob per file. Encrypted backups add a
//! keybag that turns the backup password into per-protection-class keys;
//! every file then carries its own wrapped AES key.
//!
//! This crate provides:
//! - Keybag parsing and password unlock ([`KeyBag`])
//! - The `Files` catalog with search and domain queries ([`ManifestIndex`])
//! - Per-file decryption and re-encryption ([`FileCipher`])
//! - Extraction, replacement and deletion of entries ([`BackupEntry`])
//! - Repair of legacy padding on decrypted files ([`try_fix_padding`])
//! - SQLite access to app databases inside the backup ([`BackupVfs`])
//!
//! # Example
//!
//! ```no_run
//! use ibackup_rs::Backup;
//!
//! let backup = Backup::open("/path/to/backup/00008101-000A1B2C3D4E5F60")?;
//! if backup.is_locked() {
//!     backup.unlock("backup password")?;
//! }
//!
//! for entry in backup.search_files("HomeDomain", "Library/SMS/%")? {
//!     println!("{} ({:?} bytes)", entry.relative_path, entry.size());
//! }
//!
//! let sms = backup.find_file("HomeDomain", "Library/SMS/sms.db")?;
//! sms.extract("sms.db", true)?;
//! backup.close()?;
//! # Ok::<(), ibackup_rs::BackupError>(())
//! ```

pub mod backup;
pub mod config;
pub mod crypto;
pub mod error;
pub mod manifest;
pub mod padding;
pub mod vfs;

pub use backup::{Backup, BackupEntry, ExportFailure, ExportReport, Extracted};
pub use config::{ExportOptions, ExtractOptions, FailurePolicy, Preferences};
pub use crypto::{FileCipher, KeyBag, ProtectionClass};
pub use error::{BackupError, Result};
pub use manifest::{
    file_id_for, BackupInfo, BackupManifest, FileRecord, FileStats, FileType, ManifestIndex,
};
pub use padding::try_fix_padding;
pub use vfs::BackupVfs;
