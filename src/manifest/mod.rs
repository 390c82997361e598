//! Backup catalog: descriptors, the `Files` index and per-file records

pub mod descriptor;
pub mod index;
pub mod keyed_archive;
pub mod record;

pub use descriptor::{BackupInfo, BackupManifest, INFO_PLIST, MANIFEST_DB, MANIFEST_PLIST};
pub use index::{FileStats, ManifestIndex};
pub use keyed_archive::{uid_index, KeyedArchive};
pub use record::{file_id_for, EncryptionKey, FileRecord, FileType};
