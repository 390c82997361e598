//! An opened backup directory
//!
//! ```text
//! <backup>/
//! ├── Manifest.plist      descriptor, keybag, manifest key
//! ├── Manifest.db         Files catalog (encrypted in encrypted backups)
//! ├── Info.plist          optional device info
//! └── 3d/3d0d7e5f...      content blobs named by file ID
//! ```

mod entry;
mod export;

pub use entry::{BackupEntry, Extracted};
pub use export::{ExportFailure, ExportReport};

use crate::crypto::{FileCipher, KeyBag};
use crate::error::{BackupError, Result};
use crate::manifest::{
    file_id_for, BackupInfo, BackupManifest, EncryptionKey, FileRecord, FileStats, ManifestIndex,
    INFO_PLIST, MANIFEST_DB, MANIFEST_PLIST,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

/// An iTunes/Finder backup opened for reading and editing
#[derive(Debug)]
pub struct Backup {
    directory: PathBuf,
    manifest: BackupManifest,
    info: Option<BackupInfo>,
    keybag: Option<KeyBag>,
    cipher: FileCipher,
    index: OnceLock<ManifestIndex>,
    scratch: TempDir,
}

impl Backup {
    /// Open a backup directory.
    ///
    /// Plain backups are fully usable afterwards. Encrypted backups need
    /// [`unlock`](Self::unlock) before their catalog can be queried.
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        if !directory.is_dir() {
            return Err(BackupError::BackupNotFound(directory));
        }

        // Step 1: Read the descriptor and optional device info
        let manifest = BackupManifest::from_file(&directory.join(MANIFEST_PLIST))?;

        let info_path = directory.join(INFO_PLIST);
        let info = if info_path.exists() {
            match BackupInfo::from_file(&info_path) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(path = %info_path.display(), error = %e, "ignoring unreadable Info.plist");
                    None
                }
            }
        } else {
            None
        };

        // Step 2: Parse the keybag, mandatory for encrypted backups
        let keybag = match &manifest.keybag {
            Some(bytes) => Some(KeyBag::parse(bytes)?),
            None if manifest.is_encrypted => {
                return Err(BackupError::BackupRead(
                    "encrypted backup has no BackupKeyBag".to_string(),
                ))
            }
            None => None,
        };

        // Step 3: Open the catalog right away unless it is encrypted
        let db_path = directory.join(MANIFEST_DB);
        if !db_path.is_file() {
            return Err(BackupError::BackupRead(format!(
                "{} is missing",
                db_path.display()
            )));
        }

        let scratch = tempfile::Builder::new().prefix("ibackup-").tempdir()?;

        let index = OnceLock::new();
        if !manifest.is_encrypted {
            let _ = index.set(ManifestIndex::open(&db_path)?);
        }

        info!(
            path = %directory.display(),
            encrypted = manifest.is_encrypted,
            device = manifest.device_name.as_deref().unwrap_or("unknown"),
            "opened backup"
        );

        Ok(Self {
            directory,
            manifest,
            info,
            keybag,
            cipher: FileCipher::new(),
            index,
            scratch,
        })
    }

    /// Open every backup found directly under `root`, newest first.
    ///
    /// Sub-directories without `Manifest.plist` are ignored; unreadable
    /// backups are logged and skipped.
    pub fn discover<P: AsRef<Path>>(root: P) -> Result<Vec<Backup>> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(BackupError::BackupNotFound(root.to_path_buf()));
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            if !path.join(MANIFEST_PLIST).is_file() {
                continue;
            }
            match Backup::open(&path) {
                Ok(backup) => backups.push(backup),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable backup"),
            }
        }

        backups.sort_by(|a, b| b.manifest.date.cmp(&a.manifest.date));
        debug!(root = %root.display(), found = backups.len(), "discovered backups");
        Ok(backups)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn manifest(&self) -> &BackupManifest {
        &self.manifest
    }

    pub fn info(&self) -> Option<&BackupInfo> {
        self.info.as_ref()
    }

    /// Last backup date from `Info.plist`, else the manifest date
    pub fn display_date(&self) -> Option<SystemTime> {
        self.info
            .as_ref()
            .and_then(|info| info.last_backup_date)
            .or(self.manifest.date)
    }

    pub fn is_encrypted(&self) -> bool {
        self.manifest.is_encrypted
    }

    /// True for an encrypted backup that has not been unlocked yet
    pub fn is_locked(&self) -> bool {
        self.is_encrypted() && self.index.get().is_none()
    }

    pub fn keybag(&self) -> Option<&KeyBag> {
        self.keybag.as_ref()
    }

    pub fn cipher(&self) -> &FileCipher {
        &self.cipher
    }

    /// Directory for temporary plaintext copies, removed on close
    pub(crate) fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Unlock an encrypted backup with its password.
    ///
    /// Unwraps the class keys, then decrypts `Manifest.db` into a scratch
    /// copy and opens the catalog on it. Unlocking a plain or already
    /// unlocked backup only re-checks the password.
    pub fn unlock(&self, password: impl AsRef<[u8]>) -> Result<()> {
        let keybag = match &self.keybag {
            Some(keybag) if self.is_encrypted() => keybag,
            _ => {
                debug!("backup is not encrypted, nothing to unlock");
                return Ok(());
            }
        };

        // Step 1: Unwrap class keys; this also checks the password
        self.cipher.ensure_supported()?;
        keybag.unlock(password)?;

        if self.index.get().is_some() {
            return Ok(());
        }

        // Step 2: Decrypt the catalog and publish it
        let index = self.decrypt_database(keybag)?;
        if let Err(loser) = self.index.set(index) {
            // Raced with another unlock; keep the first copy
            let path = loser.path().to_path_buf();
            loser.close()?;
            if path.starts_with(self.scratch.path()) {
                let _ = fs::remove_file(path);
            }
        }

        info!(path = %self.directory.display(), "backup unlocked");
        Ok(())
    }

    fn manifest_key(&self) -> Result<Option<EncryptionKey>> {
        self.manifest
            .manifest_key
            .as_deref()
            .map(EncryptionKey::decode)
            .transpose()
    }

    /// Decrypt `Manifest.db` into a fresh scratch file and open it
    fn decrypt_database(&self, keybag: &KeyBag) -> Result<ManifestIndex> {
        let db_path = self.directory.join(MANIFEST_DB);
        let key = match self.manifest_key()? {
            Some(key) => key,
            None => return ManifestIndex::open(&db_path),
        };

        // Step 1: Unwrap the manifest key and decrypt
        let file_key = self.cipher.unwrap_with_class(&key, keybag)?;
        let ciphertext = fs::read(&db_path)?;
        let plaintext = self.cipher.decrypt_with_key(&file_key, &ciphertext, None)?;

        // Step 2: Keep the plaintext as a scratch file the catalog owns
        let mut scratch = tempfile::Builder::new()
            .prefix("Manifest-")
            .suffix(".db")
            .tempfile_in(self.scratch.path())?;
        scratch.write_all(&plaintext)?;
        scratch.flush()?;
        let (_, path) = scratch.keep().map_err(|e| BackupError::Io(e.error))?;

        debug!(
            bytes = plaintext.len(),
            path = %path.display(),
            "decrypted manifest database"
        );
        ManifestIndex::open(&path)
    }

    /// Seal the decrypted catalog copy back into `Manifest.db`.
    ///
    /// Call after [`BackupEntry::replace_with`] or
    /// [`BackupEntry::delete`]. A no-op for plain backups.
    pub fn re_encrypt_database(&self) -> Result<()> {
        let key = match self.manifest_key()? {
            Some(key) if self.is_encrypted() => key,
            _ => return Ok(()),
        };
        let index = self.index()?;
        let keybag = self.require_keybag()?;

        // Step 1: Snapshot the catalog with all committed edits
        let file_key = self.cipher.unwrap_with_class(&key, keybag)?;
        let plaintext = index.snapshot_bytes()?;
        let sealed = self
            .cipher
            .encrypt_with_key(&plaintext, key.class, &file_key, keybag)?;

        // Step 2: Swap the sealed copy in atomically
        let target = self.directory.join(MANIFEST_DB);
        let mut staging = NamedTempFile::new_in(&self.directory)?;
        staging.write_all(&sealed.ciphertext)?;
        staging.as_file().sync_all()?;
        staging.persist(&target).map_err(|e| BackupError::Io(e.error))?;

        info!(bytes = plaintext.len(), "re-encrypted manifest database");
        Ok(())
    }

    /// The catalog, or `NotUnlocked` for a locked backup
    pub fn index(&self) -> Result<&ManifestIndex> {
        self.index
            .get()
            .ok_or_else(|| BackupError::NotUnlocked("backup must be unlocked first".to_string()))
    }

    pub(crate) fn require_keybag(&self) -> Result<&KeyBag> {
        self.keybag
            .as_ref()
            .ok_or_else(|| BackupError::BackupRead("backup has no keybag".to_string()))
    }

    fn entries(&self, records: Vec<FileRecord>) -> Vec<BackupEntry<'_>> {
        records
            .into_iter()
            .map(|record| BackupEntry::new(self, record))
            .collect()
    }

    pub fn query_domain_roots(&self) -> Result<Vec<BackupEntry<'_>>> {
        Ok(self.entries(self.index()?.query_domain_roots()?))
    }

    pub fn query_domain_files(&self, recursive: bool, domains: &[&str]) -> Result<Vec<BackupEntry<'_>>> {
        Ok(self.entries(self.index()?.query_domain_files(recursive, domains)?))
    }

    pub fn query_all_children(&self, domain: &str, path: &str) -> Result<Vec<BackupEntry<'_>>> {
        Ok(self.entries(self.index()?.query_all_children(domain, path)?))
    }

    pub fn search_files(&self, domain_pattern: &str, path_pattern: &str) -> Result<Vec<BackupEntry<'_>>> {
        Ok(self.entries(self.index()?.search_files(domain_pattern, path_pattern)?))
    }

    pub fn search_files_multi_pattern(
        &self,
        domain_pattern: &str,
        path_patterns: &[&str],
    ) -> Result<Vec<BackupEntry<'_>>> {
        Ok(self.entries(
            self.index()?
                .search_files_multi_pattern(domain_pattern, path_patterns)?,
        ))
    }

    pub fn query_file_stats(&self) -> Result<FileStats> {
        self.index()?.query_file_stats()
    }

    /// Entry at `(domain, relative_path)`, or `FileNotFound`
    pub fn find_file(&self, domain: &str, relative_path: &str) -> Result<BackupEntry<'_>> {
        self.index()?
            .get_by_path(domain, relative_path)?
            .map(|record| BackupEntry::new(self, record))
            .ok_or_else(|| BackupError::FileNotFound(format!("{}:{}", domain, relative_path)))
    }

    /// Entry with the given file ID, or `FileNotFound`
    pub fn file_by_id(&self, file_id: &str) -> Result<BackupEntry<'_>> {
        self.index()?
            .get_by_id(file_id)?
            .map(|record| BackupEntry::new(self, record))
            .ok_or_else(|| BackupError::FileNotFound(file_id.to_string()))
    }

    /// File ID the backup uses for `(domain, relative_path)`
    pub fn file_id_for(domain: &str, relative_path: &str) -> String {
        file_id_for(domain, relative_path)
    }

    /// Close the catalog and remove all decrypted scratch copies
    pub fn close(self) -> Result<()> {
        if let Some(index) = self.index.into_inner() {
            index.close()?;
        }
        self.scratch.close()?;
        debug!(path = %self.directory.display(), "closed backup");
        Ok(())
    }
}
