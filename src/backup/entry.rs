use crate::backup::Backup;
use crate::config::ExtractOptions;
use crate::error::{BackupError, Result};
use crate::manifest::{FileRecord, FileType};
use crate::padding;
use filetime::FileTime;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// What an extraction produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    /// Regular file written with `size` bytes
    File { path: PathBuf, size: u64 },
    /// Directory created
    Directory(PathBuf),
    /// Symbolic link; nothing is written, the target is returned
    SymbolicLink(String),
}

/// A record bound to the backup it came from
#[derive(Debug, Clone)]
pub struct BackupEntry<'a> {
    backup: &'a Backup,
    record: FileRecord,
}

impl<'a> Deref for BackupEntry<'a> {
    type Target = FileRecord;

    fn deref(&self) -> &FileRecord {
        &self.record
    }
}

impl<'a> BackupEntry<'a> {
    pub(crate) fn new(backup: &'a Backup, record: FileRecord) -> Self {
        Self { backup, record }
    }

    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub fn into_record(self) -> FileRecord {
        self.record
    }

    pub fn backup(&self) -> &'a Backup {
        self.backup
    }

    /// Path of this entry's content blob
    pub fn content_path(&self) -> PathBuf {
        self.record.blob_path(self.backup.directory())
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.record.domain, self.record.relative_path)
    }

    fn require_file(&self) -> Result<()> {
        if self.record.file_type != FileType::File {
            return Err(BackupError::NotARegularFile(self.describe()));
        }
        Ok(())
    }

    /// Plaintext content of a regular file
    pub fn read_contents(&self) -> Result<Vec<u8>> {
        self.require_file()?;

        let path = self.content_path();
        let data = fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                BackupError::FileNotFound(format!("content of {} ({})", self.describe(), path.display()))
            }
            _ => BackupError::Io(e),
        })?;

        if !self.backup.is_encrypted() {
            return Ok(data);
        }
        let keybag = self.backup.require_keybag()?;
        self.backup.cipher().decrypt(&self.record, &data, keybag)
    }

    /// Extract to `destination`, never overwriting and without padding repair
    pub fn extract<P: AsRef<Path>>(&self, destination: P, preserve_timestamps: bool) -> Result<Extracted> {
        self.extract_with(
            destination,
            &ExtractOptions {
                preserve_timestamps,
                ..ExtractOptions::default()
            },
        )
    }

    /// Extract to `destination`.
    ///
    /// Directories are created, symbolic links only report their target and
    /// regular files are decrypted and written.
    pub fn extract_with<P: AsRef<Path>>(&self, destination: P, options: &ExtractOptions) -> Result<Extracted> {
        let destination = destination.as_ref();

        match self.record.file_type {
            FileType::Directory => {
                fs::create_dir_all(destination)?;
                Ok(Extracted::Directory(destination.to_path_buf()))
            }
            FileType::SymbolicLink => Ok(Extracted::SymbolicLink(
                self.record.symlink_target.clone().unwrap_or_default(),
            )),
            FileType::File => {
                if !options.overwrite && destination.exists() {
                    return Err(BackupError::FileAlreadyExists(destination.to_path_buf()));
                }
                let data = self.read_contents()?;
                self.write_file(destination, &data, options)
            }
        }
    }

    fn write_file(&self, destination: &Path, data: &[u8], options: &ExtractOptions) -> Result<Extracted> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut open = OpenOptions::new();
        open.write(true);
        if options.overwrite {
            open.create(true).truncate(true);
        } else {
            open.create_new(true);
        }
        let mut file = open.open(destination).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => BackupError::FileAlreadyExists(destination.to_path_buf()),
            _ => BackupError::Io(e),
        })?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        if options.fix_padding && padding::try_fix_padding(destination)? {
            debug!(path = %destination.display(), "repaired padding after extraction");
        }

        if options.preserve_timestamps {
            if let Some(modified) = self.record.last_modified {
                filetime::set_file_mtime(destination, FileTime::from_unix_time(modified, 0))?;
            }
        }

        let size = fs::metadata(destination)?.len();
        debug!(entry = %self.describe(), path = %destination.display(), size, "extracted file");
        Ok(Extracted::File {
            path: destination.to_path_buf(),
            size,
        })
    }

    /// Destination of this entry under an export root.
    ///
    /// `root/<domain>/<relative path>`, or `root/<domain>/<file name>`
    /// without the relative path. Paths that would escape the root are
    /// rejected with [`BackupError::PathError`].
    pub fn destination_in<P: AsRef<Path>>(&self, root: P, with_relative_path: bool) -> Result<PathBuf> {
        let mut destination = root.as_ref().to_path_buf();
        push_single_component(&mut destination, &self.record.domain)?;

        if self.record.is_domain_root() {
            return Ok(destination);
        }

        if with_relative_path {
            for component in Path::new(&self.record.relative_path).components() {
                match component {
                    Component::Normal(part) => destination.push(part),
                    Component::CurDir => {}
                    Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                        return Err(BackupError::PathError(format!(
                            "relative path escapes export root: {}",
                            self.describe()
                        )))
                    }
                }
            }
        } else {
            push_single_component(&mut destination, self.record.file_name())?;
        }
        Ok(destination)
    }

    pub fn extract_to_folder<P: AsRef<Path>>(
        &self,
        root: P,
        with_relative_path: bool,
        preserve_timestamps: bool,
    ) -> Result<Extracted> {
        self.extract_to_folder_with(
            root,
            &ExtractOptions {
                preserve_timestamps,
                with_relative_path,
                ..ExtractOptions::default()
            },
        )
    }

    pub fn extract_to_folder_with<P: AsRef<Path>>(&self, root: P, options: &ExtractOptions) -> Result<Extracted> {
        let destination = self.destination_in(root, options.with_relative_path)?;
        self.extract_with(destination, options)
    }

    /// Replace this file's content with the file at `source`.
    ///
    /// The blob is re-encrypted with the record's key (or a fresh one) and
    /// `Size`, `LastModified` and `EncryptionKey` are updated in the
    /// catalog. Encrypted backups need
    /// [`Backup::re_encrypt_database`] afterwards.
    pub fn replace_with<P: AsRef<Path>>(&mut self, source: P) -> Result<()> {
        self.require_file()?;
        let source = source.as_ref();

        let data = fs::read(source)?;
        let modified = fs::metadata(source)?
            .modified()
            .ok()
            .and_then(unix_seconds)
            .unwrap_or_else(now_seconds);
        self.store(&data, modified)
    }

    fn store(&mut self, data: &[u8], modified: i64) -> Result<()> {
        let backup = self.backup;
        let index = backup.index()?;

        let (blob, key) = if backup.is_encrypted() {
            let keybag = backup.require_keybag()?;
            let sealed = backup.cipher().encrypt(data, &self.record, keybag)?;
            (sealed.ciphertext, Some(sealed.encryption_key))
        } else {
            (data.to_vec(), None)
        };

        // Stage the blob next to its final location
        let path = self.content_path();
        let parent = path
            .parent()
            .ok_or_else(|| BackupError::PathError(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)?;
        let mut staging = NamedTempFile::new_in(parent)?;
        staging.write_all(&blob)?;
        staging.as_file().sync_all()?;

        // The blob only replaces the old one once the row update went
        // through; a failed persist rolls the row back
        let size = data.len() as u64;
        index.update_file_properties_then(&self.record.file_id, size, modified, key.as_ref(), || {
            staging
                .persist(&path)
                .map(|_| ())
                .map_err(|e| BackupError::Io(e.error))
        })?;

        self.record.size = Some(size);
        self.record.last_modified = Some(modified);
        if let Some(key) = key {
            self.record.protection_class = Some(key.class);
            self.record.encryption_key = Some(key);
        }

        info!(entry = %self.describe(), size, "replaced file content");
        Ok(())
    }

    /// Remove the catalog row and the content blob. Children are not touched.
    pub fn delete(self) -> Result<()> {
        let index = self.backup.index()?;
        if !index.delete_record(&self.record.file_id)? {
            return Err(BackupError::FileNotFound(self.describe()));
        }

        match fs::remove_file(self.content_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(entry = %self.describe(), "deleted entry");
        Ok(())
    }

    /// Strip legacy padding from the stored content.
    ///
    /// Decrypts into the scratch directory, runs the padding repair and
    /// stores the result when anything changed. Returns whether it did.
    pub fn repair_padding(&mut self) -> Result<bool> {
        let data = self.read_contents()?;

        let mut scratch = NamedTempFile::new_in(self.backup.scratch_dir())?;
        scratch.write_all(&data)?;
        scratch.flush()?;

        if !padding::try_fix_padding(scratch.path())? {
            return Ok(false);
        }

        let repaired = fs::read(scratch.path())?;
        debug!(
            entry = %self.describe(),
            from = data.len(),
            to = repaired.len(),
            "padding repaired"
        );
        let modified = self.record.last_modified.unwrap_or_else(now_seconds);
        self.store(&repaired, modified)?;
        Ok(true)
    }
}

fn push_single_component(path: &mut PathBuf, name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) => {
            path.push(part);
            Ok(())
        }
        _ => Err(BackupError::PathError(format!("invalid path component: {:?}", name))),
    }
}

fn unix_seconds(time: SystemTime) -> Option<i64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_secs()).ok())
}

fn now_seconds() -> i64 {
    unix_seconds(SystemTime::now()).unwrap_or(0)
}
