//! SQLite databases stored inside a backup
//!
//! Apps keep most of their state in SQLite files (`ChatStorage.sqlite`,
//! `sms.db`, ...). These helpers locate such a file by domain and path
//! pattern, extract it together with its `-wal` / `-shm` companions into a
//! private temp directory and open a connection on the copy.

use crate::backup::{Backup, BackupEntry};
use crate::config::ExtractOptions;
use crate::error::{BackupError, Result};
use crate::manifest::FileType;
use rusqlite::backup::Backup as SqliteBackup;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::debug;

const DATABASE_PATTERNS: &[&str] = &["%.db", "%.sqlite", "%.sqlite3", "%.storedata"];
const COMPANION_SUFFIXES: &[&str] = &["-wal", "-shm"];

/// Access to SQLite databases of an unlocked backup
pub struct BackupVfs<'a> {
    backup: &'a Backup,
    temp_dir: Option<TempDir>,
    extracted: Vec<(String, PathBuf)>,
}

impl<'a> BackupVfs<'a> {
    pub fn new(backup: &'a Backup) -> Self {
        Self {
            backup,
            temp_dir: None,
            extracted: Vec::new(),
        }
    }

    /// All SQLite-looking files in matching domains
    pub fn list_databases(&self, domain_pattern: &str) -> Result<Vec<BackupEntry<'a>>> {
        Ok(self
            .backup
            .search_files_multi_pattern(domain_pattern, DATABASE_PATTERNS)?
            .into_iter()
            .filter(|entry| entry.file_type == FileType::File)
            .collect())
    }

    /// First regular file matching both patterns
    pub fn locate_database(&self, domain_pattern: &str, path_pattern: &str) -> Result<BackupEntry<'a>> {
        self.backup
            .search_files(domain_pattern, path_pattern)?
            .into_iter()
            .find(|entry| entry.file_type == FileType::File)
            .ok_or_else(|| {
                BackupError::FileNotFound(format!("database {}:{}", domain_pattern, path_pattern))
            })
    }

    /// Extract a database (and its companions) and open it read-only.
    ///
    /// The copy lives until the `BackupVfs` is dropped.
    pub fn open_database(&mut self, entry: &BackupEntry<'_>) -> Result<Connection> {
        let path = self.extract_database(entry)?;
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA query_only = ON;")?;
        Ok(conn)
    }

    /// Copy a database into memory via the SQLite backup API
    pub fn open_database_in_memory(&mut self, entry: &BackupEntry<'_>) -> Result<Connection> {
        let path = self.extract_database(entry)?;
        let source = Connection::open(&path)?;
        let mut memory = Connection::open_in_memory()?;
        {
            let copy = SqliteBackup::new(&source, &mut memory)?;
            copy.run_to_completion(64, Duration::from_millis(10), None)?;
        }
        Ok(memory)
    }

    /// Whether the database with this file ID was already extracted
    pub fn is_extracted(&self, file_id: &str) -> bool {
        self.extracted.iter().any(|(id, _)| id == file_id)
    }

    pub fn extracted_path(&self, file_id: &str) -> Option<&Path> {
        self.extracted
            .iter()
            .find(|(id, _)| id == file_id)
            .map(|(_, path)| path.as_path())
    }

    fn extract_database(&mut self, entry: &BackupEntry<'_>) -> Result<PathBuf> {
        if let Some(path) = self.extracted_path(&entry.file_id) {
            return Ok(path.to_path_buf());
        }

        let dir = match self.temp_dir.take() {
            Some(dir) => dir,
            None => tempfile::Builder::new().prefix("ibackup-vfs-").tempdir()?,
        };
        let temp_dir = dir.path().to_path_buf();
        self.temp_dir = Some(dir);

        let options = ExtractOptions {
            overwrite: true,
            preserve_timestamps: false,
            fix_padding: false,
            with_relative_path: false,
        };

        let target = temp_dir.join(format!("{}-{}", &entry.file_id, entry.file_name()));
        entry.extract_with(&target, &options)?;

        for suffix in COMPANION_SUFFIXES {
            let companion_path = format!("{}{}", entry.relative_path, suffix);
            match self.backup.find_file(&entry.domain, &companion_path) {
                Ok(companion) => {
                    let mut companion_target = target.clone().into_os_string();
                    companion_target.push(suffix);
                    companion.extract_with(PathBuf::from(companion_target), &options)?;
                    debug!(path = %companion_path, "extracted database companion");
                }
                Err(BackupError::FileNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        debug!(
            domain = %entry.domain,
            path = %entry.relative_path,
            copy = %target.display(),
            "extracted database"
        );
        self.extracted.push((entry.file_id.clone(), target.clone()));
        Ok(target)
    }
}
