//! Transactional catalog over `Manifest.db`
//!
//! The catalog is the `Files` table:
//!
//! ```sql
//! CREATE TABLE Files (fileID TEXT PRIMARY KEY, domain TEXT,
//!                     relativePath TEXT, flags INTEGER, file BLOB);
//! ```
//!
//! All access goes through one connection behind a mutex. Reads that issue
//! more than one statement run inside a single deferred transaction so they
//! observe one snapshot; mutations take an immediate transaction and commit
//! explicitly.

use crate::error::{BackupError, Result};
use crate::manifest::keyed_archive::KeyedArchive;
use crate::manifest::record::{keys, EncryptionKey, FileRecord, FileType};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

const RECORD_COLUMNS: &str = "fileID, domain, relativePath, flags, file";

/// `(total_files, total_bytes)` over regular file records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub total_files: u64,
    /// `-1` when at least one file has no size metadata
    pub total_bytes: i64,
}

/// Raw `Files` row before metadata decoding
type RawRow = (String, String, String, i64, Option<Vec<u8>>);

/// Catalog over one `Manifest.db` file
#[derive(Debug)]
pub struct ManifestIndex {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl ManifestIndex {
    /// Open an existing manifest database.
    ///
    /// Fails with [`BackupError::BackupRead`] when the file is not a SQLite
    /// database or lacks the `Files` table (e.g. still encrypted).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Step 1: Open read-write; the mutex serializes access
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| BackupError::BackupRead(format!("{}: {}", path.display(), e)))?;

        // Step 2: Reject anything without a Files table
        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'Files'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| BackupError::BackupRead(format!("{}: {}", path.display(), e)))?;
        if tables == 0 {
            return Err(BackupError::BackupRead(format!(
                "{} has no Files table",
                path.display()
            )));
        }

        debug!(path = %path.display(), "opened manifest index");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the database file backing this index
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` inside one read transaction
    pub fn with_read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` inside one write transaction, committing on success
    pub fn with_write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// One record per domain (relative path `""`)
    pub fn query_domain_roots(&self) -> Result<Vec<FileRecord>> {
        self.with_read(|conn| {
            query_records(
                conn,
                &format!(
                    "SELECT {} FROM Files WHERE relativePath = '' ORDER BY domain",
                    RECORD_COLUMNS
                ),
                params![],
            )
        })
    }

    /// Every record in the given domains.
    ///
    /// With `recursive`, a domain `d` also matches its sub-domains `d-*`
    /// (`AppDomain` matches `AppDomain-com.example.app`).
    pub fn query_domain_files(&self, recursive: bool, domains: &[&str]) -> Result<Vec<FileRecord>> {
        if domains.is_empty() {
            return Ok(Vec::new());
        }

        let clauses: Vec<String> = (1..=domains.len())
            .map(|i| {
                if recursive {
                    format!(
                        "(domain = ?{i} OR substr(domain, 1, length(?{i}) + 1) = ?{i} || '-')",
                        i = i
                    )
                } else {
                    format!("domain = ?{}", i)
                }
            })
            .collect();

        let sql = format!(
            "SELECT {} FROM Files WHERE {} ORDER BY domain, relativePath",
            RECORD_COLUMNS,
            clauses.join(" OR ")
        );

        self.with_read(|conn| query_records(conn, &sql, params_from_iter(domains.iter())))
    }

    /// `path` itself and everything below it; the whole domain for `""`
    pub fn query_all_children(&self, domain: &str, path: &str) -> Result<Vec<FileRecord>> {
        self.with_read(|conn| {
            if path.is_empty() {
                query_records(
                    conn,
                    &format!(
                        "SELECT {} FROM Files WHERE domain = ?1 ORDER BY relativePath",
                        RECORD_COLUMNS
                    ),
                    params![domain],
                )
            } else {
                query_records(
                    conn,
                    &format!(
                        "SELECT {} FROM Files WHERE domain = ?1 AND (relativePath = ?2 \
                         OR substr(relativePath, 1, length(?2) + 1) = ?2 || '/') \
                         ORDER BY relativePath",
                        RECORD_COLUMNS
                    ),
                    params![domain, path],
                )
            }
        })
    }

    /// SQL `LIKE` search over domain and relative path.
    ///
    /// Empty patterns match everything.
    pub fn search_files(&self, domain_pattern: &str, path_pattern: &str) -> Result<Vec<FileRecord>> {
        self.with_read(|conn| search(conn, domain_pattern, path_pattern))
    }

    /// Union of [`search_files`](Self::search_files) over several path
    /// patterns, deduplicated by file ID in first-seen order
    pub fn search_files_multi_pattern(
        &self,
        domain_pattern: &str,
        path_patterns: &[&str],
    ) -> Result<Vec<FileRecord>> {
        self.with_read(|conn| {
            let mut seen = HashSet::new();
            let mut results = Vec::new();
            for pattern in path_patterns {
                for record in search(conn, domain_pattern, pattern)? {
                    if seen.insert(record.file_id.clone()) {
                        results.push(record);
                    }
                }
            }
            Ok(results)
        })
    }

    /// Count and total size of regular files
    pub fn query_file_stats(&self) -> Result<FileStats> {
        let records = self.with_read(|conn| {
            query_records(
                conn,
                &format!("SELECT {} FROM Files WHERE flags = ?1", RECORD_COLUMNS),
                params![FileType::File.flags()],
            )
        })?;

        // Any unsized file makes the total unknown
        let mut total_bytes: Option<i64> = Some(0);
        for record in &records {
            total_bytes = match (total_bytes, record.size) {
                (Some(sum), Some(size)) => {
                    Some(sum.saturating_add(i64::try_from(size).unwrap_or(i64::MAX)))
                }
                _ => None,
            };
        }

        Ok(FileStats {
            total_files: records.len() as u64,
            total_bytes: total_bytes.unwrap_or(-1),
        })
    }

    pub fn get_by_id(&self, file_id: &str) -> Result<Option<FileRecord>> {
        self.with_read(|conn| {
            query_records(
                conn,
                &format!("SELECT {} FROM Files WHERE fileID = ?1", RECORD_COLUMNS),
                params![file_id],
            )
            .map(|records| records.into_iter().next())
        })
    }

    pub fn get_by_path(&self, domain: &str, relative_path: &str) -> Result<Option<FileRecord>> {
        self.with_read(|conn| {
            query_records(
                conn,
                &format!(
                    "SELECT {} FROM Files WHERE domain = ?1 AND relativePath = ?2",
                    RECORD_COLUMNS
                ),
                params![domain, relative_path],
            )
            .map(|records| records.into_iter().next())
        })
    }

    /// Rewrite `Size`, `LastModified` and optionally `EncryptionKey` in a
    /// record's archived metadata
    pub fn update_file_properties(
        &self,
        file_id: &str,
        size: u64,
        last_modified: i64,
        encryption_key: Option<&EncryptionKey>,
    ) -> Result<()> {
        self.update_file_properties_then(file_id, size, last_modified, encryption_key, || Ok(()))
    }

    /// [`update_file_properties`](Self::update_file_properties), running
    /// `before_commit` inside the same transaction.
    ///
    /// The row change is rolled back when `before_commit` fails, so callers
    /// can make an on-disk change and the catalog update land together.
    pub fn update_file_properties_then(
        &self,
        file_id: &str,
        size: u64,
        last_modified: i64,
        encryption_key: Option<&EncryptionKey>,
        before_commit: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        self.with_write(|conn| {
            // Step 1: Load the archived metadata
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT file FROM Files WHERE fileID = ?1",
                    params![file_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| BackupError::FileNotFound(file_id.to_string()))?;

            let blob = blob.ok_or_else(|| {
                BackupError::BackupRead(format!("{} has no metadata to update", file_id))
            })?;
            let mut archive = KeyedArchive::from_bytes(&blob)?;

            // Step 2: Patch the root object
            let size = i64::try_from(size)
                .map_err(|_| BackupError::BackupRead(format!("size {} out of range", size)))?;
            archive.set_root_integer(keys::SIZE, size)?;
            archive.set_root_integer(keys::LAST_MODIFIED, last_modified)?;
            if let Some(key) = encryption_key {
                archive.set_root_integer(keys::PROTECTION_CLASS, i64::from(key.class.0))?;
                archive.set_root_data(keys::ENCRYPTION_KEY, key.encode())?;
            }

            // Step 3: Write it back, then let the caller finish before commit
            conn.execute(
                "UPDATE Files SET file = ?1 WHERE fileID = ?2",
                params![archive.to_bytes()?, file_id],
            )?;
            before_commit()?;
            debug!(file_id, size, "updated file properties");
            Ok(())
        })
    }

    /// Remove a record. Returns whether a row was deleted.
    pub fn delete_record(&self, file_id: &str) -> Result<bool> {
        self.with_write(|conn| {
            let deleted = conn.execute("DELETE FROM Files WHERE fileID = ?1", params![file_id])?;
            Ok(deleted > 0)
        })
    }

    /// Read the database file while no statement can write to it.
    ///
    /// Committed pages still sitting in a `-wal` companion are folded into
    /// the main file first, so the bytes hold every committed edit.
    pub(crate) fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        let conn = self.lock();

        // Outside WAL mode this reports (0, -1, -1) and does nothing
        let (busy, log_frames, checkpointed): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        if busy != 0 {
            return Err(BackupError::BackupWrite(format!(
                "{}: checkpoint blocked, {} of {} WAL frames copied",
                self.path.display(),
                checkpointed,
                log_frames
            )));
        }

        let bytes = std::fs::read(&self.path)?;
        debug!(bytes = bytes.len(), log_frames, "took manifest snapshot");
        Ok(bytes)
    }

    /// Close the connection, reporting errors instead of swallowing them
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, e)| BackupError::Database(e))
    }
}

fn search(conn: &Connection, domain_pattern: &str, path_pattern: &str) -> Result<Vec<FileRecord>> {
    query_records(
        conn,
        &format!(
            "SELECT {} FROM Files WHERE domain LIKE ?1 AND relativePath LIKE ?2 \
             ORDER BY domain, relativePath",
            RECORD_COLUMNS
        ),
        params![normalize_pattern(domain_pattern), normalize_pattern(path_pattern)],
    )
}

fn normalize_pattern(pattern: &str) -> &str {
    if pattern.is_empty() {
        "%"
    } else {
        pattern
    }
}

fn query_records<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?
        .collect::<std::result::Result<Vec<RawRow>, _>>()?;

    rows.into_iter()
        .map(|(file_id, domain, relative_path, flags, metadata)| {
            FileRecord::from_row(file_id, domain, relative_path, flags, metadata.as_deref())
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::manifest::record::file_id_for;
    use plist::{Dictionary, Value};
    use tempfile::TempDir;

    pub(crate) fn create_schema(conn: &Connection) {
        conn.execute_batch(
            "CREATE TABLE Files (fileID TEXT PRIMARY KEY, domain TEXT, relativePath TEXT, \
             flags INTEGER, file BLOB);
             CREATE INDEX FilesDomainIdx ON Files(domain);
             CREATE INDEX FilesRelativePathIdx ON Files(relativePath);
             CREATE TABLE Properties (key TEXT PRIMARY KEY, value BLOB);",
        )
        .unwrap();
    }

    pub(crate) fn metadata(size: Option<u64>) -> Vec<u8> {
        let mut root = Dictionary::new();
        if let Some(size) = size {
            root.insert("Size".into(), Value::from(size as i64));
        }
        root.insert("LastModified".into(), Value::from(1_600_000_000i64));
        KeyedArchive::with_root(root).to_bytes().unwrap()
    }

    pub(crate) fn insert(conn: &Connection, domain: &str, path: &str, file_type: FileType, size: Option<u64>) {
        conn.execute(
            "INSERT INTO Files (fileID, domain, relativePath, flags, file) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file_id_for(domain, path),
                domain,
                path,
                file_type.flags(),
                metadata(size)
            ],
        )
        .unwrap();
    }

    fn fixture() -> (TempDir, ManifestIndex) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Manifest.db");
        {
            let conn = Connection::open(&path).unwrap();
            create_schema(&conn);
            insert(&conn, "HomeDomain", "", FileType::Directory, None);
            insert(&conn, "HomeDomain", "Library", FileType::Directory, None);
            insert(&conn, "HomeDomain", "Library/Notes", FileType::Directory, None);
            insert(&conn, "HomeDomain", "Library/Notes/notes.sqlite", FileType::File, Some(10));
            insert(&conn, "HomeDomain", "Library/Notes2/other.txt", FileType::File, Some(20));
            insert(&conn, "AppDomain-com.example.app", "", FileType::Directory, None);
            insert(&conn, "AppDomain-com.example.app", "Documents/photo.JPG", FileType::File, Some(30));
            insert(&conn, "AppDomain-com.example.app", "Documents/link", FileType::SymbolicLink, None);
            insert(&conn, "AppDomainGroup-group.example", "", FileType::Directory, None);
            insert(&conn, "App_Domain", "x", FileType::Directory, None);
        }
        let index = ManifestIndex::open(&path).unwrap();
        (dir, index)
    }

    fn paths(records: &[FileRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| format!("{}:{}", r.domain, r.relative_path))
            .collect()
    }

    #[test]
    fn test_open_rejects_non_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Manifest.db");
        std::fs::write(&path, vec![0x5Au8; 4096]).unwrap();

        assert!(matches!(ManifestIndex::open(&path), Err(BackupError::BackupRead(_))));
    }

    #[test]
    fn test_open_rejects_missing_files_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Manifest.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE Other (x INTEGER);")
            .unwrap();

        assert!(matches!(ManifestIndex::open(&path), Err(BackupError::BackupRead(_))));
    }

    #[test]
    fn test_domain_roots() {
        let (_dir, index) = fixture();
        let roots = index.query_domain_roots().unwrap();
        assert_eq!(
            paths(&roots),
            vec![
                "AppDomain-com.example.app:",
                "AppDomainGroup-group.example:",
                "HomeDomain:"
            ]
        );
    }

    #[test]
    fn test_domain_files_recursive_includes_subdomains_only() {
        let (_dir, index) = fixture();

        let flat = index.query_domain_files(false, &["AppDomain"]).unwrap();
        assert!(flat.is_empty());

        let recursive = index.query_domain_files(true, &["AppDomain"]).unwrap();
        assert_eq!(recursive.len(), 3);
        assert!(recursive.iter().all(|r| r.domain == "AppDomain-com.example.app"));

        // Underscore is not a wildcard
        let literal = index.query_domain_files(true, &["App_Domain"]).unwrap();
        assert_eq!(paths(&literal), vec!["App_Domain:x"]);
    }

    #[test]
    fn test_domain_files_multiple_domains_ordered() {
        let (_dir, index) = fixture();
        let records = index
            .query_domain_files(false, &["HomeDomain", "AppDomainGroup-group.example"])
            .unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records[0].domain, "AppDomainGroup-group.example");
        assert!(index.query_domain_files(true, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_all_children_stops_at_path_boundary() {
        let (_dir, index) = fixture();
        let children = index.query_all_children("HomeDomain", "Library/Notes").unwrap();
        assert_eq!(
            paths(&children),
            vec!["HomeDomain:Library/Notes", "HomeDomain:Library/Notes/notes.sqlite"]
        );

        let everything = index.query_all_children("HomeDomain", "").unwrap();
        assert_eq!(everything.len(), 5);
    }

    #[test]
    fn test_search_empty_pattern_matches_everything() {
        let (_dir, index) = fixture();
        let all = index.search_files("%", "%").unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(index.search_files("", "").unwrap(), all);
    }

    #[test]
    fn test_search_is_case_insensitive_like() {
        let (_dir, index) = fixture();
        let photos = index.search_files("AppDomain-%", "%.jpg").unwrap();
        assert_eq!(paths(&photos), vec!["AppDomain-com.example.app:Documents/photo.JPG"]);
    }

    #[test]
    fn test_multi_pattern_dedupes_in_first_seen_order() {
        let (_dir, index) = fixture();
        let records = index
            .search_files_multi_pattern("HomeDomain", &["%.txt", "Library/%", "%.sqlite"])
            .unwrap();

        let ids: HashSet<_> = records.iter().map(|r| r.file_id.clone()).collect();
        assert_eq!(ids.len(), records.len());
        assert_eq!(
            paths(&records),
            vec![
                "HomeDomain:Library/Notes2/other.txt",
                "HomeDomain:Library/Notes",
                "HomeDomain:Library/Notes/notes.sqlite"
            ]
        );
    }

    #[test]
    fn test_file_stats_ignore_directories() {
        let (_dir, index) = fixture();
        let stats = index.query_file_stats().unwrap();
        assert_eq!(
            stats,
            FileStats {
                total_files: 3,
                total_bytes: 60
            }
        );
    }

    #[test]
    fn test_file_stats_unknown_size() {
        let (dir, index) = fixture();
        drop(index);
        {
            let conn = Connection::open(dir.path().join("Manifest.db")).unwrap();
            insert(&conn, "HomeDomain", "unsized.bin", FileType::File, None);
        }
        let index = ManifestIndex::open(dir.path().join("Manifest.db")).unwrap();
        let stats = index.query_file_stats().unwrap();
        assert_eq!(stats.total_files, 4);
        assert_eq!(stats.total_bytes, -1);
    }

    #[test]
    fn test_lookups_agree() {
        let (_dir, index) = fixture();
        let by_path = index
            .get_by_path("HomeDomain", "Library/Notes/notes.sqlite")
            .unwrap()
            .unwrap();
        let by_id = index.get_by_id(&by_path.file_id).unwrap().unwrap();
        assert_eq!(by_path, by_id);
        assert_eq!(by_id.size(), Some(10));

        assert!(index.get_by_id("missing").unwrap().is_none());
        assert!(index.get_by_path("HomeDomain", "missing").unwrap().is_none());
    }

    #[test]
    fn test_update_file_properties() {
        let (_dir, index) = fixture();
        let id = file_id_for("HomeDomain", "Library/Notes2/other.txt");
        let key = EncryptionKey {
            class: crate::crypto::ProtectionClass(3),
            wrapped: vec![7; 40],
        };

        index.update_file_properties(&id, 99, 1_700_000_000, Some(&key)).unwrap();

        let record = index.get_by_id(&id).unwrap().unwrap();
        assert_eq!(record.size(), Some(99));
        assert_eq!(record.last_modified, Some(1_700_000_000));
        assert_eq!(record.encryption_key, Some(key));

        assert!(matches!(
            index.update_file_properties("missing", 1, 1, None),
            Err(BackupError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_failed_hook_rolls_back_update() {
        let (_dir, index) = fixture();
        let id = file_id_for("HomeDomain", "Library/Notes2/other.txt");

        let result = index.update_file_properties_then(&id, 99, 1_700_000_000, None, || {
            Err(BackupError::PathError("blob could not be placed".to_string()))
        });
        assert!(matches!(result, Err(BackupError::PathError(_))));

        let record = index.get_by_id(&id).unwrap().unwrap();
        assert_eq!(record.size(), Some(20));
        assert_eq!(record.last_modified, Some(1_600_000_000));
    }

    #[test]
    fn test_snapshot_includes_wal_frames() {
        let (dir, index) = fixture();
        let path = dir.path().join("Manifest.db");
        {
            let conn = Connection::open(&path).unwrap();
            let mode: String = conn
                .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
                .unwrap();
            assert_eq!(mode, "wal");
        }

        let id = file_id_for("HomeDomain", "Library/Notes2/other.txt");
        assert!(index.delete_record(&id).unwrap());

        let copy = dir.path().join("snapshot.db");
        std::fs::write(&copy, index.snapshot_bytes().unwrap()).unwrap();
        let snapshot = ManifestIndex::open(&copy).unwrap();
        assert!(snapshot.get_by_id(&id).unwrap().is_none());
        assert_eq!(snapshot.query_file_stats().unwrap().total_files, 2);
    }

    #[test]
    fn test_delete_record() {
        let (_dir, index) = fixture();
        let id = file_id_for("HomeDomain", "Library/Notes2/other.txt");

        assert!(index.delete_record(&id).unwrap());
        assert!(!index.delete_record(&id).unwrap());
        assert!(index.get_by_id(&id).unwrap().is_none());
        // No cascade to siblings
        assert!(index
            .get_by_path("HomeDomain", "Library/Notes/notes.sqlite")
            .unwrap()
            .is_some());
        index.close().unwrap();
    }
}
