use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Unified error type for all backup operations
#[derive(Debug, Error)]
pub enum BackupError {
    // Archive errors
    #[error("Backup directory not found: {0}")]
    BackupNotFound(PathBuf),

    #[error("The backup could not be read: {0}")]
    BackupRead(String),

    #[error("The backup could not be written: {0}")]
    BackupWrite(String),

    #[error("File not found in backup: {0}")]
    FileNotFound(String),

    #[error("Unsupported file type flag in manifest: {0}")]
    UnsupportedFileType(i64),

    // Key errors
    #[error("The given password is not valid")]
    InvalidKey,

    #[error("Backup is locked: {0}")]
    NotUnlocked(String),

    #[error("Your system doesn't support the necessary cryptography: {0}")]
    UnsupportedCrypto(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    // Extraction errors
    #[error("File already exists: {}", .0.display())]
    FileAlreadyExists(PathBuf),

    #[error("Not a regular file: {0}")]
    NotARegularFile(String),

    #[error("Path error: {0}")]
    PathError(String),

    // Store errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Property list error: {0}")]
    Plist(#[from] plist::Error),

    #[error("Malformed keyed archive: {0}")]
    KeyedArchive(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for BackupError {
    fn from(err: toml::ser::Error) -> Self {
        BackupError::Config(err.to_string())
    }
}

impl BackupError {
    /// Whether the error is a per-item extraction conflict that a batch
    /// caller may choose to skip.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BackupError::FileAlreadyExists(_))
    }

    /// Whether retrying after an unlock could succeed.
    pub fn is_locked(&self) -> bool {
        matches!(self, BackupError::NotUnlocked(_))
    }
}
