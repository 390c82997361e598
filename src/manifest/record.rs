//! One row of the `Files` table, decoded

use crate::crypto::ProtectionClass;
use crate::error::{BackupError, Result};
use crate::manifest::keyed_archive::KeyedArchive;
use sha1::{Digest, Sha1};
use std::fmt;
use std::path::{Path, PathBuf};

/// Metadata keys of the archived `MBFile` object
pub(crate) mod keys {
    pub const SIZE: &str = "Size";
    pub const PROTECTION_CLASS: &str = "ProtectionClass";
    pub const ENCRYPTION_KEY: &str = "EncryptionKey";
    pub const TARGET: &str = "Target";
    pub const LAST_MODIFIED: &str = "LastModified";
    pub const BIRTH: &str = "Birth";
    pub const MODE: &str = "Mode";
}

/// Kind of a manifest entry, stored in `Files.flags`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    File,
    Directory,
    SymbolicLink,
}

impl FileType {
    pub fn from_flags(flags: i64) -> Result<Self> {
        match flags {
            1 => Ok(FileType::File),
            2 => Ok(FileType::Directory),
            4 => Ok(FileType::SymbolicLink),
            other => Err(BackupError::UnsupportedFileType(other)),
        }
    }

    pub fn flags(self) -> i64 {
        match self {
            FileType::File => 1,
            FileType::Directory => 2,
            FileType::SymbolicLink => 4,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::File => "file",
            FileType::Directory => "directory",
            FileType::SymbolicLink => "symlink",
        };
        f.write_str(name)
    }
}

/// A wrapped key tagged with the protection class that wraps it.
///
/// Serialized as a 4-byte little-endian class followed by the AES
/// key-wrapped key. Used for both per-file keys and the manifest key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub class: ProtectionClass,
    pub wrapped: Vec<u8>,
}

impl EncryptionKey {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= 4 {
            return Err(BackupError::BackupRead(format!(
                "encryption key blob too short ({} bytes)",
                bytes.len()
            )));
        }
        let class = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(Self {
            class: ProtectionClass(class),
            wrapped: bytes[4..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.wrapped.len());
        out.extend_from_slice(&self.class.0.to_le_bytes());
        out.extend_from_slice(&self.wrapped);
        out
    }
}

/// Blob name of a `(domain, relative path)` pair: `hex(SHA1("domain-path"))`
pub fn file_id_for(domain: &str, relative_path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(domain.as_bytes());
    hasher.update(b"-");
    hasher.update(relative_path.as_bytes());
    hex::encode(hasher.finalize())
}

/// A manifest entry with its decoded metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: String,
    pub domain: String,
    pub relative_path: String,
    pub file_type: FileType,
    pub size: Option<u64>,
    pub protection_class: Option<ProtectionClass>,
    pub encryption_key: Option<EncryptionKey>,
    pub symlink_target: Option<String>,
    pub last_modified: Option<i64>,
    pub birth: Option<i64>,
    pub mode: Option<u32>,
}

impl FileRecord {
    /// Decode a `Files` row; `metadata` is the archived `MBFile` blob
    pub fn from_row(
        file_id: String,
        domain: String,
        relative_path: String,
        flags: i64,
        metadata: Option<&[u8]>,
    ) -> Result<Self> {
        let file_type = FileType::from_flags(flags)?;
        let mut record = Self {
            file_id,
            domain,
            relative_path,
            file_type,
            size: None,
            protection_class: None,
            encryption_key: None,
            symlink_target: None,
            last_modified: None,
            birth: None,
            mode: None,
        };

        let metadata = match metadata {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Ok(record),
        };

        let archive = KeyedArchive::from_bytes(metadata).map_err(|e| {
            BackupError::BackupRead(format!("metadata of {}: {}", record.file_id, e))
        })?;

        record.size = archive.root_unsigned(keys::SIZE)?;
        record.encryption_key = archive
            .root_data(keys::ENCRYPTION_KEY)?
            .map(EncryptionKey::decode)
            .transpose()?;
        record.protection_class = archive
            .root_unsigned(keys::PROTECTION_CLASS)?
            .and_then(|class| u32::try_from(class).ok())
            .map(ProtectionClass)
            .or_else(|| record.encryption_key.as_ref().map(|key| key.class));
        record.symlink_target = archive.root_string(keys::TARGET)?.map(str::to_owned);
        record.last_modified = archive.root_integer(keys::LAST_MODIFIED)?;
        record.birth = archive.root_integer(keys::BIRTH)?;
        record.mode = archive
            .root_unsigned(keys::MODE)?
            .and_then(|mode| u32::try_from(mode).ok());

        Ok(record)
    }

    /// Whether this is the record of a domain itself (empty relative path)
    pub fn is_domain_root(&self) -> bool {
        self.relative_path.is_empty()
    }

    /// Last path segment, or the domain for a domain root
    pub fn file_name(&self) -> &str {
        if self.is_domain_root() {
            return &self.domain;
        }
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    /// Extension of the file name without the dot
    pub fn file_extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(dot) => Some(&name[dot + 1..]),
        }
    }

    /// Relative path of the parent directory (`""` at the domain root)
    pub fn parent_path(&self) -> &str {
        match self.relative_path.rfind('/') {
            Some(slash) => &self.relative_path[..slash],
            None => "",
        }
    }

    /// Location of the content blob under a backup directory
    pub fn blob_path(&self, backup_dir: &Path) -> PathBuf {
        let prefix = self.file_id.get(..2).unwrap_or(&self.file_id);
        backup_dir.join(prefix).join(&self.file_id)
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn symlink_target(&self) -> Option<&str> {
        self.symlink_target.as_deref()
    }
}
