//! Per-file content encryption
//!
//! Every file has its own random 256-bit key, AES key-wrapped under the key
//! of the file's protection class and stored in the record's metadata.
//! Content is AES-256-CBC with a zero IV and PKCS#7 padding.

use crate::crypto::{
    cbc_decrypt, cbc_decrypt_raw, cbc_encrypt, pkcs7_unpadded_len, unwrap_key, wrap_key,
    KeyBag, ProtectionClass, BLOCK_SIZE, KEY_SIZE, WRAPPED_KEY_SIZE,
};
use crate::error::{BackupError, Result};
use crate::manifest::{EncryptionKey, FileRecord};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// An unwrapped per-file (or manifest) content key
#[derive(Clone, PartialEq, Eq)]
pub struct FileKey([u8; KEY_SIZE]);

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Fresh random key from the OS generator
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileKey([REDACTED])")
    }
}

/// Result of encrypting a file for storage in the backup
#[derive(Debug, Clone)]
pub struct EncryptedContent {
    pub ciphertext: Vec<u8>,
    /// Key to store in the record's `EncryptionKey`
    pub encryption_key: EncryptionKey,
    /// Plaintext length, the record's new `Size`
    pub size: u64,
}

/// Applies class keys to file content.
///
/// The first operation runs a wrap/encrypt self-test; a failing
/// environment is reported as [`BackupError::UnsupportedCrypto`] on every
/// call instead of as an integrity failure.
#[derive(Debug, Default)]
pub struct FileCipher {
    support: OnceLock<std::result::Result<(), String>>,
}

impl FileCipher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check (once) that AES key-wrap and AES-CBC work here
    pub fn ensure_supported(&self) -> Result<()> {
        self.support
            .get_or_init(self_test)
            .clone()
            .map_err(BackupError::UnsupportedCrypto)
    }

    /// Unwrap a key tagged with its protection class
    pub fn unwrap_with_class(&self, key: &EncryptionKey, keybag: &KeyBag) -> Result<FileKey> {
        self.ensure_supported()?;
        let class_key = keybag.class_key(key.class).ok_or_else(|| {
            BackupError::NotUnlocked(format!("protection class {} is not available", key.class))
        })?;
        Ok(FileKey(unwrap_key(class_key.as_bytes(), &key.wrapped)?))
    }

    /// Unwrap the content key of a record
    pub fn unwrap_file_key(&self, record: &FileRecord, keybag: &KeyBag) -> Result<FileKey> {
        let key = record.encryption_key.as_ref().ok_or_else(|| {
            BackupError::BackupRead(format!(
                "{}:{} has no encryption key",
                record.domain, record.relative_path
            ))
        })?;
        self.unwrap_with_class(key, keybag)
    }

    /// Decrypt a record's blob
    pub fn decrypt(&self, record: &FileRecord, ciphertext: &[u8], keybag: &KeyBag) -> Result<Vec<u8>> {
        let key = self.unwrap_file_key(record, keybag)?;
        self.decrypt_with_key(&key, ciphertext, record.size)
    }

    /// Decrypt with an already unwrapped key.
    ///
    /// `declared_size` is the plaintext length recorded in the manifest.
    pub fn decrypt_with_key(
        &self,
        key: &FileKey,
        ciphertext: &[u8],
        declared_size: Option<u64>,
    ) -> Result<Vec<u8>> {
        self.ensure_supported()?;
        match declared_size {
            Some(_) => {
                let mut plaintext = cbc_decrypt_raw(key.as_bytes(), ciphertext)?;
                let len = resolve_plaintext_len(&plaintext, declared_size);
                plaintext.truncate(len);
                Ok(plaintext)
            }
            None => cbc_decrypt(key.as_bytes(), ciphertext),
        }
    }

    /// Encrypt content for a record.
    ///
    /// Reuses the record's file key when it has one, otherwise generates a
    /// fresh key for the record's protection class.
    pub fn encrypt(&self, plaintext: &[u8], record: &FileRecord, keybag: &KeyBag) -> Result<EncryptedContent> {
        self.ensure_supported()?;

        let (class, file_key) = match &record.encryption_key {
            Some(existing) => (existing.class, self.unwrap_with_class(existing, keybag)?),
            None => {
                let class = record.protection_class.ok_or_else(|| {
                    BackupError::BackupRead(format!(
                        "{}:{} has no protection class",
                        record.domain, record.relative_path
                    ))
                })?;
                debug!(file_id = %record.file_id, %class, "generating new file key");
                (class, FileKey::generate())
            }
        };

        self.encrypt_with_key(plaintext, class, &file_key, keybag)
    }

    /// Encrypt with a given content key, wrapping it under `class`
    pub fn encrypt_with_key(
        &self,
        plaintext: &[u8],
        class: ProtectionClass,
        file_key: &FileKey,
        keybag: &KeyBag,
    ) -> Result<EncryptedContent> {
        self.ensure_supported()?;
        let class_key = keybag.class_key(class).ok_or_else(|| {
            BackupError::NotUnlocked(format!("protection class {} is not available", class))
        })?;

        let wrapped = wrap_key(class_key.as_bytes(), file_key.as_bytes())?;
        let ciphertext = cbc_encrypt(file_key.as_bytes(), plaintext)?;

        Ok(EncryptedContent {
            ciphertext,
            encryption_key: EncryptionKey {
                class,
                wrapped: wrapped.to_vec(),
            },
            size: plaintext.len() as u64,
        })
    }

    #[cfg(test)]
    pub(crate) fn failing(reason: &str) -> Self {
        let support = OnceLock::new();
        let _ = support.set(Err(reason.to_string()));
        Self { support }
    }
}

/// Plaintext length of decrypted (still padded) content.
///
/// The declared size wins when it matches the PKCS#7 length or lies within
/// the last cipher block; otherwise a valid PKCS#7 tail is stripped.
pub fn resolve_plaintext_len(plaintext: &[u8], declared_size: Option<u64>) -> usize {
    let len = plaintext.len();
    let padded = pkcs7_unpadded_len(plaintext);

    let declared = match declared_size.and_then(|size| usize::try_from(size).ok()) {
        Some(declared) => declared,
        None => return padded.unwrap_or(len),
    };

    if padded == Some(declared) {
        return declared;
    }
    if declared <= len && declared.saturating_add(BLOCK_SIZE) > len {
        return declared;
    }

    warn!(
        declared,
        decrypted = len,
        "declared size does not match decrypted content"
    );
    padded.unwrap_or(len)
}

fn self_test() -> std::result::Result<(), String> {
    const PROBE: &[u8] = b"backup cipher capability probe";
    let kek = [0x5C; KEY_SIZE];
    let key = [0xA3; KEY_SIZE];

    let wrapped = wrap_key(&kek, &key).map_err(|e| e.to_string())?;
    if wrapped.len() != WRAPPED_KEY_SIZE || unwrap_key(&kek, &wrapped).map_err(|e| e.to_string())? != key {
        return Err("AES key-wrap round trip mismatch".to_string());
    }

    let ciphertext = cbc_encrypt(&key, PROBE).map_err(|e| e.to_string())?;
    if cbc_decrypt(&key, &ciphertext).map_err(|e| e.to_string())? != PROBE {
        return Err("AES-256-CBC round trip mismatch".to_string());
    }

    debug!("cipher self-test passed");
    Ok(())
}
