//! Cryptographic primitives of the backup format
//!
//! Everything in an encrypted backup is AES-256 based:
//! - class keys and file keys are wrapped with RFC 3394 AES key-wrap
//! - file content and `Manifest.db` are AES-256-CBC with an all-zero IV and
//!   PKCS#7 padding
//!
//! [`keybag`] turns the password into class keys, [`cipher`] applies them to
//! individual files.

pub mod cipher;
pub mod keybag;

pub use cipher::{EncryptedContent, FileCipher, FileKey};
pub use keybag::{ClassKey, KeyBag, ProtectionClass};

use crate::error::{BackupError, Result};
use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_kw::KekAes256;

/// AES-256 key length in bytes
pub const KEY_SIZE: usize = 32;

/// Length of an AES key-wrapped 256-bit key (key + 8 byte integrity block)
pub const WRAPPED_KEY_SIZE: usize = KEY_SIZE + 8;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// The format never stores an IV
const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Unwrap a 256-bit key with AES key-wrap.
///
/// A failed integrity check (wrong key encryption key or tampered blob)
/// is reported as [`BackupError::Integrity`].
pub fn unwrap_key(kek: &[u8; KEY_SIZE], wrapped: &[u8]) -> Result<[u8; KEY_SIZE]> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(BackupError::Integrity(format!(
            "wrapped key must be {} bytes, got {}",
            WRAPPED_KEY_SIZE,
            wrapped.len()
        )));
    }

    let kek = KekAes256::from(*kek);
    let mut key = [0u8; KEY_SIZE];
    kek.unwrap(wrapped, &mut key).map_err(|e| match e {
        aes_kw::Error::IntegrityCheckFailed => {
            BackupError::Integrity("key unwrap integrity check failed".to_string())
        }
        other => BackupError::Integrity(format!("key unwrap failed: {}", other)),
    })?;
    Ok(key)
}

/// Wrap a 256-bit key with AES key-wrap.
pub fn wrap_key(kek: &[u8; KEY_SIZE], key: &[u8; KEY_SIZE]) -> Result<[u8; WRAPPED_KEY_SIZE]> {
    let kek = KekAes256::from(*kek);
    let mut wrapped = [0u8; WRAPPED_KEY_SIZE];
    kek.wrap(key, &mut wrapped)
        .map_err(|e| BackupError::Integrity(format!("key wrap failed: {}", e)))?;
    Ok(wrapped)
}

/// AES-256-CBC decrypt without removing padding
pub fn cbc_decrypt_raw(key: &[u8; KEY_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(BackupError::Integrity(format!(
            "ciphertext length {} is not a multiple of {}",
            ciphertext.len(),
            BLOCK_SIZE
        )));
    }

    let decryptor = Aes256CbcDec::new_from_slices(key, &ZERO_IV)
        .map_err(|e| BackupError::UnsupportedCrypto(e.to_string()))?;
    decryptor
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|e| BackupError::Integrity(format!("AES-CBC decryption failed: {}", e)))
}

/// AES-256-CBC encrypt with PKCS#7 padding
pub fn cbc_encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let encryptor = Aes256CbcEnc::new_from_slices(key, &ZERO_IV)
        .map_err(|e| BackupError::UnsupportedCrypto(e.to_string()))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Length of `data` without its PKCS#7 padding, if the padding is valid
pub fn pkcs7_unpadded_len(data: &[u8]) -> Option<usize> {
    let &last = data.last()?;
    let padding = last as usize;
    if padding == 0 || padding > BLOCK_SIZE || padding > data.len() {
        return None;
    }

    let start = data.len() - padding;
    if data[start..].iter().all(|&b| b == last) {
        Some(start)
    } else {
        None
    }
}

/// Decrypt a blob and strip its PKCS#7 padding when the padding is valid
pub fn cbc_decrypt(key: &[u8; KEY_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut plaintext = cbc_decrypt_raw(key, ciphertext)?;
    if let Some(len) = pkcs7_unpadded_len(&plaintext) {
        plaintext.truncate(len);
    }
    Ok(plaintext)
}
