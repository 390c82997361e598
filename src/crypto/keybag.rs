//! Backup keybag: the per-protection-class key hierarchy
//!
//! The keybag is a flat TLV stream (4-byte ASCII tag, 4-byte big-endian
//! length, value). Header tags describe the key derivation; every `UUID` tag
//! after the first one opens a new class key record:
//!
//! ```text
//! VERS TYPE UUID HMCK WRAP SALT ITER DPWT DPIC DPSL   header
//! UUID CLAS WRAP KTYP WPKY                            class key (repeated)
//! ```
//!
//! The password key is `PBKDF2-SHA1(PBKDF2-SHA256(password, DPSL, DPIC),
//! SALT, ITER)`; archives without `DPSL` skip the SHA-256 round. Class keys
//! whose `WRAP` has the passcode bit are AES key-wrapped under the password
//! key, classes with `WRAP == 0` carry their key in clear.

use crate::crypto::{unwrap_key, KEY_SIZE};
use crate::error::{BackupError, Result};
use sha1::Sha1;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Class key is bound to the device UID and cannot be unwrapped off-device
pub const WRAP_DEVICE: u32 = 1;

/// Class key is wrapped under the password-derived key
pub const WRAP_PASSCODE: u32 = 2;

/// Data protection class tag of a file or keybag entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtectionClass(pub u32);

impl ProtectionClass {
    pub const COMPLETE: Self = Self(1);
    pub const COMPLETE_UNLESS_OPEN: Self = Self(2);
    pub const COMPLETE_UNTIL_FIRST_USER_AUTHENTICATION: Self = Self(3);
    pub const NONE: Self = Self(4);
    pub const RECOVERY: Self = Self(5);
    pub const WHEN_UNLOCKED: Self = Self(6);
    pub const AFTER_FIRST_UNLOCK: Self = Self(7);
    pub const ALWAYS: Self = Self(8);
    pub const WHEN_UNLOCKED_THIS_DEVICE_ONLY: Self = Self(9);
    pub const AFTER_FIRST_UNLOCK_THIS_DEVICE_ONLY: Self = Self(10);
    pub const ALWAYS_THIS_DEVICE_ONLY: Self = Self(11);

    /// Apple's name for the class, if it is a known one
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            1 => "NSFileProtectionComplete",
            2 => "NSFileProtectionCompleteUnlessOpen",
            3 => "NSFileProtectionCompleteUntilFirstUserAuthentication",
            4 => "NSFileProtectionNone",
            5 => "NSFileProtectionRecovery",
            6 => "kSecAttrAccessibleWhenUnlocked",
            7 => "kSecAttrAccessibleAfterFirstUnlock",
            8 => "kSecAttrAccessibleAlways",
            9 => "kSecAttrAccessibleWhenUnlockedThisDeviceOnly",
            10 => "kSecAttrAccessibleAfterFirstUnlockThisDeviceOnly",
            11 => "kSecAttrAccessibleAlwaysThisDeviceOnly",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ProtectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

/// An unwrapped class key
#[derive(Clone, PartialEq, Eq)]
pub struct ClassKey {
    bytes: [u8; KEY_SIZE],
}

impl ClassKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// One class key record as stored in the keybag
#[derive(Debug, Clone)]
struct ClassEntry {
    class: ProtectionClass,
    wrap: u32,
    key_type: Option<u32>,
    wrapped_key: Vec<u8>,
}

/// Keys that are currently usable
#[derive(Debug, Default)]
struct UnlockState {
    unlocked: bool,
    keys: BTreeMap<ProtectionClass, ClassKey>,
}

/// Parsed keybag with interior unlock state
#[derive(Debug)]
pub struct KeyBag {
    version: Option<u32>,
    kind: Option<u32>,
    uuid: Vec<u8>,
    salt: Vec<u8>,
    iterations: u32,
    dp_salt: Option<Vec<u8>>,
    dp_iterations: Option<u32>,
    classes: Vec<ClassEntry>,
    state: RwLock<UnlockState>,
}

impl KeyBag {
    /// Parse a TLV keybag blob (`BackupKeyBag` in `Manifest.plist`)
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut version = None;
        let mut kind = None;
        let mut uuid: Option<Vec<u8>> = None;
        let mut header_wrap: Option<u32> = None;
        let mut salt = None;
        let mut iterations = None;
        let mut dp_salt = None;
        let mut dp_iterations = None;

        let mut classes = Vec::new();
        let mut current: Option<PartialClass> = None;

        for block in TlvIter::new(data) {
            let (tag, value) = block?;
            match tag {
                b"VERS" => version = Some(be_u32(tag, value)?),
                b"TYPE" => kind = Some(be_u32(tag, value)?),
                b"UUID" if uuid.is_none() => uuid = Some(value.to_vec()),
                b"WRAP" if header_wrap.is_none() && current.is_none() => {
                    header_wrap = Some(be_u32(tag, value)?)
                }
                b"SALT" if current.is_none() => salt = Some(value.to_vec()),
                b"ITER" if current.is_none() => iterations = Some(be_u32(tag, value)?),
                b"DPSL" if current.is_none() => dp_salt = Some(value.to_vec()),
                b"DPIC" if current.is_none() => dp_iterations = Some(be_u32(tag, value)?),
                b"UUID" => {
                    if let Some(partial) = current.take() {
                        classes.push(partial.finish()?);
                    }
                    current = Some(PartialClass::default());
                }
                b"CLAS" | b"WRAP" | b"KTYP" | b"WPKY" => {
                    if let Some(partial) = current.as_mut() {
                        partial.set(tag, value)?;
                    }
                }
                _ => {
                    debug!(tag = %String::from_utf8_lossy(tag), len = value.len(), "ignoring keybag attribute");
                }
            }
        }
        if let Some(partial) = current.take() {
            classes.push(partial.finish()?);
        }

        let salt = salt.ok_or_else(|| BackupError::BackupRead("keybag has no SALT".to_string()))?;
        let iterations = iterations
            .ok_or_else(|| BackupError::BackupRead("keybag has no ITER".to_string()))?;

        // Classes stored in clear are usable without a password
        let mut keys = BTreeMap::new();
        for entry in &classes {
            if entry.wrap == 0 {
                let bytes: [u8; KEY_SIZE] = entry.wrapped_key.as_slice().try_into().map_err(|_| {
                    BackupError::BackupRead(format!(
                        "clear class key {} has length {}",
                        entry.class,
                        entry.wrapped_key.len()
                    ))
                })?;
                keys.insert(entry.class, ClassKey::from_bytes(bytes));
            }
        }

        debug!(
            classes = classes.len(),
            clear = keys.len(),
            header_wrap = ?header_wrap,
            "parsed keybag"
        );

        Ok(Self {
            version,
            kind,
            uuid: uuid.unwrap_or_default(),
            salt,
            iterations,
            dp_salt,
            dp_iterations,
            classes,
            state: RwLock::new(UnlockState {
                unlocked: false,
                keys,
            }),
        })
    }

    /// Keybag format version (`VERS`)
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Keybag type (`TYPE`, 1 for backup keybags)
    pub fn kind(&self) -> Option<u32> {
        self.kind
    }

    /// Keybag UUID
    pub fn uuid(&self) -> &[u8] {
        &self.uuid
    }

    /// PBKDF2-SHA1 rounds (`ITER`)
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// PBKDF2-SHA256 rounds of the first derivation step (`DPIC`), absent
    /// in keybags written before iOS 10.2
    pub fn dp_iterations(&self) -> Option<u32> {
        self.dp_iterations
    }

    /// All protection classes the keybag declares
    pub fn protection_classes(&self) -> Vec<ProtectionClass> {
        self.classes.iter().map(|entry| entry.class).collect()
    }

    /// Key type (`KTYP`) of a class, if declared
    pub fn key_type(&self, class: ProtectionClass) -> Option<u32> {
        self.classes
            .iter()
            .find(|entry| entry.class == class)
            .and_then(|entry| entry.key_type)
    }

    /// Derive the key that unwraps password-protected class keys
    pub fn derive_password_key(&self, password: &[u8]) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        match (&self.dp_salt, self.dp_iterations) {
            (Some(dp_salt), Some(dp_iterations)) => {
                let mut first_round = [0u8; KEY_SIZE];
                pbkdf2::pbkdf2_hmac::<Sha256>(password, dp_salt, dp_iterations, &mut first_round);
                pbkdf2::pbkdf2_hmac::<Sha1>(&first_round, &self.salt, self.iterations, &mut key);
            }
            _ => {
                pbkdf2::pbkdf2_hmac::<Sha1>(password, &self.salt, self.iterations, &mut key);
            }
        }
        key
    }

    /// Unlock the password-protected class keys.
    ///
    /// Classes that fail their integrity check while others succeed are
    /// left unavailable. When no password-protected class can be unwrapped
    /// the password is wrong and the current keys are left untouched.
    pub fn unlock(&self, password: impl AsRef<[u8]>) -> Result<()> {
        let password_key = self.derive_password_key(password.as_ref());

        let mut unwrapped = BTreeMap::new();
        let mut attempted = 0usize;

        for entry in &self.classes {
            if entry.wrap & WRAP_PASSCODE == 0 {
                continue;
            }
            if entry.wrap & WRAP_DEVICE != 0 {
                debug!(class = %entry.class, "skipping device-bound class key");
                continue;
            }

            attempted += 1;
            match unwrap_key(&password_key, &entry.wrapped_key) {
                Ok(key) => {
                    unwrapped.insert(entry.class, ClassKey::from_bytes(key));
                }
                Err(BackupError::Integrity(reason)) => {
                    warn!(class = %entry.class, %reason, "class key failed integrity check");
                }
                Err(e) => return Err(e),
            }
        }

        if attempted > 0 && unwrapped.is_empty() {
            info!("keybag unlock rejected: no class key could be unwrapped");
            return Err(BackupError::InvalidKey);
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let newly_available = unwrapped.len();
        state.keys.extend(unwrapped);
        state.unlocked = true;

        info!(
            unwrapped = newly_available,
            failed = attempted - newly_available,
            "keybag unlocked"
        );
        Ok(())
    }

    /// Whether a password unlock has succeeded
    pub fn is_unlocked(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).unlocked
    }

    /// Whether the key of a single class is usable right now
    pub fn is_class_available(&self, class: ProtectionClass) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys
            .contains_key(&class)
    }

    /// The unwrapped key of a class, if available
    pub fn class_key(&self, class: ProtectionClass) -> Option<ClassKey> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys
            .get(&class)
            .cloned()
    }

    /// Classes whose keys are usable right now
    pub fn available_classes(&self) -> Vec<ProtectionClass> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys
            .keys()
            .copied()
            .collect()
    }
}

/// Class key record under construction
#[derive(Default)]
struct PartialClass {
    class: Option<u32>,
    wrap: Option<u32>,
    key_type: Option<u32>,
    wrapped_key: Option<Vec<u8>>,
}

impl PartialClass {
    fn set(&mut self, tag: &[u8; 4], value: &[u8]) -> Result<()> {
        match tag {
            b"CLAS" => self.class = Some(be_u32(tag, value)?),
            b"WRAP" => self.wrap = Some(be_u32(tag, value)?),
            b"KTYP" => self.key_type = Some(be_u32(tag, value)?),
            b"WPKY" => self.wrapped_key = Some(value.to_vec()),
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<ClassEntry> {
        let class = self
            .class
            .ok_or_else(|| BackupError::BackupRead("keybag class has no CLAS".to_string()))?;
        let wrapped_key = self.wrapped_key.ok_or_else(|| {
            BackupError::BackupRead(format!("keybag class {} has no WPKY", class))
        })?;
        Ok(ClassEntry {
            class: ProtectionClass(class),
            wrap: self.wrap.unwrap_or(0),
            key_type: self.key_type,
            wrapped_key,
        })
    }
}

/// Iterator over `(tag, value)` blocks of a TLV stream
struct TlvIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TlvIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<(&'a [u8; 4], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let data = self.data;
        let rest = &data[self.offset..];
        if rest.len() < 8 {
            self.offset = self.data.len();
            return Some(Err(BackupError::BackupRead(
                "truncated keybag block header".to_string(),
            )));
        }

        let tag: &[u8; 4] = match rest[0..4].try_into() {
            Ok(tag) => tag,
            Err(_) => return None,
        };
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;

        if rest.len() - 8 < len {
            self.offset = self.data.len();
            return Some(Err(BackupError::BackupRead(format!(
                "keybag block {} claims {} bytes, {} available",
                String::from_utf8_lossy(tag),
                len,
                rest.len() - 8
            ))));
        }

        self.offset += 8 + len;
        Some(Ok((tag, &rest[8..8 + len])))
    }
}

/// Decode a big-endian integer block of up to four bytes
fn be_u32(tag: &[u8; 4], value: &[u8]) -> Result<u32> {
    if value.is_empty() || value.len() > 4 {
        return Err(BackupError::BackupRead(format!(
            "keybag integer {} has length {}",
            String::from_utf8_lossy(tag),
            value.len()
        )));
    }
    Ok(value.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}
