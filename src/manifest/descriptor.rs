//! `Manifest.plist` and `Info.plist` descriptors

use crate::error::{BackupError, Result};
use plist::{Dictionary, Value};
use std::path::Path;
use std::time::SystemTime;

pub const MANIFEST_PLIST: &str = "Manifest.plist";
pub const MANIFEST_DB: &str = "Manifest.db";
pub const INFO_PLIST: &str = "Info.plist";

/// Contents of `Manifest.plist`
#[derive(Debug, Clone, Default)]
pub struct BackupManifest {
    pub is_encrypted: bool,
    pub version: Option<String>,
    pub date: Option<SystemTime>,
    pub was_passcode_set: Option<bool>,
    pub device_name: Option<String>,
    pub product_version: Option<String>,
    pub unique_device_id: Option<String>,
    /// Raw TLV keybag (`BackupKeyBag`)
    pub keybag: Option<Vec<u8>>,
    /// Class-tagged wrapped key of `Manifest.db` (`ManifestKey`)
    pub manifest_key: Option<Vec<u8>>,
    /// Bundle identifiers listed under `Applications`
    pub applications: Vec<String>,
}

impl BackupManifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let value = Value::from_file(path).map_err(|e| {
            BackupError::BackupRead(format!("{}: {}", path.display(), e))
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let dict = value
            .into_dictionary()
            .ok_or_else(|| BackupError::BackupRead("Manifest.plist is not a dictionary".into()))?;

        let lockdown = dict.get("Lockdown").and_then(Value::as_dictionary);
        let lockdown_string = |key: &str| {
            lockdown
                .and_then(|l| l.get(key))
                .and_then(Value::as_string)
                .map(str::to_owned)
        };

        let mut applications: Vec<String> = dict
            .get("Applications")
            .and_then(Value::as_dictionary)
            .map(|apps| apps.keys().cloned().collect())
            .unwrap_or_default();
        applications.sort();

        Ok(Self {
            is_encrypted: dict
                .get("IsEncrypted")
                .and_then(Value::as_boolean)
                .unwrap_or(false),
            version: string(&dict, "Version"),
            date: date(&dict, "Date"),
            was_passcode_set: dict.get("WasPasscodeSet").and_then(Value::as_boolean),
            device_name: lockdown_string("DeviceName"),
            product_version: lockdown_string("ProductVersion"),
            unique_device_id: lockdown_string("UniqueDeviceID"),
            keybag: data(&dict, "BackupKeyBag"),
            manifest_key: data(&dict, "ManifestKey"),
            applications,
        })
    }
}

/// Contents of the optional `Info.plist`
#[derive(Debug, Clone, Default)]
pub struct BackupInfo {
    pub device_name: Option<String>,
    pub display_name: Option<String>,
    pub last_backup_date: Option<SystemTime>,
    pub product_type: Option<String>,
    pub product_version: Option<String>,
    pub serial_number: Option<String>,
    pub unique_identifier: Option<String>,
}

impl BackupInfo {
    pub fn from_file(path: &Path) -> Result<Self> {
        let value = Value::from_file(path).map_err(|e| {
            BackupError::BackupRead(format!("{}: {}", path.display(), e))
        })?;
        let dict = value
            .into_dictionary()
            .ok_or_else(|| BackupError::BackupRead("Info.plist is not a dictionary".into()))?;

        Ok(Self {
            device_name: string(&dict, "Device Name"),
            display_name: string(&dict, "Display Name"),
            last_backup_date: date(&dict, "Last Backup Date"),
            product_type: string(&dict, "Product Type"),
            product_version: string(&dict, "Product Version"),
            serial_number: string(&dict, "Serial Number"),
            unique_identifier: string(&dict, "Unique Identifier"),
        })
    }
}

fn string(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_owned)
}

fn date(dict: &Dictionary, key: &str) -> Option<SystemTime> {
    dict.get(key).and_then(Value::as_date).map(SystemTime::from)
}

fn data(dict: &Dictionary, key: &str) -> Option<Vec<u8>> {
    dict.get(key).and_then(Value::as_data).map(<[u8]>::to_vec)
}
