//! Minimal NSKeyedArchiver reader/writer for per-file metadata
//!
//! Each `Files.file` blob is a binary plist of the form
//!
//! ```text
//! { $archiver: "NSKeyedArchiver", $version: 100000,
//!   $top: { root: UID(1) },
//!   $objects: [ "$null", { ...MBFile... }, ... ] }
//! ```
//!
//! Object references are plist UIDs indexing into `$objects`. Only the
//! shapes used by backup metadata are handled: scalar values on the root
//! object, strings behind UIDs and `NS.data` wrappers.

use crate::error::{BackupError, Result};
use plist::{Dictionary, Uid, Value};
use std::io::Cursor;

const OBJECTS_KEY: &str = "$objects";
const TOP_KEY: &str = "$top";
const ROOT_KEY: &str = "root";
const CLASS_KEY: &str = "$class";
const NS_DATA_KEY: &str = "NS.data";

/// Index into `$objects` referenced by a UID.
///
/// UIDs are unsigned: a one-byte UID of `0x80` is 128, multi-byte UIDs are
/// big-endian.
pub fn uid_index(uid: Uid) -> Result<usize> {
    usize::try_from(uid.get())
        .map_err(|_| BackupError::KeyedArchive(format!("UID {} out of range", uid.get())))
}

/// A decoded keyed archive
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedArchive {
    document: Dictionary,
}

impl KeyedArchive {
    /// Decode a keyed archive from plist bytes (binary or XML)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value = Value::from_reader(Cursor::new(bytes))?;
        let document = value
            .into_dictionary()
            .ok_or_else(|| BackupError::KeyedArchive("top level is not a dictionary".into()))?;

        let archive = Self { document };
        // Validate the structure up front so getters only fail on bad keys
        archive.root()?;
        Ok(archive)
    }

    /// Build an archive around a root object
    pub fn with_root(root: Dictionary) -> Self {
        let mut top = Dictionary::new();
        top.insert(ROOT_KEY.to_string(), Value::Uid(Uid::new(1)));

        let mut document = Dictionary::new();
        document.insert("$version".to_string(), Value::from(100_000i64));
        document.insert("$archiver".to_string(), Value::from("NSKeyedArchiver"));
        document.insert(TOP_KEY.to_string(), Value::Dictionary(top));
        document.insert(
            OBJECTS_KEY.to_string(),
            Value::Array(vec![Value::from("$null"), Value::Dictionary(root)]),
        );
        Self { document }
    }

    /// Encode as a binary plist
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        plist::to_writer_binary(&mut out, &Value::Dictionary(self.document.clone()))?;
        Ok(out)
    }

    fn objects(&self) -> Result<&Vec<Value>> {
        self.document
            .get(OBJECTS_KEY)
            .and_then(Value::as_array)
            .ok_or_else(|| BackupError::KeyedArchive("missing $objects".into()))
    }

    fn objects_mut(&mut self) -> Result<&mut Vec<Value>> {
        self.document
            .get_mut(OBJECTS_KEY)
            .and_then(Value::as_array_mut)
            .ok_or_else(|| BackupError::KeyedArchive("missing $objects".into()))
    }

    fn root_index(&self) -> Result<usize> {
        let uid = self
            .document
            .get(TOP_KEY)
            .and_then(Value::as_dictionary)
            .and_then(|top| top.get(ROOT_KEY))
            .and_then(Value::as_uid)
            .ok_or_else(|| BackupError::KeyedArchive("missing $top.root".into()))?;
        uid_index(*uid)
    }

    /// Object at a `$objects` index
    pub fn object(&self, index: usize) -> Result<&Value> {
        let objects = self.objects()?;
        objects.get(index).ok_or_else(|| {
            BackupError::KeyedArchive(format!(
                "object index {} out of bounds ({} objects)",
                index,
                objects.len()
            ))
        })
    }

    /// Follow a UID reference; other values resolve to themselves
    pub fn resolve<'a>(&'a self, value: &'a Value) -> Result<&'a Value> {
        match value {
            Value::Uid(uid) => self.object(uid_index(*uid)?),
            other => Ok(other),
        }
    }

    /// The root object dictionary
    pub fn root(&self) -> Result<&Dictionary> {
        self.object(self.root_index()?)?
            .as_dictionary()
            .ok_or_else(|| BackupError::KeyedArchive("root object is not a dictionary".into()))
    }

    fn root_mut(&mut self) -> Result<&mut Dictionary> {
        let index = self.root_index()?;
        self.objects_mut()?
            .get_mut(index)
            .and_then(Value::as_dictionary_mut)
            .ok_or_else(|| BackupError::KeyedArchive("root object is not a dictionary".into()))
    }

    /// Resolved value of a root key
    pub fn root_value(&self, key: &str) -> Result<Option<&Value>> {
        match self.root()?.get(key) {
            Some(value) => Ok(Some(self.resolve(value)?)),
            None => Ok(None),
        }
    }

    pub fn root_integer(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.root_value(key)?.and_then(|value| {
            value
                .as_signed_integer()
                .or_else(|| value.as_unsigned_integer().and_then(|v| i64::try_from(v).ok()))
        }))
    }

    pub fn root_unsigned(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.root_value(key)?.and_then(Value::as_unsigned_integer))
    }

    pub fn root_string(&self, key: &str) -> Result<Option<&str>> {
        Ok(self.root_value(key)?.and_then(Value::as_string))
    }

    /// Bytes of a root key stored either inline or as an `NS.data` object
    pub fn root_data(&self, key: &str) -> Result<Option<&[u8]>> {
        let value = match self.root_value(key)? {
            Some(value) => value,
            None => return Ok(None),
        };
        match value {
            Value::Data(bytes) => Ok(Some(bytes.as_slice())),
            Value::Dictionary(dict) => match dict.get(NS_DATA_KEY) {
                Some(inner) => Ok(self.resolve(inner)?.as_data()),
                None => Err(BackupError::KeyedArchive(format!(
                    "{} has no {}",
                    key, NS_DATA_KEY
                ))),
            },
            _ => Ok(None),
        }
    }

    pub fn set_root_integer(&mut self, key: &str, value: i64) -> Result<()> {
        self.root_mut()?.insert(key.to_string(), Value::from(value));
        Ok(())
    }

    /// Replace the bytes of a data key.
    ///
    /// An existing `NS.data` wrapper is updated in place so its `$class`
    /// reference survives; otherwise a new `NSMutableData` object is added.
    pub fn set_root_data(&mut self, key: &str, data: Vec<u8>) -> Result<()> {
        let existing = self.root()?.get(key).and_then(Value::as_uid).copied();

        if let Some(uid) = existing {
            let index = uid_index(uid)?;
            if let Some(Value::Dictionary(wrapper)) = self.objects_mut()?.get_mut(index) {
                if wrapper.contains_key(NS_DATA_KEY) {
                    wrapper.insert(NS_DATA_KEY.to_string(), Value::Data(data));
                    return Ok(());
                }
            }
        }

        let class_uid = self.push_object(data_class_object())?;
        let mut wrapper = Dictionary::new();
        wrapper.insert(NS_DATA_KEY.to_string(), Value::Data(data));
        wrapper.insert(CLASS_KEY.to_string(), Value::Uid(class_uid));
        let wrapper_uid = self.push_object(Value::Dictionary(wrapper))?;

        self.root_mut()?
            .insert(key.to_string(), Value::Uid(wrapper_uid));
        Ok(())
    }

    /// Append an object to `$objects`, returning its UID
    pub fn push_object(&mut self, value: Value) -> Result<Uid> {
        let objects = self.objects_mut()?;
        objects.push(value);
        Ok(Uid::new((objects.len() - 1) as u64))
    }
}

fn data_class_object() -> Value {
    let mut class = Dictionary::new();
    class.insert("$classname".to_string(), Value::from("NSMutableData"));
    class.insert(
        "$classes".to_string(),
        Value::Array(vec![
            Value::from("NSMutableData"),
            Value::from("NSData"),
            Value::from("NSObject"),
        ]),
    );
    Value::Dictionary(class)
}
