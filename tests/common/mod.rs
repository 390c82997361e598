//! Synthetic backup builder shared by the integration tests
//!
//! Builds backups with the raw crates (rusqlite, plist, aes-kw, cbc,
//! pbkdf2) so the tests do not depend on the library's own encoders.

#![allow(dead_code)]

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_kw::KekAes256;
use plist::{Dictionary, Uid, Value};
use rusqlite::{params, Connection};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const PASSWORD: &str = "hunter2-backup";

const SALT: [u8; 20] = [0x11; 20];
const ITER: u32 = 5;
const DP_SALT: [u8; 20] = [0x22; 20];
const DP_ITER: u32 = 7;

/// Class used for the manifest key and for files by default
pub const DEFAULT_CLASS: u32 = 3;

/// Last-modified timestamp stored on every fixture record
pub const LAST_MODIFIED: i64 = 1_650_000_000;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub fn class_key(class: u32) -> [u8; 32] {
    [0x30 + class as u8; 32]
}

pub fn password_key(password: &str) -> [u8; 32] {
    let mut first = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &DP_SALT, DP_ITER, &mut first);
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha1>(&first, &SALT, ITER, &mut key);
    key
}

pub fn aes_wrap(kek: &[u8; 32], key: &[u8; 32]) -> Vec<u8> {
    let mut out = [0u8; 40];
    KekAes256::from(*kek).wrap(key, &mut out).unwrap();
    out.to_vec()
}

pub fn aes_unwrap(kek: &[u8; 32], wrapped: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    KekAes256::from(*kek).unwrap(wrapped, &mut out).unwrap();
    out
}

pub fn cbc_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new_from_slices(key, &[0u8; 16])
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn cbc_decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Vec<u8> {
    Aes256CbcDec::new_from_slices(key, &[0u8; 16])
        .unwrap()
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .unwrap()
}

pub fn file_id(domain: &str, path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}-{}", domain, path).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn blob_path(backup_dir: &Path, domain: &str, path: &str) -> PathBuf {
    let id = file_id(domain, path);
    backup_dir.join(&id[..2]).join(&id)
}

fn tlv(out: &mut Vec<u8>, tag: &[u8; 4], value: &[u8]) {
    out.extend_from_slice(tag);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

/// Keybag with passcode-wrapped classes 1, 2, 3 and a clear class 4
pub fn keybag_bytes(password: &str) -> Vec<u8> {
    let kek = password_key(password);
    let mut data = Vec::new();
    tlv(&mut data, b"VERS", &4u32.to_be_bytes());
    tlv(&mut data, b"TYPE", &1u32.to_be_bytes());
    tlv(&mut data, b"UUID", &[0xAA; 16]);
    tlv(&mut data, b"HMCK", &[0u8; 40]);
    tlv(&mut data, b"WRAP", &0u32.to_be_bytes());
    tlv(&mut data, b"SALT", &SALT);
    tlv(&mut data, b"ITER", &ITER.to_be_bytes());
    tlv(&mut data, b"DPWT", &1u32.to_be_bytes());
    tlv(&mut data, b"DPIC", &DP_ITER.to_be_bytes());
    tlv(&mut data, b"DPSL", &DP_SALT);

    for class in 1..=3u32 {
        tlv(&mut data, b"UUID", &[class as u8; 16]);
        tlv(&mut data, b"CLAS", &class.to_be_bytes());
        tlv(&mut data, b"WRAP", &2u32.to_be_bytes());
        tlv(&mut data, b"KTYP", &0u32.to_be_bytes());
        tlv(&mut data, b"WPKY", &aes_wrap(&kek, &class_key(class)));
    }

    tlv(&mut data, b"UUID", &[4u8; 16]);
    tlv(&mut data, b"CLAS", &4u32.to_be_bytes());
    tlv(&mut data, b"WRAP", &0u32.to_be_bytes());
    tlv(&mut data, b"KTYP", &0u32.to_be_bytes());
    tlv(&mut data, b"WPKY", &class_key(4));
    data
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Directory,
    SymbolicLink,
}

impl Kind {
    fn flags(self) -> i64 {
        match self {
            Kind::File => 1,
            Kind::Directory => 2,
            Kind::SymbolicLink => 4,
        }
    }
}

#[derive(Debug, Clone)]
struct FixtureEntry {
    domain: String,
    path: String,
    kind: Kind,
    content: Vec<u8>,
    declared_size: Option<u64>,
    class: u32,
    target: Option<String>,
}

/// Builder for an on-disk backup directory
pub struct BackupBuilder {
    encrypted: bool,
    password: String,
    entries: Vec<FixtureEntry>,
    date: SystemTime,
    info_date: Option<SystemTime>,
    device_name: String,
}

impl BackupBuilder {
    pub fn plain() -> Self {
        Self {
            encrypted: false,
            password: PASSWORD.to_string(),
            entries: Vec::new(),
            date: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            info_date: None,
            device_name: "Test iPhone".to_string(),
        }
    }

    pub fn encrypted() -> Self {
        Self {
            encrypted: true,
            ..Self::plain()
        }
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn date(mut self, secs: u64) -> Self {
        self.date = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        self
    }

    pub fn info_date(mut self, secs: u64) -> Self {
        self.info_date = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
        self
    }

    pub fn device_name(mut self, name: &str) -> Self {
        self.device_name = name.to_string();
        self
    }

    fn push(mut self, entry: FixtureEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn directory(self, domain: &str, path: &str) -> Self {
        self.push(FixtureEntry {
            domain: domain.into(),
            path: path.into(),
            kind: Kind::Directory,
            content: Vec::new(),
            declared_size: None,
            class: DEFAULT_CLASS,
            target: None,
        })
    }

    pub fn file(self, domain: &str, path: &str, content: &[u8]) -> Self {
        self.file_with_class(domain, path, content, DEFAULT_CLASS)
    }

    pub fn file_with_class(self, domain: &str, path: &str, content: &[u8], class: u32) -> Self {
        let size = content.len() as u64;
        self.push(FixtureEntry {
            domain: domain.into(),
            path: path.into(),
            kind: Kind::File,
            content: content.to_vec(),
            declared_size: Some(size),
            class,
            target: None,
        })
    }

    /// File whose manifest `Size` differs from the stored content
    pub fn file_with_size(self, domain: &str, path: &str, content: &[u8], declared: Option<u64>) -> Self {
        self.push(FixtureEntry {
            domain: domain.into(),
            path: path.into(),
            kind: Kind::File,
            content: content.to_vec(),
            declared_size: declared,
            class: DEFAULT_CLASS,
            target: None,
        })
    }

    pub fn symlink(self, domain: &str, path: &str, target: &str) -> Self {
        self.push(FixtureEntry {
            domain: domain.into(),
            path: path.into(),
            kind: Kind::SymbolicLink,
            content: Vec::new(),
            declared_size: None,
            class: DEFAULT_CLASS,
            target: Some(target.into()),
        })
    }

    /// Write the backup into `dir` and return `dir`
    pub fn build(self, dir: &Path) -> PathBuf {
        fs::create_dir_all(dir).unwrap();

        let db_path = dir.join("Manifest.db");
        let plain_db = dir.join("Manifest.db.plain");
        {
            let conn = Connection::open(&plain_db).unwrap();
            conn.execute_batch(
                "CREATE TABLE Files (fileID TEXT PRIMARY KEY, domain TEXT, relativePath TEXT, \
                 flags INTEGER, file BLOB);
                 CREATE INDEX FilesDomainIdx ON Files(domain);
                 CREATE INDEX FilesRelativePathIdx ON Files(relativePath);
                 CREATE TABLE Properties (key TEXT PRIMARY KEY, value BLOB);",
            )
            .unwrap();

            for (n, entry) in self.entries.iter().enumerate() {
                let id = file_id(&entry.domain, &entry.path);
                let mut wrapped = None;

                if entry.kind == Kind::File {
                    let blob = if self.encrypted {
                        let file_key = [(n as u8).wrapping_mul(7).wrapping_add(1); 32];
                        wrapped = Some(aes_wrap(&class_key(entry.class), &file_key));
                        cbc_encrypt(&file_key, &entry.content)
                    } else {
                        entry.content.clone()
                    };
                    let path = dir.join(&id[..2]).join(&id);
                    fs::create_dir_all(path.parent().unwrap()).unwrap();
                    fs::write(path, blob).unwrap();
                }

                conn.execute(
                    "INSERT INTO Files (fileID, domain, relativePath, flags, file) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        id,
                        entry.domain,
                        entry.path,
                        entry.kind.flags(),
                        file_metadata(entry, wrapped)
                    ],
                )
                .unwrap();
            }
        }

        let mut manifest = Dictionary::new();
        manifest.insert("IsEncrypted".into(), Value::Boolean(self.encrypted));
        manifest.insert("Version".into(), Value::from("10.0"));
        manifest.insert("Date".into(), Value::Date(self.date.into()));
        manifest.insert("WasPasscodeSet".into(), Value::Boolean(true));

        let mut lockdown = Dictionary::new();
        lockdown.insert("DeviceName".into(), Value::from(self.device_name.as_str()));
        lockdown.insert("ProductVersion".into(), Value::from("17.4.1"));
        lockdown.insert("UniqueDeviceID".into(), Value::from("00008101-000A1B2C3D4E5F60"));
        manifest.insert("Lockdown".into(), Value::Dictionary(lockdown));

        let mut apps = Dictionary::new();
        apps.insert("net.whatsapp.WhatsApp".into(), Value::Dictionary(Dictionary::new()));
        manifest.insert("Applications".into(), Value::Dictionary(apps));

        if self.encrypted {
            manifest.insert("BackupKeyBag".into(), Value::Data(keybag_bytes(&self.password)));

            let db_key = [0x5D; 32];
            let mut manifest_key = DEFAULT_CLASS.to_le_bytes().to_vec();
            manifest_key.extend_from_slice(&aes_wrap(&class_key(DEFAULT_CLASS), &db_key));
            manifest.insert("ManifestKey".into(), Value::Data(manifest_key));

            let plaintext = fs::read(&plain_db).unwrap();
            fs::write(&db_path, cbc_encrypt(&db_key, &plaintext)).unwrap();
            fs::remove_file(&plain_db).unwrap();
        } else {
            fs::rename(&plain_db, &db_path).unwrap();
        }

        Value::Dictionary(manifest)
            .to_file_binary(dir.join("Manifest.plist"))
            .unwrap();

        if let Some(date) = self.info_date {
            let mut info = Dictionary::new();
            info.insert("Device Name".into(), Value::from(self.device_name.as_str()));
            info.insert("Last Backup Date".into(), Value::Date(date.into()));
            info.insert("Product Type".into(), Value::from("iPhone14,2"));
            Value::Dictionary(info)
                .to_file_xml(dir.join("Info.plist"))
                .unwrap();
        }

        dir.to_path_buf()
    }
}

/// Archived MBFile object, laid out the way the device writes it
fn file_metadata(entry: &FixtureEntry, wrapped: Option<Vec<u8>>) -> Vec<u8> {
    let mut objects = vec![Value::from("$null")];

    let mut root = Dictionary::new();
    root.insert("RelativePath".into(), Value::Uid(Uid::new(2)));
    root.insert("LastModified".into(), Value::from(LAST_MODIFIED));
    root.insert("Birth".into(), Value::from(LAST_MODIFIED - 100));
    root.insert("ProtectionClass".into(), Value::from(entry.class as i64));
    root.insert(
        "Mode".into(),
        Value::from(match entry.kind {
            Kind::File => 0o100644i64,
            Kind::Directory => 0o040755,
            Kind::SymbolicLink => 0o120755,
        }),
    );
    if let Some(size) = entry.declared_size {
        root.insert("Size".into(), Value::from(size as i64));
    }
    root.insert("$class".into(), Value::Uid(Uid::new(3)));
    objects.push(Value::Dictionary(root));
    objects.push(Value::from(entry.path.as_str()));

    let mut mbfile = Dictionary::new();
    mbfile.insert("$classname".into(), Value::from("MBFile"));
    mbfile.insert(
        "$classes".into(),
        Value::Array(vec![Value::from("MBFile"), Value::from("NSObject")]),
    );
    objects.push(Value::Dictionary(mbfile));

    if let Some(wrapped) = wrapped {
        let mut key = entry.class.to_le_bytes().to_vec();
        key.extend_from_slice(&wrapped);

        let mut data_class = Dictionary::new();
        data_class.insert("$classname".into(), Value::from("NSMutableData"));
        data_class.insert(
            "$classes".into(),
            Value::Array(vec![
                Value::from("NSMutableData"),
                Value::from("NSData"),
                Value::from("NSObject"),
            ]),
        );
        objects.push(Value::Dictionary(data_class));

        let mut wrapper = Dictionary::new();
        wrapper.insert("NS.data".into(), Value::Data(key));
        wrapper.insert("$class".into(), Value::Uid(Uid::new(4)));
        objects.push(Value::Dictionary(wrapper));

        set_root(&mut objects, "EncryptionKey", Value::Uid(Uid::new(5)));
    }

    if let Some(target) = &entry.target {
        let index = objects.len() as u64;
        objects.push(Value::from(target.as_str()));
        set_root(&mut objects, "Target", Value::Uid(Uid::new(index)));
    }

    let mut top = Dictionary::new();
    top.insert("root".into(), Value::Uid(Uid::new(1)));

    let mut archive = Dictionary::new();
    archive.insert("$version".into(), Value::from(100_000i64));
    archive.insert("$archiver".into(), Value::from("NSKeyedArchiver"));
    archive.insert("$top".into(), Value::Dictionary(top));
    archive.insert("$objects".into(), Value::Array(objects));

    let mut out = Vec::new();
    plist::to_writer_binary(&mut out, &Value::Dictionary(archive)).unwrap();
    out
}

fn set_root(objects: &mut [Value], key: &str, value: Value) {
    objects[1]
        .as_dictionary_mut()
        .unwrap()
        .insert(key.into(), value);
}

/// A plain backup with a few domains, used by the query tests
pub fn sample_plain(dir: &Path) -> PathBuf {
    sample(BackupBuilder::plain(), dir)
}

/// The same content as [`sample_plain`], encrypted with [`PASSWORD`]
pub fn sample_encrypted(dir: &Path) -> PathBuf {
    sample(BackupBuilder::encrypted(), dir)
}

fn sample(builder: BackupBuilder, dir: &Path) -> PathBuf {
    builder
        .directory("HomeDomain", "")
        .directory("HomeDomain", "Library")
        .directory("HomeDomain", "Library/SMS")
        .file("HomeDomain", "Library/SMS/sms.db", &[0x42; 10])
        .file("HomeDomain", "Library/Notes/notes.txt", b"twenty bytes of text")
        .directory("AppDomain-com.example.app", "")
        .file(
            "AppDomain-com.example.app",
            "Documents/photo.jpg",
            &[0xFF; 30],
        )
        .symlink("AppDomain-com.example.app", "Documents/latest", "photo.jpg")
        .directory("CameraRollDomain", "")
        .build(dir)
}
