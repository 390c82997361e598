#![no_main]

use ibackup_rs::manifest::KeyedArchive;
use ibackup_rs::FileRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decode as per-file metadata; malformed archives must only error
    if let Ok(archive) = KeyedArchive::from_bytes(data) {
        let _ = archive.root();
        let _ = archive.root_integer("Size");
        let _ = archive.root_unsigned("ProtectionClass");
        let _ = archive.root_string("RelativePath");
        let _ = archive.root_string("Target");
        let _ = archive.root_data("EncryptionKey");

        let mut edited = archive.clone();
        if edited.set_root_integer("Size", 0).is_ok()
            && edited.set_root_data("EncryptionKey", vec![3, 0, 0, 0]).is_ok()
        {
            let _ = edited.to_bytes();
        }
    }

    for flags in [1, 2, 4] {
        let _ = FileRecord::from_row(
            "00".to_string(),
            "HomeDomain".to_string(),
            "Library/file".to_string(),
            flags,
            Some(data),
        );
    }
});
