#![no_main]

use ibackup_rs::KeyBag;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Parsing arbitrary TLV data must never panic
    let keybag = match KeyBag::parse(data) {
        Ok(k) => k,
        Err(_) => return,
    };

    let _ = keybag.version();
    let _ = keybag.uuid();
    for class in keybag.protection_classes() {
        let _ = keybag.key_type(class);
        let _ = keybag.is_class_available(class);
    }

    // Iteration counts come from the input; keep the KDF cheap
    if keybag.iterations() <= 64 && keybag.dp_iterations().unwrap_or(0) <= 64 {
        let _ = keybag.unlock(b"password");
        let _ = keybag.available_classes();
    }
});
