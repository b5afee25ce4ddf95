#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Either Ok(_) or a clean Err(_), never a panic.
    let _ = mpk::manifest::parse_manifest(data);
});
