#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;

/// A semi-structured archive so we get past the ZIP and manifest checks more
/// often than with raw bytes.
#[derive(Arbitrary, Debug)]
struct ArchiveArb {
    id: String,
    version: String,
    entry_point: String,
    #[arbitrary(with = gen_bool)]
    drop_name: bool,
    members: Vec<(String, Vec<u8>)>,
    raw_tail: Vec<u8>,
}

fn gen_bool(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<bool> {
    Ok(u.int_in_range(0..=1)? == 1)
}

fuzz_target!(|input: ArchiveArb| {
    let mut manifest = serde_json::json!({
        "id": input.id,
        "name": "fuzz",
        "version": input.version,
        "platform": "all",
        "min_platform_version": "1.0.0",
        "code_type": "javascript",
        "entry_point": input.entry_point,
    });
    if input.drop_name {
        if let Some(obj) = manifest.as_object_mut() {
            obj.remove("name");
        }
    }

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default();
    if zip.start_file("manifest.json", opts).is_err() {
        return;
    }
    let _ = zip.write_all(manifest.to_string().as_bytes());
    // keep the member count small to avoid huge archives
    for (name, bytes) in input.members.iter().take(16) {
        if zip.start_file(name.as_str(), opts).is_ok() {
            let _ = zip.write_all(bytes);
        }
    }
    let Ok(cursor) = zip.finish() else {
        return;
    };

    let mut bytes = cursor.into_inner();
    let _ = mpk::MpkPackage::from_bytes(&bytes);

    // Corrupt the archive tail to exercise the ZIP error paths.
    let cut = bytes.len().saturating_sub(input.raw_tail.len() % 23);
    bytes.truncate(cut);
    bytes.extend_from_slice(&input.raw_tail);
    let _ = mpk::MpkPackage::from_bytes(&bytes);
});
