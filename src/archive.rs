use crate::error::{IoContext, MpkError, Result};
use crate::manifest::{FORMAT_VERSION, Manifest, parse_manifest};
use crate::signature::{
    SIGNATURE_FILE, SIMULATED_PREFIX, UNSIGNED_MARKER, content_digest, sign_digest, verify_digest,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tempfile::NamedTempFile;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CODE_DIR: &str = "code";
pub const ASSETS_DIR: &str = "assets";
pub const CONFIG_DIR: &str = "config";

/// What `signature.sig` currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureState {
    Missing,
    Unsigned,
    Simulated,
    /// Base64 text of an RSA-PSS signature.
    Signed(String),
}

impl SignatureState {
    pub fn label(&self) -> &'static str {
        match self {
            SignatureState::Missing => "missing",
            SignatureState::Unsigned => "unsigned",
            SignatureState::Simulated => "simulated",
            SignatureState::Signed(_) => "signed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// An MPK package held in memory: the parsed manifest plus every file member.
///
/// `members` always contains `manifest.json`; directories are implicit.
#[derive(Debug, Clone)]
pub struct MpkPackage {
    manifest: Manifest,
    members: BTreeMap<String, Vec<u8>>,
}

impl MpkPackage {
    /// Start an empty package around `manifest`.
    pub fn new(manifest: Manifest) -> Result<Self> {
        let mut package = Self {
            manifest,
            members: BTreeMap::new(),
        };
        package.sync_manifest()?;
        Ok(package)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).at(path)?;
        debug!(path = %path.display(), "loading package");
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_reader(Cursor::new(bytes))
    }

    /// Read a ZIP stream and enforce the container contract: manifest present
    /// and well-formed, entry point among the members.
    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut zip = ZipArchive::new(reader)
            .map_err(|e| MpkError::InvalidPackage(format!("not a valid ZIP archive: {e}")))?;
        let mut members = BTreeMap::new();

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = normalize_member_path(entry.name())?;
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).at(&name)?;
            members.insert(name, buf);
        }

        let manifest_bytes = members
            .get(MANIFEST_FILE)
            .ok_or_else(|| MpkError::InvalidPackage("missing manifest.json".into()))?;
        let manifest = parse_manifest(manifest_bytes)?;

        let package = Self { manifest, members };
        if package.entry_member().is_none() {
            return Err(MpkError::InvalidPackage(format!(
                "entry point '{}' is not in the archive",
                package.manifest.entry_point
            )));
        }
        Ok(package)
    }

    /// The member the manifest's `entry_point` names, normalised the same
    /// way as member paths. `None` when it is not in the package.
    pub fn entry_member(&self) -> Option<String> {
        normalize_member_path(&self.manifest.entry_point)
            .ok()
            .filter(|entry| self.members.contains_key(entry))
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn members(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.members
    }

    /// Replace the manifest; it must carry every required field.
    pub fn set_manifest(&mut self, manifest: Manifest) -> Result<()> {
        if manifest.format_version != FORMAT_VERSION {
            warn!(found = %manifest.format_version, "manifest format_version differs from {FORMAT_VERSION}");
        }
        let previous = std::mem::replace(&mut self.manifest, manifest);
        if let Err(e) = self.sync_manifest() {
            self.manifest = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn update_manifest(&mut self, updates: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let mut manifest = self.manifest.clone();
        manifest.update(updates)?;
        self.set_manifest(manifest)
    }

    fn sync_manifest(&mut self) -> Result<()> {
        let bytes = self.manifest.to_json_bytes()?;
        self.members.insert(MANIFEST_FILE.to_string(), bytes);
        Ok(())
    }

    /// Add or replace one member.
    pub fn add_bytes(&mut self, target: &str, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let target = normalize_member_path(target)?;
        match target.as_str() {
            MANIFEST_FILE => Err(MpkError::InvalidPackage(
                "manifest.json is managed through set_manifest".into(),
            )),
            SIGNATURE_FILE => Err(MpkError::InvalidPackage(
                "signature.sig is written by sign".into(),
            )),
            _ => {
                debug!(member = %target, "adding member");
                self.members.insert(target, bytes.into());
                Ok(())
            }
        }
    }

    pub fn add_file(&mut self, source: &Path, target: &str) -> Result<()> {
        if !source.is_file() {
            return Err(MpkError::InvalidPackage(format!(
                "source is not a file: {}",
                source.display()
            )));
        }
        let bytes = fs::read(source).at(source)?;
        self.add_bytes(target, bytes)
    }

    /// Copy a directory tree under `target_dir`, replacing whatever was there.
    pub fn add_directory(&mut self, source: &Path, target_dir: &str) -> Result<()> {
        if !source.is_dir() {
            return Err(MpkError::InvalidPackage(format!(
                "source is not a directory: {}",
                source.display()
            )));
        }
        let target_dir = normalize_member_path(target_dir)?;
        if target_dir == MANIFEST_FILE || target_dir == SIGNATURE_FILE {
            return Err(MpkError::InvalidPath(target_dir));
        }

        let prefix = format!("{target_dir}/");
        self.members.retain(|path, _| !path.starts_with(&prefix));

        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry.map_err(|e| MpkError::InvalidPackage(e.to_string()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            if !entry.file_type().is_file() {
                warn!(path = %entry.path().display(), "skipping non-regular file");
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| MpkError::InvalidPackage(e.to_string()))?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let bytes = fs::read(entry.path()).at(entry.path())?;
            self.add_bytes(&format!("{prefix}{rel}"), bytes)?;
        }
        Ok(())
    }

    /// Member paths in lexicographic order.
    pub fn list_files(&self) -> Vec<&str> {
        self.members.keys().map(String::as_str).collect()
    }

    pub fn read_file(&self, path: &str) -> Result<&[u8]> {
        let path = normalize_member_path(path)?;
        self.members
            .get(&path)
            .map(Vec::as_slice)
            .ok_or_else(|| MpkError::InvalidPackage(format!("no member '{path}' in package")))
    }

    pub fn extract_file(&self, path: &str, target: &Path) -> Result<()> {
        let bytes = self.read_file(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        fs::write(target, bytes).at(target)
    }

    /// Write every member below `prefix` into `target_dir`, which is replaced.
    pub fn extract_directory(&self, prefix: &str, target_dir: &Path) -> Result<usize> {
        let prefix = format!("{}/", normalize_member_path(prefix)?);
        let selected: Vec<(&String, &Vec<u8>)> = self
            .members
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .collect();
        if selected.is_empty() {
            return Err(MpkError::InvalidPackage(format!(
                "no directory '{}' in package",
                prefix.trim_end_matches('/')
            )));
        }

        if target_dir.exists() {
            fs::remove_dir_all(target_dir).at(target_dir)?;
        }
        for (path, bytes) in &selected {
            write_member(target_dir, &path[prefix.len()..], bytes)?;
        }
        Ok(selected.len())
    }

    pub fn extract_all(&self, target_dir: &Path) -> Result<()> {
        fs::create_dir_all(target_dir).at(target_dir)?;
        for (path, bytes) in &self.members {
            write_member(target_dir, path, bytes)?;
        }
        Ok(())
    }

    pub fn digest(&self) -> [u8; 32] {
        content_digest(&self.members)
    }

    pub fn signature_state(&self) -> SignatureState {
        let Some(raw) = self.members.get(SIGNATURE_FILE) else {
            return SignatureState::Missing;
        };
        let text = String::from_utf8_lossy(raw).trim().to_string();
        if text == UNSIGNED_MARKER {
            SignatureState::Unsigned
        } else if text.starts_with(SIMULATED_PREFIX) {
            SignatureState::Simulated
        } else {
            SignatureState::Signed(text)
        }
    }

    /// Mark the package as deliberately unsigned.
    pub fn mark_unsigned(&mut self) {
        self.members
            .insert(SIGNATURE_FILE.to_string(), UNSIGNED_MARKER.as_bytes().to_vec());
    }

    /// Sign the current contents and store the base64 signature in `signature.sig`.
    pub fn sign(&mut self, key: &RsaPrivateKey) {
        let signature = sign_digest(key, &self.digest());
        self.members
            .insert(SIGNATURE_FILE.to_string(), BASE64.encode(signature).into_bytes());
        info!(id = %self.manifest.id, "package signed");
    }

    /// `Ok(false)` for unsigned packages and mismatches; `Err` only when the
    /// stored signature is not base64.
    pub fn verify(&self, key: &RsaPublicKey) -> Result<bool> {
        let encoded = match self.signature_state() {
            SignatureState::Signed(encoded) => encoded,
            other => {
                warn!(state = other.label(), "package carries no verifiable signature");
                return Ok(false);
            }
        };
        let signature = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| MpkError::Signature(format!("signature.sig is not base64: {e}")))?;
        let ok = verify_digest(key, &self.digest(), &signature);
        if ok {
            info!(id = %self.manifest.id, "signature verified");
        } else {
            warn!(id = %self.manifest.id, "signature does not match package contents");
        }
        Ok(ok)
    }

    /// Non-fatal findings: things a well-formed package should have.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        let code_prefix = format!("{CODE_DIR}/");
        if !self.members.keys().any(|p| p.starts_with(&code_prefix)) {
            out.push("code/ directory is missing or empty".to_string());
        }
        if !self.members.contains_key(SIGNATURE_FILE) {
            out.push("signature.sig is missing".to_string());
        }
        if self.manifest.format_version != FORMAT_VERSION {
            out.push(format!(
                "format_version {} differs from supported {FORMAT_VERSION}",
                self.manifest.format_version
            ));
        }
        out
    }

    /// Write the package as a deflated ZIP. The entry point must be a member.
    pub fn save<P: AsRef<Path>>(&self, output: P) -> Result<()> {
        let output = output.as_ref();
        let entry = &self.manifest.entry_point;
        if entry.is_empty() {
            return Err(MpkError::InvalidPackage("manifest has no entry_point".into()));
        }
        if self.entry_member().is_none() {
            return Err(MpkError::InvalidPackage(format!(
                "entry point '{entry}' has not been added to the package"
            )));
        }

        let parent = match output.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent,
            None => Path::new("."),
        };
        fs::create_dir_all(parent).at(parent)?;

        // Written beside the target and renamed over it, so a failed write
        // never truncates an existing package.
        let mut staged = NamedTempFile::new_in(parent).at(parent)?;
        {
            let mut zip = ZipWriter::new(staged.as_file_mut());
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            for (path, bytes) in &self.members {
                zip.start_file(path.as_str(), options)?;
                zip.write_all(bytes).at(output)?;
            }
            zip.finish()?.flush().at(output)?;
        }
        staged
            .persist(output)
            .map_err(|e| MpkError::Io {
                path: output.to_path_buf(),
                source: e.error,
            })?;

        info!(path = %output.display(), members = self.members.len(), "package saved");
        Ok(())
    }

    /// Build a package from a source tree and save it to `output`.
    ///
    /// The manifest comes from `source/manifest.json` unless an override is
    /// given. A stale `signature.sig` in the source is ignored; the package is
    /// signed with `signing_key` or marked `UNSIGNED`.
    pub fn create_from_directory(
        source: &Path,
        output: &Path,
        manifest_override: Option<Manifest>,
        signing_key: Option<&RsaPrivateKey>,
    ) -> Result<Self> {
        if !source.is_dir() {
            return Err(MpkError::InvalidPackage(format!(
                "source directory does not exist: {}",
                source.display()
            )));
        }

        let manifest = match manifest_override {
            Some(manifest) => manifest,
            None => {
                let path = source.join(MANIFEST_FILE);
                if !path.is_file() {
                    return Err(MpkError::InvalidPackage(format!(
                        "no manifest.json in {} and no manifest override",
                        source.display()
                    )));
                }
                parse_manifest(&fs::read(&path).at(&path)?)?
            }
        };
        let mut package = Self::new(manifest)?;

        let mut items: Vec<PathBuf> = fs::read_dir(source)
            .at(source)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()
            .at(source)?;
        items.sort();

        for item in items {
            let Some(name) = item.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                warn!(path = %item.display(), "skipping entry with a non UTF-8 name");
                continue;
            };
            match name.as_str() {
                MANIFEST_FILE => continue,
                SIGNATURE_FILE => {
                    warn!("ignoring signature.sig in source directory; it is regenerated");
                    continue;
                }
                _ => {}
            }
            if item.is_dir() {
                package.add_directory(&item, &name)?;
            } else if item.is_file() {
                package.add_file(&item, &name)?;
            } else {
                warn!(path = %item.display(), "skipping unsupported entry");
            }
        }

        if !package.members.keys().any(|p| p.starts_with("code/")) {
            warn!(source = %source.display(), "source has no code/ directory");
        }

        match signing_key {
            Some(key) => package.sign(key),
            None => {
                package.mark_unsigned();
                info!("no signing key given; package marked UNSIGNED");
            }
        }

        package.save(output)?;
        Ok(package)
    }
}

/// Check a file against the container contract without failing.
pub fn validate<P: AsRef<Path>>(path: P) -> ValidationReport {
    match MpkPackage::load(path) {
        Ok(package) => ValidationReport {
            valid: true,
            errors: Vec::new(),
            warnings: package.warnings(),
        },
        Err(e) => ValidationReport {
            valid: false,
            errors: vec![e.to_string()],
            warnings: Vec::new(),
        },
    }
}

pub fn is_valid_mpk<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    let report = validate(path);
    for e in &report.errors {
        warn!(path = %path.display(), "{e}");
    }
    report.valid
}

/// Normalise a member path to `/` separators with no leading slash.
/// Only paths that would leave the package root are rejected: `..`
/// components, a leading drive prefix (`C:`) and empty paths.
pub fn normalize_member_path(raw: &str) -> Result<String> {
    let replaced = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for part in replaced.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(MpkError::InvalidPath(raw.to_string())),
            p if parts.is_empty() && is_drive_prefix(p) => {
                return Err(MpkError::InvalidPath(raw.to_string()));
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(MpkError::InvalidPath(raw.to_string()));
    }
    Ok(parts.join("/"))
}

fn is_drive_prefix(part: &str) -> bool {
    let bytes = part.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn write_member(root: &Path, rel: &str, bytes: &[u8]) -> Result<()> {
    let target = rel.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part));
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    fs::write(&target, bytes).at(&target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::tests::test_key;
    use tempfile::{NamedTempFile, tempdir};

    fn sample_manifest() -> Manifest {
        let mut m = Manifest::new("com.example.hello", "Hello", "code/main.js");
        m.permissions = vec!["network".into()];
        m
    }

    fn sample_package() -> MpkPackage {
        let mut p = MpkPackage::new(sample_manifest()).unwrap();
        p.add_bytes("code/main.js", b"console.log('hi')".to_vec()).unwrap();
        p.add_bytes("assets/logo.txt", b"logo".to_vec()).unwrap();
        p.add_bytes("config/default.json", b"{}".to_vec()).unwrap();
        p.mark_unsigned();
        p
    }

    fn write_zip(entries: &[(&str, &[u8])]) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        let mut zip = ZipWriter::new(File::create(file.path()).unwrap());
        for (name, bytes) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
        file
    }

    fn manifest_json(entry: &str) -> Vec<u8> {
        Manifest::new("com.x", "X", entry).to_json_bytes().unwrap()
    }

    #[test]
    fn save_then_load_preserves_members() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("nested/hello.mpk");
        let package = sample_package();
        package.save(&out).unwrap();

        let loaded = MpkPackage::load(&out).unwrap();
        assert_eq!(loaded.manifest(), package.manifest());
        assert_eq!(
            loaded.list_files(),
            vec![
                "assets/logo.txt",
                "code/main.js",
                "config/default.json",
                "manifest.json",
                "signature.sig"
            ]
        );
        assert_eq!(loaded.read_file("code/main.js").unwrap(), b"console.log('hi')");
        assert_eq!(loaded.signature_state(), SignatureState::Unsigned);
        assert_eq!(loaded.digest(), package.digest());
    }

    #[test]
    fn load_rejects_non_zip() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"definitely not a zip").unwrap();
        let err = MpkPackage::load(f.path()).unwrap_err();
        assert!(format!("{err:#}").contains("not a valid ZIP"), "got: {err:#}");
        assert!(!is_valid_mpk(f.path()));
    }

    #[test]
    fn load_rejects_missing_manifest() {
        let f = write_zip(&[("code/main.js", b"x")]);
        let err = MpkPackage::load(f.path()).unwrap_err();
        assert!(format!("{err:#}").contains("missing manifest.json"));
    }

    #[test]
    fn load_rejects_manifest_missing_fields() {
        let f = write_zip(&[
            ("manifest.json", br#"{"id": "a", "name": "A"}"#),
            ("code/main.js", b"x"),
        ]);
        let err = MpkPackage::load(f.path()).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("missing required fields"), "got: {msg}");
        assert!(msg.contains("entry_point"), "got: {msg}");
    }

    #[test]
    fn load_rejects_absent_entry_point() {
        let manifest = manifest_json("code/app.js");
        let f = write_zip(&[("manifest.json", &manifest), ("code/main.js", b"x")]);
        let err = MpkPackage::load(f.path()).unwrap_err();
        assert!(format!("{err:#}").contains("entry point 'code/app.js'"));
    }

    #[test]
    fn load_rejects_path_traversal() {
        let manifest = manifest_json("code/main.js");
        let f = write_zip(&[
            ("manifest.json", &manifest),
            ("code/main.js", b"x"),
            ("../escape.txt", b"boom"),
        ]);
        let err = MpkPackage::load(f.path()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid member path"));
    }

    #[test]
    fn member_names_with_colons_are_accepted() {
        let manifest = manifest_json("code/main.js");
        let f = write_zip(&[
            ("manifest.json", &manifest),
            ("code/main.js", b"x"),
            ("assets/12:30.txt", b"lunch"),
        ]);
        let report = validate(f.path());
        assert!(report.valid, "got: {:?}", report.errors);
        let p = MpkPackage::load(f.path()).unwrap();
        assert_eq!(p.read_file("assets/12:30.txt").unwrap(), b"lunch");
    }

    #[test]
    fn leading_slash_entry_point_matches_its_member() {
        let manifest = manifest_json("/code/main.js");
        let f = write_zip(&[("manifest.json", &manifest), ("/code/main.js", b"x")]);
        let p = MpkPackage::load(f.path()).unwrap();
        assert_eq!(p.entry_member().as_deref(), Some("code/main.js"));
        assert_eq!(p.read_file("/code/main.js").unwrap(), b"x");

        let out = NamedTempFile::new().unwrap();
        p.save(out.path()).unwrap();
        assert!(MpkPackage::load(out.path()).is_ok());
    }

    #[test]
    fn drive_prefixed_member_is_rejected() {
        let manifest = manifest_json("code/main.js");
        let f = write_zip(&[
            ("manifest.json", &manifest),
            ("code/main.js", b"x"),
            ("C:/Windows/evil.dll", b"x"),
        ]);
        assert!(!validate(f.path()).valid);
        assert!(normalize_member_path("c:\\boot.ini").is_err());
        assert_eq!(normalize_member_path("notes/a:b").unwrap(), "notes/a:b");
    }

    #[test]
    fn minimal_archive_is_valid_with_warnings() {
        let manifest = manifest_json("main.js");
        let f = write_zip(&[("manifest.json", &manifest), ("main.js", b"x")]);
        let report = validate(f.path());
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("code/")));
        assert!(report.warnings.iter().any(|w| w.contains("signature.sig")));
    }

    #[test]
    fn add_bytes_normalises_and_guards_reserved_names() {
        let mut p = sample_package();
        p.add_bytes("\\assets\\img\\a.png", b"png".to_vec()).unwrap();
        assert!(p.read_file("assets/img/a.png").is_ok());

        assert!(p.add_bytes("signature.sig", b"x".to_vec()).is_err());
        assert!(p.add_bytes("/manifest.json", b"{}".to_vec()).is_err());
        assert!(p.add_bytes("code/../../x", b"x".to_vec()).is_err());
        assert!(p.add_bytes("", b"x".to_vec()).is_err());
    }

    #[test]
    fn add_directory_replaces_existing_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("assets");
        fs::create_dir_all(src.join("sounds")).unwrap();
        fs::write(src.join("sounds/beep.wav"), b"wav").unwrap();
        fs::write(src.join("icon.png"), b"png").unwrap();

        let mut p = sample_package();
        p.add_directory(&src, "assets").unwrap();
        let assets: Vec<&str> = p
            .list_files()
            .into_iter()
            .filter(|f| f.starts_with("assets/"))
            .collect();
        assert_eq!(assets, vec!["assets/icon.png", "assets/sounds/beep.wav"]);
    }

    #[test]
    fn save_requires_entry_point_member() {
        let p = MpkPackage::new(sample_manifest()).unwrap();
        let out = NamedTempFile::new().unwrap();
        let err = p.save(out.path()).unwrap_err();
        assert!(format!("{err:#}").contains("has not been added"));
    }

    #[test]
    fn save_in_place_replaces_without_leftovers() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("app.mpk");
        sample_package().save(&out).unwrap();

        let mut loaded = MpkPackage::load(&out).unwrap();
        loaded.sign(test_key());
        loaded.save(&out).unwrap();

        let again = MpkPackage::load(&out).unwrap();
        assert!(again.verify(&test_key().to_public_key()).unwrap());
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("app.mpk")]);
    }

    #[test]
    fn failed_save_leaves_target_untouched() {
        let dir = tempdir().unwrap();
        // a non-empty directory cannot be replaced by a file
        let out = dir.path().join("busy.mpk");
        fs::create_dir_all(out.join("inner")).unwrap();

        assert!(sample_package().save(&out).is_err());
        assert!(out.join("inner").is_dir());
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("busy.mpk")]);
    }

    #[test]
    fn set_manifest_rewrites_manifest_member() {
        let mut p = sample_package();
        let mut m = p.manifest().clone();
        m.version = "9.9.9".into();
        p.set_manifest(m).unwrap();
        let stored = parse_manifest(p.read_file(MANIFEST_FILE).unwrap()).unwrap();
        assert_eq!(stored.version, "9.9.9");
    }

    #[test]
    fn extract_directory_and_file() {
        let dir = tempdir().unwrap();
        let p = sample_package();

        let assets = dir.path().join("out/assets");
        fs::create_dir_all(&assets).unwrap();
        fs::write(assets.join("stale.txt"), b"old").unwrap();
        assert_eq!(p.extract_directory("assets", &assets).unwrap(), 1);
        assert_eq!(fs::read(assets.join("logo.txt")).unwrap(), b"logo");
        assert!(!assets.join("stale.txt").exists());

        let single = dir.path().join("single/main.js");
        p.extract_file("code/main.js", &single).unwrap();
        assert_eq!(fs::read(single).unwrap(), b"console.log('hi')");

        assert!(p.extract_directory("nothing", &dir.path().join("x")).is_err());
    }

    #[test]
    fn signed_package_verifies_and_detects_tampering() {
        let key = test_key();
        let dir = tempdir().unwrap();
        let out = dir.path().join("signed.mpk");

        let mut p = sample_package();
        p.sign(key);
        p.save(&out).unwrap();

        let loaded = MpkPackage::load(&out).unwrap();
        assert!(matches!(loaded.signature_state(), SignatureState::Signed(_)));
        assert!(loaded.verify(&key.to_public_key()).unwrap());

        let mut tampered = loaded.clone();
        tampered.add_bytes("code/main.js", b"evil()".to_vec()).unwrap();
        assert!(!tampered.verify(&key.to_public_key()).unwrap());
    }

    #[test]
    fn unsigned_and_simulated_never_verify() {
        let key = test_key();
        let p = sample_package();
        assert!(!p.verify(&key.to_public_key()).unwrap());

        let manifest = manifest_json("code/main.js");
        let f = write_zip(&[
            ("manifest.json", &manifest),
            ("code/main.js", b"x"),
            ("signature.sig", b"SIMULATED_SIGNATURE_0011223344556677"),
        ]);
        let simulated = MpkPackage::load(f.path()).unwrap();
        assert_eq!(simulated.signature_state(), SignatureState::Simulated);
        assert!(!simulated.verify(&key.to_public_key()).unwrap());
    }

    #[test]
    fn malformed_signature_is_an_error() {
        let key = test_key();
        let manifest = manifest_json("code/main.js");
        let f = write_zip(&[
            ("manifest.json", &manifest),
            ("code/main.js", b"x"),
            ("signature.sig", b"%%% not base64 %%%"),
        ]);
        let p = MpkPackage::load(f.path()).unwrap();
        let err = p.verify(&key.to_public_key()).unwrap_err();
        assert!(format!("{err:#}").contains("not base64"));
    }

    #[test]
    fn create_from_directory_marks_unsigned_and_skips_stale_signature() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("app");
        fs::create_dir_all(src.join("code")).unwrap();
        fs::write(src.join("code/main.js"), b"main()").unwrap();
        fs::write(src.join("README"), b"readme").unwrap();
        fs::write(src.join("signature.sig"), b"stale").unwrap();
        fs::write(src.join(MANIFEST_FILE), sample_manifest().to_json_bytes().unwrap()).unwrap();

        let out = dir.path().join("app.mpk");
        let created = MpkPackage::create_from_directory(&src, &out, None, None).unwrap();
        assert_eq!(created.signature_state(), SignatureState::Unsigned);

        let loaded = MpkPackage::load(&out).unwrap();
        assert_eq!(loaded.read_file("README").unwrap(), b"readme");
        assert_eq!(loaded.signature_state(), SignatureState::Unsigned);
    }

    #[test]
    fn create_from_directory_with_override_and_key() {
        let key = test_key();
        let dir = tempdir().unwrap();
        let src = dir.path().join("app");
        fs::create_dir_all(src.join("code")).unwrap();
        fs::write(src.join("code/index.wasm"), b"\0asm").unwrap();

        let mut m = Manifest::new("com.wasm.demo", "Demo", "code/index.wasm");
        m.code_type = "wasm".into();
        let out = dir.path().join("demo.mpk");
        MpkPackage::create_from_directory(&src, &out, Some(m), Some(key)).unwrap();

        let loaded = MpkPackage::load(&out).unwrap();
        assert_eq!(loaded.manifest().code_type, "wasm");
        assert!(loaded.verify(&key.to_public_key()).unwrap());
    }

    #[test]
    fn create_from_directory_requires_a_manifest() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("x.mpk");
        let err = MpkPackage::create_from_directory(dir.path(), &out, None, None).unwrap_err();
        assert!(format!("{err:#}").contains("no manifest.json"));
    }
}
