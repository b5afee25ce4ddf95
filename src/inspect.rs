use crate::archive::MpkPackage;
use crate::error::{IoContext, Result};
use crate::manifest::Manifest;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct MemberInfo {
    pub path: String,
    pub size: usize,
}

/// Everything `mpk inspect` reports about a package file.
#[derive(Debug, Serialize)]
pub struct InspectReport {
    pub path: PathBuf,
    pub file_size: u64,
    pub member_count: usize,
    pub content_digest: String,
    pub signature: String,
    pub android_compatible: bool,
    pub manifest: Manifest,
    pub members: Vec<MemberInfo>,
    pub warnings: Vec<String>,
}

pub fn inspect(path: &Path) -> Result<InspectReport> {
    let file_size = fs::metadata(path).at(path)?.len();
    let package = MpkPackage::load(path)?;

    let members = package
        .members()
        .iter()
        .map(|(path, bytes)| MemberInfo {
            path: path.clone(),
            size: bytes.len(),
        })
        .collect::<Vec<_>>();

    Ok(InspectReport {
        path: path.to_path_buf(),
        file_size,
        member_count: members.len(),
        content_digest: hex::encode(package.digest()),
        signature: package.signature_state().label().to_string(),
        android_compatible: package.manifest().is_android_compatible(),
        manifest: package.manifest().clone(),
        members,
        warnings: package.warnings(),
    })
}

impl InspectReport {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let m = &self.manifest;
        let _ = writeln!(out, "MPK {}", self.path.display());
        let _ = writeln!(out, "File:      {} bytes, {} members", self.file_size, self.member_count);
        let _ = writeln!(out, "Digest:    {}", self.content_digest);
        let _ = writeln!(out, "Signature: {}", self.signature);
        let _ = writeln!(out, "App:       {} ({}) v{}", m.name, m.id, m.version);
        let _ = writeln!(out, "Entry:     {} [{}]", m.entry_point, m.code_type);
        let _ = writeln!(
            out,
            "Platform:  {} (min {}), android compatible: {}",
            m.platform,
            m.min_platform_version,
            if self.android_compatible { "yes" } else { "no" }
        );

        let _ = writeln!(out, "\nMembers:");
        for member in &self.members {
            let _ = writeln!(out, "  {:>10}  {}", member.size, member.path);
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\nWarnings:");
            for w in &self.warnings {
                let _ = writeln!(out, "  - {w}");
            }
        }

        let _ = writeln!(out, "\nManifest Content:\n{m}");
        out
    }
}
