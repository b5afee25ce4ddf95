use crate::archive::{MANIFEST_FILE, MpkPackage};
use crate::manifest::parse_manifest;
use crate::signature::load_private_key;
use anyhow::{Context, Result, bail};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Options for the `mpk package` subcommand
#[derive(Debug, Clone)]
pub struct PackageOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    /// PKCS#8 PEM key; without one the package is marked `UNSIGNED`.
    pub key: Option<PathBuf>,
}

pub fn package(opts: PackageOptions) -> Result<MpkPackage> {
    if !opts.input.is_dir() {
        bail!("Input {:?} is not a directory", opts.input);
    }

    let manifest_path = opts.input.join(MANIFEST_FILE);
    let manifest = fs::read(&manifest_path)
        .with_context(|| format!("Failed to read manifest at {:?}", manifest_path))?;
    let manifest = parse_manifest(&manifest)
        .with_context(|| format!("Invalid manifest at {:?}", manifest_path))?;

    let key = opts
        .key
        .as_deref()
        .map(|path| {
            load_private_key(path).with_context(|| format!("Failed to load signing key {:?}", path))
        })
        .transpose()?;

    let package = MpkPackage::create_from_directory(&opts.input, &opts.output, Some(manifest), key.as_ref())
        .with_context(|| format!("Failed to build package from {:?}", opts.input))?;

    info!(output = %opts.output.display(), app_id = %package.manifest().app_id(), "package created");
    Ok(package)
}
