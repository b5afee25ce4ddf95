use crate::error::{MpkError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Permissions an app may declare unless the config narrows them.
pub const DEFAULT_PERMISSIONS: &[&str] = &["file.read", "file.write", "network", "process", "system"];

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub install_dir: PathBuf,
    /// Refuse to install packages whose signature does not verify.
    pub require_signature: bool,
    /// PEM (SPKI) public key used for install-time verification.
    pub public_key: Option<PathBuf>,
    pub allowed_permissions: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            require_signature: false,
            public_key: None,
            allowed_permissions: DEFAULT_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// `$MPK_HOME`, else `$HOME/.local/share/mpk`.
pub fn default_install_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("MPK_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    PathBuf::from(home).join(".local/share/mpk")
}

/// `$MPK_CONFIG`, else `$HOME/.mpk/config.toml`.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("MPK_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    PathBuf::from(home).join(".mpk").join("config.toml")
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| MpkError::Config(e.to_string()))
    }

    /// Load an explicitly named file; it must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| MpkError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| MpkError::Config(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load `explicit` if given, else the default location. Only the default
    /// location may be absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        let path = default_config_path();
        if path.is_file() {
            Self::load_from(&path)
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn permission_allowed(&self, permission: &str) -> bool {
        self.allowed_permissions.iter().any(|p| p == permission)
    }
}
