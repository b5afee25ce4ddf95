use crate::error::{IoContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const REGISTRY_FILE: &str = "registry.json";

/// One installed app as recorded in `registry.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub path: PathBuf,
    pub install_date: DateTime<Utc>,
    pub app_name: String,
    pub version: String,
    pub package_name: String,
}

/// App id -> entry, persisted as pretty JSON. No locking: the last writer wins.
#[derive(Debug, Default)]
pub struct Registry {
    path: PathBuf,
    entries: BTreeMap<String, RegistryEntry>,
}

impl Registry {
    /// Load from `path`. A missing file is an empty registry; so is a corrupt
    /// one, after a warning.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), "registry is corrupt, starting empty: {e}");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), "registry is unreadable, starting empty: {e}");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), count = entries.len(), "registry loaded");
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).at(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.entries)?;
        fs::write(&self.path, json).at(&self.path)?;
        debug!(path = %self.path.display(), count = self.entries.len(), "registry saved");
        Ok(())
    }

    pub fn insert(&mut self, app_id: impl Into<String>, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.entries.insert(app_id.into(), entry)
    }

    pub fn remove(&mut self, app_id: &str) -> Option<RegistryEntry> {
        self.entries.remove(app_id)
    }

    pub fn get(&self, app_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(app_id)
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.entries.contains_key(app_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &RegistryEntry)> {
        self.entries.iter().map(|(id, e)| (id.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(name: &str, version: &str) -> RegistryEntry {
        RegistryEntry {
            path: PathBuf::from(format!("/apps/{name}_{version}.mpk")),
            install_date: Utc::now(),
            app_name: name.to_uppercase(),
            version: version.to_string(),
            package_name: name.to_string(),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let reg = Registry::load(dir.path().join(REGISTRY_FILE));
        assert!(reg.is_empty());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join(REGISTRY_FILE);

        let mut reg = Registry::load(&path);
        reg.insert("b.app_1.0.0", entry("b.app", "1.0.0"));
        reg.insert("a.app_2.0.0", entry("a.app", "2.0.0"));
        reg.save().unwrap();

        let again = Registry::load(&path);
        assert_eq!(again.ids(), vec!["a.app_2.0.0", "b.app_1.0.0"]);
        assert_eq!(again.get("b.app_1.0.0"), reg.get("b.app_1.0.0"));
    }

    #[test]
    fn install_date_is_rfc3339_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(REGISTRY_FILE);
        let mut reg = Registry::load(&path);
        reg.insert("x_1", entry("x", "1"));
        reg.save().unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let date = raw["x_1"]["install_date"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(date).is_ok(), "got: {date}");
        assert_eq!(raw["x_1"]["package_name"], "x");
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(REGISTRY_FILE);
        fs::write(&path, b"{ not json").unwrap();
        let mut reg = Registry::load(&path);
        assert!(reg.is_empty());

        reg.insert("x_1", entry("x", "1"));
        reg.save().unwrap();
        assert!(Registry::load(&path).contains("x_1"));
    }

    #[test]
    fn remove_returns_entry() {
        let mut reg = Registry::default();
        reg.insert("x_1", entry("x", "1"));
        assert!(reg.remove("x_1").is_some());
        assert!(reg.remove("x_1").is_none());
        assert!(!reg.contains("x_1"));
    }
}
