use crate::archive::{ASSETS_DIR, MpkPackage};
use crate::config::Config;
use crate::error::{IoContext, MpkError, Result};
use crate::manifest::Manifest;
use crate::registry::{REGISTRY_FILE, Registry, RegistryEntry};
use crate::signature::load_public_key;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

/// Lifecycle notifications delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Installed { app_id: String, path: PathBuf },
    Uninstalled { app_id: String },
    Loaded { app_id: String },
    Unloaded { app_id: String },
    Started { app_id: String },
    ResourcesExtracted { app_id: String, dir: PathBuf },
    Error(String),
}

type Handler = Box<dyn Fn(&RuntimeEvent) + Send + Sync>;

/// What a simulated run would hand to the app.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub app_id: String,
    pub code_type: String,
    pub entry_point: String,
    pub entry_path: PathBuf,
    pub entry_size: u64,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppInfo {
    pub app_id: String,
    pub entry: RegistryEntry,
    pub manifest: Manifest,
    pub files: Vec<String>,
    pub signature: String,
    pub loaded: bool,
}

struct LoadedApp {
    package: MpkPackage,
    staging: TempDir,
}

/// Installs packages into `install_dir` and manages loaded apps.
///
/// Loaded apps live in private staging directories that are removed on
/// unload (or when the runtime is dropped).
pub struct Runtime {
    config: Config,
    registry: Registry,
    loaded: BTreeMap<String, LoadedApp>,
    handlers: Vec<Handler>,
}

impl Runtime {
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.install_dir).at(&config.install_dir)?;
        let registry = Registry::load(config.install_dir.join(REGISTRY_FILE));
        info!(
            install_dir = %config.install_dir.display(),
            installed = registry.len(),
            "runtime ready"
        );
        Ok(Self {
            config,
            registry,
            loaded: BTreeMap::new(),
            handlers: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: Fn(&RuntimeEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    fn emit(&self, event: RuntimeEvent) {
        for handler in &self.handlers {
            handler(&event);
        }
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!("{e}");
            self.emit(RuntimeEvent::Error(e.to_string()));
        }
        result
    }

    // Registry paths are resolved against the current install dir so the
    // directory can be moved.
    fn stored_path(&self, entry: &RegistryEntry) -> PathBuf {
        match entry.path.file_name() {
            Some(name) => self.config.install_dir.join(name),
            None => entry.path.clone(),
        }
    }

    /// Validate, optionally verify, and copy a package into the install dir.
    /// Returns the new app id.
    pub fn install_app(&mut self, source: &Path) -> Result<String> {
        let result = self.try_install(source);
        let result = self.report(result);
        if let Ok(app_id) = &result {
            let path = self.config.install_dir.join(format!("{app_id}.mpk"));
            self.emit(RuntimeEvent::Installed {
                app_id: app_id.clone(),
                path,
            });
        }
        result
    }

    fn try_install(&mut self, source: &Path) -> Result<String> {
        if !source.is_file() {
            return Err(MpkError::InvalidPackage(format!(
                "package file not found: {}",
                source.display()
            )));
        }
        let package = MpkPackage::load(source)?;

        if self.config.require_signature {
            let key_path = self.config.public_key.as_deref().ok_or_else(|| {
                MpkError::Config("require_signature is set but no public_key is configured".into())
            })?;
            let key = load_public_key(key_path)?;
            if !package.verify(&key)? {
                return Err(MpkError::Signature(format!(
                    "{} is not signed by the configured key",
                    source.display()
                )));
            }
        }

        let manifest = package.manifest();
        check_file_name_part("id", &manifest.id)?;
        check_file_name_part("version", &manifest.version)?;
        let app_id = manifest.app_id();
        if self.registry.contains(&app_id) {
            return Err(MpkError::AlreadyInstalled(app_id));
        }

        let target = self.config.install_dir.join(format!("{app_id}.mpk"));
        fs::copy(source, &target).at(&target)?;

        self.registry.insert(
            app_id.clone(),
            RegistryEntry {
                path: target.clone(),
                install_date: Utc::now(),
                app_name: manifest.name.clone(),
                version: manifest.version.clone(),
                package_name: manifest.id.clone(),
            },
        );
        if let Err(e) = self.registry.save() {
            self.registry.remove(&app_id);
            if let Err(rm) = fs::remove_file(&target) {
                warn!(path = %target.display(), "could not remove partial install: {rm}");
            }
            return Err(e);
        }

        info!(app_id = %app_id, path = %target.display(), "installed");
        Ok(app_id)
    }

    pub fn uninstall_app(&mut self, app_id: &str) -> Result<()> {
        let result = self.try_uninstall(app_id);
        let result = self.report(result);
        if result.is_ok() {
            self.emit(RuntimeEvent::Uninstalled {
                app_id: app_id.to_string(),
            });
        }
        result
    }

    fn try_uninstall(&mut self, app_id: &str) -> Result<()> {
        let entry = self
            .registry
            .get(app_id)
            .cloned()
            .ok_or_else(|| MpkError::NotInstalled(app_id.to_string()))?;

        if self.loaded.contains_key(app_id) {
            self.unload_app(app_id)?;
        }

        let stored = self.stored_path(&entry);
        if stored.exists() {
            fs::remove_file(&stored).at(&stored)?;
        } else {
            warn!(app_id, path = %stored.display(), "installed package file already missing");
        }

        self.registry.remove(app_id);
        self.registry.save()?;
        info!(app_id, "uninstalled");
        Ok(())
    }

    pub fn list_installed_apps(&self) -> Vec<(&str, &RegistryEntry)> {
        self.registry.entries().collect()
    }

    pub fn installed_app_ids(&self) -> Vec<&str> {
        self.registry.ids()
    }

    pub fn is_loaded(&self, app_id: &str) -> bool {
        self.loaded.contains_key(app_id)
    }

    /// Registry entry plus what the stored package says about itself.
    pub fn installed_app_info(&self, app_id: &str) -> Result<AppInfo> {
        let entry = self
            .registry
            .get(app_id)
            .ok_or_else(|| MpkError::NotInstalled(app_id.to_string()))?;
        let package = MpkPackage::load(self.stored_path(entry))?;
        Ok(AppInfo {
            app_id: app_id.to_string(),
            entry: entry.clone(),
            manifest: package.manifest().clone(),
            files: package.list_files().into_iter().map(String::from).collect(),
            signature: package.signature_state().label().to_string(),
            loaded: self.is_loaded(app_id),
        })
    }

    /// Check permissions and dependencies, then stage the package contents.
    /// Loading an app that is already loaded does nothing.
    pub fn load_app(&mut self, app_id: &str) -> Result<()> {
        if self.loaded.contains_key(app_id) {
            debug!(app_id, "already loaded");
            return Ok(());
        }
        let result = self.try_load(app_id);
        let result = self.report(result);
        if result.is_ok() {
            self.emit(RuntimeEvent::Loaded {
                app_id: app_id.to_string(),
            });
        }
        result
    }

    fn try_load(&mut self, app_id: &str) -> Result<()> {
        let entry = self
            .registry
            .get(app_id)
            .ok_or_else(|| MpkError::NotInstalled(app_id.to_string()))?;
        let stored = self.stored_path(entry);
        if !stored.is_file() {
            return Err(MpkError::InvalidPackage(format!(
                "installed package file is missing: {}",
                stored.display()
            )));
        }
        let package = MpkPackage::load(&stored)?;
        let manifest = package.manifest();

        for permission in &manifest.permissions {
            if !self.config.permission_allowed(permission) {
                return Err(MpkError::PermissionDenied {
                    app_id: app_id.to_string(),
                    permission: permission.clone(),
                });
            }
        }

        let installed: BTreeSet<&str> = self
            .registry
            .entries()
            .map(|(_, e)| e.package_name.as_str())
            .collect();
        for dependency in &manifest.dependencies {
            if !installed.contains(dependency.as_str()) {
                return Err(MpkError::MissingDependency {
                    app_id: app_id.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }

        let staging = tempfile::Builder::new()
            .prefix(&format!("mpk-{app_id}-"))
            .tempdir()
            .at(std::env::temp_dir())?;
        package.extract_all(staging.path())?;
        debug!(app_id, staging = %staging.path().display(), "staged");

        self.loaded
            .insert(app_id.to_string(), LoadedApp { package, staging });
        info!(app_id, "loaded");
        Ok(())
    }

    pub fn unload_app(&mut self, app_id: &str) -> Result<()> {
        let result = match self.loaded.remove(app_id) {
            Some(app) => {
                let path = app.staging.path().to_path_buf();
                app.staging.close().at(path)
            }
            None => Err(MpkError::NotLoaded(app_id.to_string())),
        };
        let result = self.report(result);
        if result.is_ok() {
            info!(app_id, "unloaded");
            self.emit(RuntimeEvent::Unloaded {
                app_id: app_id.to_string(),
            });
        }
        result
    }

    fn loaded_app(&self, app_id: &str) -> Result<&LoadedApp> {
        self.loaded
            .get(app_id)
            .ok_or_else(|| MpkError::NotLoaded(app_id.to_string()))
    }

    /// Execution is simulated: resolve the staged entry point and report the
    /// environment the app would be started with.
    pub fn run_app(&self, app_id: &str) -> Result<RunReport> {
        let result = self.try_run(app_id);
        let result = self.report(result);
        if result.is_ok() {
            self.emit(RuntimeEvent::Started {
                app_id: app_id.to_string(),
            });
        }
        result
    }

    fn try_run(&self, app_id: &str) -> Result<RunReport> {
        let app = self.loaded_app(app_id)?;
        let manifest = app.package.manifest();
        let root = app.staging.path();

        let entry = app.package.entry_member().ok_or_else(|| {
            MpkError::InvalidPackage(format!("entry point '{}' is not in the package", manifest.entry_point))
        })?;
        let entry_path = entry
            .split('/')
            .fold(root.to_path_buf(), |acc, part| acc.join(part));
        let entry_size = fs::metadata(&entry_path).at(&entry_path)?.len();

        let mut env = BTreeMap::new();
        env.insert(
            "MPK_RESOURCE_DIR".to_string(),
            root.join(ASSETS_DIR).display().to_string(),
        );
        env.insert("MPK_APP_NAME".to_string(), manifest.name.clone());
        env.insert("MPK_VERSION".to_string(), manifest.version.clone());

        info!(
            app_id,
            code_type = %manifest.code_type,
            entry = %entry_path.display(),
            "starting app (simulated)"
        );
        Ok(RunReport {
            app_id: app_id.to_string(),
            code_type: manifest.code_type.clone(),
            entry_point: manifest.entry_point.clone(),
            entry_path,
            entry_size,
            env,
        })
    }

    /// Read one member of a loaded app.
    pub fn app_resource(&self, app_id: &str, path: &str) -> Result<&[u8]> {
        let result = self
            .loaded_app(app_id)
            .and_then(|app| app.package.read_file(path));
        self.report(result)
    }

    /// Copy a loaded app's `assets/` tree to `out_dir`.
    pub fn extract_app_resources(&self, app_id: &str, out_dir: &Path) -> Result<usize> {
        let result = self
            .loaded_app(app_id)
            .and_then(|app| app.package.extract_directory(ASSETS_DIR, out_dir));
        let result = self.report(result);
        if result.is_ok() {
            self.emit(RuntimeEvent::ResourcesExtracted {
                app_id: app_id.to_string(),
                dir: out_dir.to_path_buf(),
            });
        }
        result
    }

    /// Unload every loaded app.
    pub fn cleanup(&mut self) {
        let ids: Vec<String> = self.loaded.keys().cloned().collect();
        for app_id in ids {
            if let Err(e) = self.unload_app(&app_id) {
                warn!(app_id = %app_id, "cleanup failed: {e}");
            }
        }
    }
}

// The app id becomes a file name inside the install dir.
fn check_file_name_part(field: &str, value: &str) -> Result<()> {
    let value = value.trim();
    if value.is_empty() || value == "." || value.contains(['/', '\\']) || value.contains("..") {
        return Err(MpkError::InvalidPackage(format!(
            "manifest {field} '{value}' cannot be used as an install file name"
        )));
    }
    Ok(())
}
