use std::path::PathBuf;

/// Errors produced while building, reading, installing or running packages.
#[derive(thiserror::Error, Debug)]
pub enum MpkError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("{0}")]
    Manifest(String),
    #[error("Manifest is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("invalid package: {0}")]
    InvalidPackage(String),
    #[error("invalid member path '{0}'")]
    InvalidPath(String),
    #[error("key error: {0}")]
    Key(String),
    #[error("signature error: {0}")]
    Signature(String),
    #[error("app '{0}' is already installed")]
    AlreadyInstalled(String),
    #[error("app '{0}' is not installed")]
    NotInstalled(String),
    #[error("app '{0}' is not loaded")]
    NotLoaded(String),
    #[error("permission '{permission}' requested by '{app_id}' is not allowed")]
    PermissionDenied { app_id: String, permission: String },
    #[error("dependency '{dependency}' of '{app_id}' is not installed")]
    MissingDependency { app_id: String, dependency: String },
}

pub type Result<T> = std::result::Result<T, MpkError>;

/// Attach the offending path to an `io::Error`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| MpkError::Io {
            path: path.into(),
            source,
        })
    }
}
