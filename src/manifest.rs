use crate::error::{MpkError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Error, Formatter};
use tracing::warn;

/// Manifest format revision written by this crate.
pub const FORMAT_VERSION: &str = "2.1";

/// Top-level keys every `manifest.json` must carry.
pub const REQUIRED_FIELDS: &[&str] = &[
    "code_type",
    "entry_point",
    "id",
    "min_platform_version",
    "name",
    "platform",
    "version",
];

const ANDROID_CODE_TYPES: &[&str] = &["javascript", "wasm", "bytecode"];

// === Manifest schema ===
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(default = "default_format_version")]
    pub format_version: String,
    pub id: String,
    pub name: String,
    pub version: String,
    pub platform: String,
    pub min_platform_version: String,
    pub code_type: String,
    pub entry_point: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<Value>,
    /// Keys this crate does not model, kept so a rewrite preserves them.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_format_version() -> String {
    FORMAT_VERSION.to_string()
}

impl Manifest {
    /// A manifest with the platform defaults filled in.
    pub fn new(id: impl Into<String>, name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            id: id.into(),
            name: name.into(),
            version: "1.0.0".to_string(),
            platform: "all".to_string(),
            min_platform_version: "1.0.0".to_string(),
            code_type: "javascript".to_string(),
            entry_point: entry_point.into(),
            permissions: Vec::new(),
            dependencies: Vec::new(),
            description: None,
            icon: None,
            author: None,
            sandbox: None,
            extra: Map::new(),
        }
    }

    /// Registry key of this package: `{id}_{version}`.
    pub fn app_id(&self) -> String {
        format!("{}_{}", self.id, self.version)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Merge `updates` into the manifest. The result must still satisfy the schema.
    pub fn update(&mut self, updates: &Map<String, Value>) -> Result<()> {
        let mut current = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => return Err(MpkError::Manifest("Manifest must be a JSON object".into())),
        };
        for (key, value) in updates {
            current.insert(key.clone(), value.clone());
        }
        *self = from_object(current)?;
        Ok(())
    }

    /// `platform` is `all`, equal to `target`, or a comma list naming it.
    pub fn supports_platform(&self, target: &str) -> bool {
        let target = target.trim().to_ascii_lowercase();
        let platform = self.platform.to_ascii_lowercase();
        platform == "all"
            || platform == target
            || platform.split(',').any(|p| p.trim() == target)
    }

    pub fn is_android_compatible(&self) -> bool {
        self.supports_platform("android")
            && !self.id.trim().is_empty()
            && ANDROID_CODE_TYPES.contains(&self.code_type.to_ascii_lowercase().as_str())
    }
}

impl Display for Manifest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::result::Result<(), Error> {
        match serde_json::to_string_pretty(self) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => Err(Error),
        }
    }
}

pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    // empty / whitespace-only guard (keeps a nice error)
    if bytes.is_empty() || bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(MpkError::Manifest("Manifest is empty".into()));
    }

    let s = std::str::from_utf8(bytes)
        .map_err(|e| MpkError::Manifest(format!("Manifest is not valid UTF-8: {e}")))?;

    let value: Value = serde_json::from_str(s)
        .map_err(|e| MpkError::Manifest(format!("Manifest JSON is invalid: {e}")))?;
    let Value::Object(map) = value else {
        return Err(MpkError::Manifest("Manifest must be a JSON object".into()));
    };

    let manifest = from_object(map)?;
    if manifest.format_version != FORMAT_VERSION {
        warn!(
            found = %manifest.format_version,
            expected = FORMAT_VERSION,
            "manifest format_version differs from the supported revision"
        );
    }
    Ok(manifest)
}

fn from_object(map: Map<String, Value>) -> Result<Manifest> {
    let mut missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|field| !map.contains_key(**field))
        .map(|field| field.to_string())
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(MpkError::MissingFields(missing));
    }

    serde_json::from_value(Value::Object(map)).map_err(|e| {
        MpkError::Manifest(format!("Manifest does not match the expected schema: {e}"))
    })
}
