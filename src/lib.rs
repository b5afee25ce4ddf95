#![forbid(unsafe_code)]
//! MPK packages: a ZIP container with a JSON manifest and an optional
//! RSA-PSS signature, plus an installer/runtime that keeps a registry of
//! installed apps.

pub mod archive;
pub mod config;
pub mod error;
pub mod inspect;
pub mod manifest;
pub mod package;
pub mod registry;
pub mod runtime;
pub mod signature;

pub use archive::{MpkPackage, ValidationReport};
pub use config::Config;
pub use error::{MpkError, Result};
pub use manifest::Manifest;
pub use runtime::{Runtime, RuntimeEvent};
