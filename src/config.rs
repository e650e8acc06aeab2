//! Runtime configuration for the marshaler.
//!
//! ## Environment Variables
//!
//! - `DOTNET_MARSHAL_STUB_PATH`: directory searched for the stub library (default: current
//!   directory)
//! - `DOTNET_MARSHAL_STUB_LIBRARY`: name of the library holding ahead-of-time marshal stubs;
//!   platform extensions and versioned names are tried
//! - `DOTNET_MARSHAL_VALIDATE_ALIGNMENT`: warn when a native buffer is misaligned for the
//!   type being copied (`"1"` or `"true"`). Always on with the `memory-validation` feature.
use std::{env, path::PathBuf};

pub const STUB_PATH_VAR: &str = "DOTNET_MARSHAL_STUB_PATH";
pub const STUB_LIBRARY_VAR: &str = "DOTNET_MARSHAL_STUB_LIBRARY";
pub const VALIDATE_ALIGNMENT_VAR: &str = "DOTNET_MARSHAL_VALIDATE_ALIGNMENT";

#[derive(Debug, Clone, PartialEq)]
pub struct MarshalConfig {
    pub stub_path: PathBuf,
    pub stub_library: Option<String>,
    pub validate_alignment: bool,
}

impl Default for MarshalConfig {
    fn default() -> Self {
        Self {
            stub_path: PathBuf::from("."),
            stub_library: None,
            validate_alignment: cfg!(feature = "memory-validation"),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl MarshalConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source; unset or malformed values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            stub_path: lookup(STUB_PATH_VAR)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.stub_path),
            stub_library: lookup(STUB_LIBRARY_VAR)
                .filter(|s| !s.is_empty())
                .or(defaults.stub_library),
            validate_alignment: defaults.validate_alignment
                || lookup(VALIDATE_ALIGNMENT_VAR)
                    .and_then(|v| parse_flag(&v))
                    .unwrap_or(false),
        }
    }
}
