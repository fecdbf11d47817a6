//! Trampoline configuration
//!
//! Loaded from the `[trampoline]` table of a TOML file:
//!
//! ```toml
//! [trampoline]
//! abi = "default"              # or a raw libffi ABI number
//! serialize_allocation = false
//! ```
//!
//! Environment variables override file values:
//! - `ATLAS_TRAMPOLINE_ABI`
//! - `ATLAS_TRAMPOLINE_SERIALIZE_ALLOC`

use crate::signature::Abi;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_ABI: &str = "ATLAS_TRAMPOLINE_ABI";
pub const ENV_SERIALIZE_ALLOC: &str = "ATLAS_TRAMPOLINE_SERIALIZE_ALLOC";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Calling convention as written in a configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AbiSetting {
    /// Raw libffi ABI number, passed through unchecked
    Raw(u32),
    /// Symbolic name; only `"default"` is known
    Named(String),
}

impl Default for AbiSetting {
    fn default() -> Self {
        AbiSetting::Named("default".to_string())
    }
}

impl AbiSetting {
    pub fn resolve(&self) -> ConfigResult<Abi> {
        match self {
            AbiSetting::Raw(raw) => Ok(Abi::from_raw(*raw as _)),
            AbiSetting::Named(name) if name == "default" => Ok(Abi::DEFAULT),
            AbiSetting::Named(name) => Err(ConfigError::InvalidValue {
                field: "trampoline.abi".to_string(),
                reason: format!("unknown ABI '{}', expected 'default' or a number", name),
            }),
        }
    }
}

impl From<&str> for AbiSetting {
    fn from(value: &str) -> Self {
        match value.trim().parse::<u32>() {
            Ok(raw) => AbiSetting::Raw(raw),
            Err(_) => AbiSetting::Named(value.trim().to_string()),
        }
    }
}

/// The `[trampoline]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct TrampolineConfig {
    /// Calling convention of generated pointers
    pub abi: AbiSetting,

    /// Lock around trampoline allocation and release
    pub serialize_allocation: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    trampoline: TrampolineConfig,
}

impl TrampolineConfig {
    /// Load the `[trampoline]` section of a TOML file
    ///
    /// A file without the section yields the defaults.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration text that did not come from a file
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Self::parse(content, Path::new("<string>"))
    }

    fn parse(content: &str, origin: &Path) -> ConfigResult<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| ConfigError::TomlParseError {
            file: origin.to_path_buf(),
            error: e,
        })?;

        file.trampoline.validate()?;
        Ok(file.trampoline)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.resolve_abi().map(|_| ())
    }

    pub fn resolve_abi(&self) -> ConfigResult<Abi> {
        self.abi.resolve()
    }

    /// Apply `ATLAS_TRAMPOLINE_*` environment variables on top of this config
    pub fn apply_env_overrides(mut self) -> ConfigResult<Self> {
        if let Ok(abi) = env::var(ENV_ABI) {
            self.abi = AbiSetting::from(abi.as_str());
        }

        if let Ok(serialize) = env::var(ENV_SERIALIZE_ALLOC) {
            self.serialize_allocation = parse_flag(ENV_SERIALIZE_ALLOC, &serialize)?;
        }

        self.validate()?;
        Ok(self)
    }
}

fn parse_flag(field: &str, value: &str) -> ConfigResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected a boolean, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_section() {
        let config = TrampolineConfig::from_toml_str(
            r#"
[trampoline]
abi = "default"
serialize_allocation = true
"#,
        )
        .unwrap();

        assert_eq!(config.abi, AbiSetting::Named("default".to_string()));
        assert!(config.serialize_allocation);
        assert_eq!(config.resolve_abi().unwrap(), Abi::DEFAULT);
    }

    #[test]
    fn test_missing_section_uses_defaults() {
        let config = TrampolineConfig::from_toml_str("").unwrap();
        assert_eq!(config, TrampolineConfig::default());
        assert!(!config.serialize_allocation);
    }

    #[test]
    fn test_numeric_abi() {
        let config = TrampolineConfig::from_toml_str("[trampoline]\nabi = 2\n").unwrap();
        assert_eq!(config.abi, AbiSetting::Raw(2));
        assert_eq!(config.resolve_abi().unwrap().as_raw(), 2);
    }

    #[test]
    fn test_unknown_abi_name() {
        let err = TrampolineConfig::from_toml_str("[trampoline]\nabi = \"fastcall\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "trampoline.abi"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err =
            TrampolineConfig::from_toml_str("[trampoline]\nserialise = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParseError { .. }));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("x", "YES").unwrap());
        assert!(!parse_flag("x", "0").unwrap());
        assert!(parse_flag("x", "maybe").is_err());
    }

    #[test]
    fn test_abi_setting_from_str() {
        assert_eq!(AbiSetting::from("7"), AbiSetting::Raw(7));
        assert_eq!(AbiSetting::from(" default "), AbiSetting::default());
    }
}
