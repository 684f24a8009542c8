use std::path::PathBuf;
use thiserror::Error;

use crate::error::{ErrorCode, WorklaneError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported configuration format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Invalid YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid TOML in {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for WorklaneError {
    fn from(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::NotFound(_) | ConfigError::Read { .. } => ErrorCode::CONFIG_NOT_FOUND,
            ConfigError::UnsupportedFormat(_) => ErrorCode::CONFIG_UNSUPPORTED_FORMAT,
            ConfigError::Yaml { .. } => ErrorCode::CONFIG_INVALID_YAML,
            ConfigError::Toml { .. } => ErrorCode::CONFIG_INVALID_TOML,
            ConfigError::InvalidValue { .. } => ErrorCode::CONFIG_INVALID_VALUE,
        };
        WorklaneError::config_with_code(code, err.to_string()).with_source(err)
    }
}
