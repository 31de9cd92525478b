//! Worker configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse worker config: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required setting: {0}")]
    MissingField(String),

    #[error("invalid {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("'{0}' is defined more than once")]
    Duplicate(String),

    #[error("environment variable {var}: {message}")]
    Env { var: String, message: String },

    #[error("failed to read worker config: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn env(var: &str, message: impl Into<String>) -> Self {
        ConfigError::Env {
            var: var.to_string(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
