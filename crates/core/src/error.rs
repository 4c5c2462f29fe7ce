//! Error types for the engine and its configuration

use pagetile_render::{DecodeError, ImageId};
use thiserror::Error;

/// Errors from opening or driving a page
#[derive(Debug, Error)]
pub enum PageError {
    /// The source could not be probed. Fatal for the page.
    #[error("failed to probe {image}: {error}")]
    Probe {
        image: String,
        #[source]
        error: DecodeError,
    },

    #[error("invalid display size {width}x{height}")]
    InvalidDisplaySize { width: f32, height: f32 },

    #[error("{0} is closed")]
    Closed(ImageId),
}

/// Result type for page operations
pub type PageResult<T> = Result<T, PageError>;

/// Errors from loading or validating an [`EngineConfig`](crate::EngineConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors from starting a [`TileEngine`](crate::TileEngine)
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start decode workers: {0}")]
    Workers(#[from] std::io::Error),
}
