//! Error types for the Fencer service.

use thiserror::Error;

/// Main error type for Fencer operations.
#[derive(Error, Debug)]
pub enum FencerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Every validation failure found in a configuration, reported together
    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FencerError {
    /// The individual validation messages carried by this error.
    pub fn messages(&self) -> Vec<String> {
        match self {
            FencerError::InvalidConfig(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Result type alias for Fencer operations.
pub type Result<T> = std::result::Result<T, FencerError>;
