//! Error taxonomy for experiment configuration.
//!
//! Invalid configuration values fail fast before any gradient step; all
//! other failures propagate as `anyhow::Error` and terminate the run.

use thiserror::Error;

/// Rejected configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A string selector did not match any known variant.
    #[error("invalid {field}: '{value}'")]
    InvalidSelector { field: &'static str, value: String },

    /// A numeric option outside its valid range.
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn selector(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidSelector {
            field,
            value: value.into(),
        }
    }
}
