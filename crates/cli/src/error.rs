//! Error types for CLI operations.

use std::path::Path;

use contracts::ScError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Load or validation failure, with the file it came from
    #[error("Invalid configuration {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: ScError,
    },

    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: ScError,
    },

    #[error("{what} is not configured")]
    MissingSection { what: &'static str },

    #[error(transparent)]
    Sc(#[from] ScError),
}

impl CliError {
    pub fn config_not_found(path: &Path) -> Self {
        Self::ConfigNotFound {
            path: path.display().to_string(),
        }
    }

    pub fn config(path: &Path, source: ScError) -> Self {
        Self::Config {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn connect(endpoint: impl ToString, source: ScError) -> Self {
        Self::Connect {
            endpoint: endpoint.to_string(),
            source,
        }
    }
}

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
