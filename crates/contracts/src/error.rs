//! Layered error definitions
//!
//! Categorized by source: config / geometry / network / protocol

use thiserror::Error;

/// Unified error type for every scan-conversion entry point
#[derive(Debug, Error)]
pub enum ScError {
    // ===== Capability Errors =====
    /// The operation exists on the control surface but this object cannot do it
    #[error("operation '{operation}' not supported by {target}")]
    NotSupported {
        operation: &'static str,
        target: String,
    },

    // ===== Argument Errors =====
    /// Rejected argument; prior state is left unchanged
    #[error("invalid argument '{field}': {message}")]
    InvalidArgument { field: String, message: String },

    /// Tables, buffers or connection not in a usable state yet
    #[error("not ready: {message}")]
    NotReady { message: String },

    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Network Errors =====
    /// Socket level failure
    #[error("network error on '{endpoint}': {message}")]
    Network { endpoint: String, message: String },

    /// Malformed or undersized wire data
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Remote side answered a command with an error
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    /// Timed out waiting for a peer
    #[error("timeout after {waited_ms}ms: {what}")]
    Timeout { waited_ms: u64, what: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result alias used throughout the workspace
pub type ScResult<T> = Result<T, ScError>;

impl ScError {
    /// Create not-supported error
    pub fn not_supported(operation: &'static str, target: impl Into<String>) -> Self {
        Self::NotSupported {
            operation,
            target: target.into(),
        }
    }

    /// Create invalid-argument error
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady {
            message: message.into(),
        }
    }

    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create network error
    pub fn network(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn timeout(waited_ms: u64, what: impl Into<String>) -> Self {
        Self::Timeout {
            waited_ms,
            what: what.into(),
        }
    }

    /// True for the "cannot do this" class, as opposed to "tried and failed"
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }

    /// Numeric code carried on the command channel
    pub fn code(&self) -> i32 {
        match self {
            Self::NotSupported { .. } => 1,
            Self::InvalidArgument { .. } => 2,
            Self::NotReady { .. } => 3,
            Self::ConfigParse { .. } | Self::ConfigValidation { .. } => 4,
            Self::Network { .. } | Self::Io(_) => 5,
            Self::Protocol { .. } => 6,
            Self::Remote { code, .. } => *code,
            Self::Timeout { .. } => 7,
            Self::Other(_) => 99,
        }
    }

    /// Rebuild an error from a command-channel code, keeping the
    /// unsupported/failed split across the wire
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            1 => Self::NotSupported {
                operation: "remote",
                target: message,
            },
            2 => Self::InvalidArgument {
                field: "remote".into(),
                message,
            },
            _ => Self::Remote { code, message },
        }
    }
}
