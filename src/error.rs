//! Error types for pathproxy.
//!
//! Only startup-surface failures are typed: a failed bind or a broken
//! configuration refuses to start the service. Per-request I/O failures are
//! reported as boolean outcomes at the leaves and folded into tracker state,
//! never propagated as errors.

use thiserror::Error;

/// Fatal errors surfaced by the startup path.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Configuration file could not be read.
    #[error("configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
