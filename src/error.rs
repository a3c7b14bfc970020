//! Error types for recproxy

use std::io;
use thiserror::Error;

/// Result type for recproxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while recording, replaying or managing assets
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed admin body, unknown identifier, invalid regex and similar caller errors
    #[error("{0}")]
    BadRequest(String),

    /// Unknown session id or missing recording
    #[error("{0}")]
    NotFound(String),

    /// No stored entry matched a playback request. Carries the full diagnostic.
    #[error("{0}")]
    Mismatch(String),

    /// A git invocation failed fatally or exhausted its retries
    #[error("git {command} failed with exit code {exit_code} after {attempts} attempt(s): {stderr}")]
    Git {
        /// Arguments passed to git
        command: String,
        /// Process exit code (-1 when killed by a signal)
        exit_code: i32,
        /// Raw stderr of the last attempt
        stderr: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Installed git is missing or too old
    #[error("{0}")]
    GitVersion(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream service could not be reached during recording
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    /// Whether the error was caused by the caller rather than the proxy
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::BadRequest(_) | Self::NotFound(_) | Self::Mismatch(_)
        )
    }
}
