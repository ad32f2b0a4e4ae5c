//! Error types for multiwan core

use multiwan_types::TaskId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in multiwan core
#[derive(Debug, Error)]
pub enum EngineError {
    /// DNS, connect, TLS, timeout or HTTP status failure.
    /// `downloaded` is preserved so the task stays resumable.
    #[error("Network error: {message}")]
    Network { message: String, downloaded: u64 },

    #[error("File I/O error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid source IP: {0}")]
    InvalidSourceIp(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn network(error: reqwest::Error, downloaded: u64) -> Self {
        EngineError::Network {
            message: describe_reqwest_error(&error),
            downloaded,
        }
    }

    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Bytes written before the failure, when the failure keeps that count
    pub fn downloaded(&self) -> Option<u64> {
        match self {
            EngineError::Network { downloaded, .. } => Some(*downloaded),
            _ => None,
        }
    }

    /// Message reported on the failure event
    pub fn failure_message(&self) -> String {
        match self.downloaded() {
            Some(n) if n > 0 => format!("{} ({} bytes downloaded)", self, n),
            _ => self.to_string(),
        }
    }
}

/// Flattens the reqwest error chain into a single line
fn describe_reqwest_error(error: &reqwest::Error) -> String {
    let mut message = if error.is_timeout() {
        format!("timed out: {}", error)
    } else if error.is_connect() {
        format!("connection failed: {}", error)
    } else {
        error.to_string()
    };

    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
