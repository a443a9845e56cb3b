//! Error types for container execution.
//!
//! Every operation of the execution layer reports failures through
//! [`DockerError`]. The variants separate transport problems (retryable)
//! from invalid handles/references and caller mistakes (not retryable).

use thiserror::Error;

/// Errors that can occur during Docker operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DockerError {
    #[error("Docker daemon not reachable: {0}")]
    DaemonUnreachable(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Image '{image}' not found")]
    ImageNotFound { image: String },

    #[error("Invalid container configuration: {0}")]
    InvalidConfig(String),

    #[error("Request conflicts with current daemon state: {0}")]
    Conflict(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Container execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Docker daemon returned {status}: {message}")]
    Daemon { status: u16, message: String },

    #[error("Malformed daemon stream: {0}")]
    Stream(String),
}

impl DockerError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DockerError::DaemonUnreachable(_))
    }

    /// Whether the error refers to a missing container or image.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DockerError::ContainerNotFound { .. } | DockerError::ImageNotFound { .. }
        )
    }
}
