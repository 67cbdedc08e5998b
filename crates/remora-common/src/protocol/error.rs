use thiserror::Error;

use super::scm::ScmErrorKind;
use super::status::Status;

#[derive(Error, Debug)]
pub enum RemoraError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Channel closed")]
    ClosedChannel,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session control error ({kind}): {message}")]
    SessionControl { kind: ScmErrorKind, message: String },

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No available connection")]
    NoAvailableConnection,

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },
}

impl RemoraError {
    pub fn session(kind: ScmErrorKind, message: impl Into<String>) -> Self {
        RemoraError::SessionControl {
            kind,
            message: message.into(),
        }
    }

    /// Status used when this error is turned into a wire response.
    pub fn status(&self) -> Status {
        match self {
            RemoraError::Timeout(_) => Status::Timeout,
            RemoraError::ClosedChannel | RemoraError::Connection(_) | RemoraError::Io(_) => {
                Status::ChannelClosed
            }
            RemoraError::HandshakeFailed(_) => Status::Forbidden,
            RemoraError::InvalidRequest(_)
            | RemoraError::InvalidEndpoint(_)
            | RemoraError::Serialization(_)
            | RemoraError::FrameTooLarge { .. } => Status::BadRequest,
            RemoraError::NotSupported(_) => Status::NotImplemented,
            _ => Status::InternalServerError,
        }
    }
}

impl From<tokio::time::error::Elapsed> for RemoraError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RemoraError::Timeout(0)
    }
}

pub type Result<T> = std::result::Result<T, RemoraError>;
