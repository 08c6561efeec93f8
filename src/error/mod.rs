//! Error types for Tether.

pub mod unified;

pub use unified::{ErrorBody, ErrorKind};

use thiserror::Error;

/// Primary error type for all Tether operations.
#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Rate limit exceeded for session {session_id}: retry after {retry_after_ms}ms")]
    RateLimitExceeded {
        session_id: String,
        retry_after_ms: u64,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Upstream transient error{}: {message}", code_suffix(.status, .code))]
    UpstreamTransient {
        status: Option<u16>,
        code: Option<&'static str>,
        message: String,
    },

    #[error("Upstream error{}: {message}", code_suffix(.status, &None))]
    UpstreamFatal {
        status: Option<u16>,
        message: String,
    },

    #[error("Operation aborted")]
    Aborted,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn code_suffix(status: &Option<u16>, code: &Option<&'static str>) -> String {
    match (status, code) {
        (Some(status), _) => format!(" (status {status})"),
        (None, Some(code)) => format!(" ({code})"),
        (None, None) => String::new(),
    }
}

impl TetherError {
    /// Transient failure reported by the upstream with an HTTP status.
    pub fn transient_status(status: u16, message: impl Into<String>) -> Self {
        Self::UpstreamTransient {
            status: Some(status),
            code: None,
            message: message.into(),
        }
    }

    /// Transient transport failure identified by an error code (e.g. `ECONNRESET`).
    pub fn transient_code(code: &'static str, message: impl Into<String>) -> Self {
        Self::UpstreamTransient {
            status: None,
            code: Some(code),
            message: message.into(),
        }
    }

    /// Non-retryable upstream failure.
    pub fn fatal_status(status: u16, message: impl Into<String>) -> Self {
        Self::UpstreamFatal {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::UpstreamTransient { .. } => ErrorKind::UpstreamTransient,
            Self::UpstreamFatal { .. } => ErrorKind::UpstreamFatal,
            Self::Aborted => ErrorKind::Aborted,
            Self::Persistence(_) => ErrorKind::PersistenceError,
            Self::Configuration(_) => ErrorKind::ConfigurationError,
            Self::Serialization(_) => ErrorKind::SerializationError,
        }
    }

    /// Whether the core retries this error on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTransient { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Boundary representation: kind plus the display message, nothing else.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TetherError>;
