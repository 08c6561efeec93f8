//! Machine-readable error classification for the API boundary.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Stable error kind surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    SessionNotFound,
    RateLimitExceeded,
    InvalidState,
    UpstreamTransient,
    UpstreamFatal,
    Aborted,
    PersistenceError,
    ConfigurationError,
    SerializationError,
}

/// Error payload returned at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}
