//! Stable error codes for compute operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes reported to callers of the compute resource.
///
/// These codes are stable and used for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed host address or job record. Raised before any I/O.
    ValidationFailure,
    /// The session to the backend could not be established.
    ConnectionFailure,
    /// The backend accepted the connection but failed the operation.
    IoFailure,
    /// Status or kill was requested for a job that was never submitted.
    MissingHandle,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailure => "VALIDATION_FAILURE",
            Self::ConnectionFailure => "CONNECTION_FAILURE",
            Self::IoFailure => "IO_FAILURE",
            Self::MissingHandle => "MISSING_HANDLE",
        }
    }

    /// Whether a caller may reasonably retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailure)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
