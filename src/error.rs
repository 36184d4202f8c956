//! Compute resource error taxonomy
//!
//! Every failure of submit, status or kill surfaces as one of four
//! distinguishable kinds. Per-job query failures inside a batched status
//! call never reach this type: they degrade to `JobState::Unknown`.

use cwl_model::{AddressError, ErrorCode, JobError};
use serde::Serialize;

use crate::backend::BackendError;

/// Errors returned by the compute resource
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    #[error("cannot connect to backend{}: {message}", code.map(|c| format!(" (code {c})")).unwrap_or_default())]
    ConnectionFailure { code: Option<i32>, message: String },

    #[error("{class}: {message}")]
    IoFailure { class: String, message: String },

    #[error("job {job_id} has no backend handle")]
    MissingHandle { job_id: String },
}

impl ComputeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ValidationFailure(_) => ErrorCode::ValidationFailure,
            Self::ConnectionFailure { .. } => ErrorCode::ConnectionFailure,
            Self::IoFailure { .. } => ErrorCode::IoFailure,
            Self::MissingHandle { .. } => ErrorCode::MissingHandle,
        }
    }

    /// Wrap a backend error raised after the session was established.
    pub fn io(context: &str, err: BackendError) -> Self {
        Self::IoFailure {
            class: err.class,
            message: format!("{context}: {}", err.message),
        }
    }

    /// Wrap a backend error raised while opening the session.
    pub fn connection(err: BackendError) -> Self {
        Self::ConnectionFailure {
            code: err.code,
            message: format!("{}: {}", err.class, err.message),
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ValidationFailure(_) => 10,
            Self::ConnectionFailure { .. } => 20,
            Self::IoFailure { .. } => 40,
            Self::MissingHandle { .. } => 50,
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<JobError> for ComputeError {
    fn from(err: JobError) -> Self {
        Self::ValidationFailure(err.to_string())
    }
}

impl From<AddressError> for ComputeError {
    fn from(err: AddressError) -> Self {
        Self::ValidationFailure(err.to_string())
    }
}

/// Machine-readable error object printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
}

pub type ComputeResult<T> = Result<T, ComputeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_failure_keeps_backend_class() {
        let err = ComputeError::io(
            "Cannot submit job",
            BackendError::new("SlurmSubmitError", "sbatch: invalid partition"),
        );
        assert_eq!(err.code(), ErrorCode::IoFailure);
        assert_eq!(
            err.to_string(),
            "SlurmSubmitError: Cannot submit job: sbatch: invalid partition"
        );
    }

    #[test]
    fn test_connection_failure_carries_native_code() {
        let err = ComputeError::connection(
            BackendError::new("SshConnectError", "Permission denied").with_code(255),
        );
        match &err {
            ComputeError::ConnectionFailure { code, message } => {
                assert_eq!(*code, Some(255));
                assert!(message.contains("Permission denied"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("(code 255)"));
        assert!(err.code().is_retryable());
    }

    #[test]
    fn test_job_errors_are_validation_failures() {
        let err: ComputeError = JobError::EmptyId.into();
        assert_eq!(err.code(), ErrorCode::ValidationFailure);
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    fn test_report_serialization() {
        let err = ComputeError::MissingHandle {
            job_id: "j1".into(),
        };
        let json = serde_json::to_value(err.to_report()).unwrap();
        assert_eq!(json["code"], "MISSING_HANDLE");
        assert_eq!(json["message"], "job j1 has no backend handle");
    }
}
