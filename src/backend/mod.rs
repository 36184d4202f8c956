//! Execution backends
//!
//! A backend is reached only through four capabilities: open a session,
//! list jobs, query a job's status, and submit or cancel a job. One
//! implementation exists per backend kind and is selected from the host
//! address scheme at construction time:
//!
//! | scheme  | backend          | submission  |
//! |---------|------------------|-------------|
//! | `local` | `LocalBackend`   | interactive |
//! | `ssh`   | `ShellBackend`   | detached    |
//! | `slurm` | `SlurmBackend`   | interactive |

pub mod local;
pub mod shell;
pub mod slurm;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use cwl_model::JobState;

use crate::command::ExecutionPlan;
use crate::credential::Credential;
use crate::error::ComputeError;
use crate::host::transport::{CommandRunner, SshConfig, SshSession, SshTarget, TransportError};
use crate::host::HostConfig;

pub use local::LocalBackend;
pub use shell::ShellBackend;
pub use slurm::SlurmBackend;

/// Error raised by a backend, carrying its native class and message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct BackendError {
    /// Native error class (e.g. `SlurmSubmitError`, `TimeoutError`)
    pub class: String,
    pub message: String,
    /// Native error code (e.g. a process exit status), if any
    pub code: Option<i32>,
}

impl BackendError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }
}

impl From<TransportError> for BackendError {
    fn from(err: TransportError) -> Self {
        BackendError::new(err.class(), err.to_string())
    }
}

/// How a backend wants commands handed to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMode {
    /// The backend keeps a live handle on the process and manages
    /// redirection itself; the job's argv is executed directly.
    Interactive,
    /// The backend only fires commands; the job is wrapped in a
    /// backgrounded shell with its output redirected to files.
    Detached,
}

/// What a job missing from the backend's listing resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentJobPolicy {
    /// Backends that purge finished jobs
    Done,
    /// Backends that also purge cancelled or failed jobs
    Unknown,
}

impl AbsentJobPolicy {
    pub fn state(&self) -> JobState {
        match self {
            AbsentJobPolicy::Done => JobState::Done,
            AbsentJobPolicy::Unknown => JobState::Unknown,
        }
    }
}

impl FromStr for AbsentJobPolicy {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "done" => Ok(AbsentJobPolicy::Done),
            "unknown" => Ok(AbsentJobPolicy::Unknown),
            other => Err(ComputeError::ValidationFailure(format!(
                "absent-job-state must be `done` or `unknown`, got {other:?}"
            ))),
        }
    }
}

/// State reported by a backend for one of its jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    Running,
    Done,
    /// Any other native state (queued, held, suspended, ...)
    Other(String),
}

impl BackendState {
    pub fn to_job_state(&self) -> JobState {
        match self {
            BackendState::Running => JobState::Running,
            BackendState::Done => JobState::Done,
            BackendState::Other(_) => JobState::Pending,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Running => f.write_str("running"),
            BackendState::Done => f.write_str("done"),
            BackendState::Other(state) => f.write_str(state),
        }
    }
}

/// One entry of a backend job listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendJob {
    pub handle: String,
    /// State observed when the listing was taken
    pub state: BackendState,
}

impl BackendJob {
    pub fn new(handle: impl Into<String>, state: BackendState) -> Self {
        Self {
            handle: handle.into(),
            state,
        }
    }
}

/// An open connection to a backend. Never shared between calls.
pub trait Session {
    /// List every job the backend currently reports.
    fn list_jobs(&mut self) -> Result<Vec<BackendJob>, BackendError>;

    /// State of one listed job.
    fn job_status(&mut self, job: &BackendJob) -> Result<BackendState, BackendError>;

    /// Submit a plan; returns the backend handle once the backend accepted it.
    fn submit(&mut self, plan: &ExecutionPlan) -> Result<String, BackendError>;

    /// Cancel a listed job.
    fn cancel(&mut self, job: &BackendJob) -> Result<(), BackendError>;

    /// Release the session. Called exactly once per opened session.
    fn close(&mut self) -> Result<(), BackendError>;
}

/// A kind of execution backend
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn kind(&self) -> &'static str;

    fn submission_mode(&self) -> SubmissionMode;

    /// Default resolution of jobs the backend no longer lists.
    fn absent_job_policy(&self) -> AbsentJobPolicy {
        AbsentJobPolicy::Done
    }

    /// Open a session to `host`.
    fn open(&self, host: &HostConfig, credential: Option<&Credential>) -> Result<Box<dyn Session>, BackendError>;
}

/// Select the backend for a host from its address scheme.
pub fn for_host(host: &HostConfig) -> Result<Arc<dyn Backend>, ComputeError> {
    match host.address.scheme() {
        "local" => Ok(Arc::new(LocalBackend::new())),
        "ssh" => Ok(Arc::new(ShellBackend::new())),
        "slurm" => Ok(Arc::new(SlurmBackend::new())),
        other => Err(ComputeError::ValidationFailure(format!(
            "unsupported scheme {other:?} for host {}; expected local, ssh or slurm",
            host.name
        ))),
    }
}

/// Open an SSH session to the host, forwarding connection properties as
/// `ssh -o` options.
pub(crate) fn connect_ssh(host: &HostConfig, credential: Option<&Credential>) -> Result<Box<dyn CommandRunner>, BackendError> {
    let target = SshTarget::parse(host.address.hostname())
        .map_err(|message| BackendError::new("SshTargetError", message))?;

    let mut config = SshConfig::new(target, host.call_timeout);
    config.credential = credential.cloned();
    config.options = host.connection_properties.clone();

    let session = SshSession::connect(config).map_err(|e| {
        let error = BackendError::new("SshConnectError", e.to_string());
        match e.code() {
            Some(code) => error.with_code(code),
            None => error,
        }
    })?;
    Ok(Box::new(session))
}

/// Map a failed command to a backend error of the given class.
pub(crate) fn command_failed(class: &str, output: &crate::host::transport::CommandOutput) -> BackendError {
    let error = BackendError::new(class, output.diagnostic());
    match output.status {
        Some(code) => error.with_code(code),
        None => error,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_backend_state_mapping() {
        assert_eq!(BackendState::Running.to_job_state(), JobState::Running);
        assert_eq!(BackendState::Done.to_job_state(), JobState::Done);
        assert_eq!(
            BackendState::Other("PENDING".into()).to_job_state(),
            JobState::Pending
        );
        assert_eq!(
            BackendState::Other("SUSPENDED".into()).to_job_state(),
            JobState::Pending
        );
    }

    #[test]
    fn test_absent_policy_parse() {
        assert_eq!("done".parse::<AbsentJobPolicy>().unwrap(), AbsentJobPolicy::Done);
        assert_eq!("Unknown".parse::<AbsentJobPolicy>().unwrap(), AbsentJobPolicy::Unknown);
        assert!("maybe".parse::<AbsentJobPolicy>().is_err());
        assert_eq!(AbsentJobPolicy::Unknown.state(), JobState::Unknown);
    }

    #[test]
    fn test_backend_selection_by_scheme() {
        let host = |address: &str| HostConfig::new("h", address, "/w", BTreeMap::new()).unwrap();

        let backend = for_host(&host("local://localhost")).unwrap();
        assert_eq!(backend.kind(), "local");
        assert_eq!(backend.submission_mode(), SubmissionMode::Interactive);

        let backend = for_host(&host("ssh://cluster")).unwrap();
        assert_eq!(backend.kind(), "ssh");
        assert_eq!(backend.submission_mode(), SubmissionMode::Detached);

        let backend = for_host(&host("slurm://login")).unwrap();
        assert_eq!(backend.kind(), "slurm");
        assert_eq!(backend.submission_mode(), SubmissionMode::Interactive);

        let err = for_host(&host("gridengine://head")).err().unwrap();
        assert!(matches!(err, ComputeError::ValidationFailure(_)));
    }

    #[test]
    fn test_transport_error_keeps_class() {
        let err: BackendError = TransportError::EmptyCommand.into();
        assert_eq!(err.class, "EmptyCommand");
    }
}
