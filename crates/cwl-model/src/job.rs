//! Job record and job state
//!
//! A `Job` is the logical unit the caller submits. The backend handle
//! (`batch_id` on the wire) is assigned once at submission and never
//! changes afterwards; resubmitting creates a new `Job`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::DEFAULT_MAX_RUNTIME_MINUTES;

/// Last known state of a job as reported by its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Known to the backend but not running yet
    #[default]
    Pending,
    /// Actively executing
    Running,
    /// Finished, or no longer reported by the backend
    Done,
    /// The backend could not be queried for this job
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Unknown => "UNKNOWN",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "DONE" => Ok(JobState::Done),
            "UNKNOWN" => Ok(JobState::Unknown),
            _ => Err(JobError::InvalidState(s.to_string())),
        }
    }
}

/// Errors for job record validation and mutation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job id must not be empty")]
    EmptyId,

    #[error("job id {0:?} may only contain ASCII letters, digits, '.', '_' and '-'")]
    InvalidId(String),

    #[error("job {0}: argv must not be empty")]
    EmptyArgv(String),

    #[error("job {job_id}: argv[{index}] contains a single quote, which cannot be passed through the shell wrapper")]
    UnquotableArgument { job_id: String, index: usize },

    #[error("job {0}: max_runtime_minutes must be positive")]
    InvalidMaxRuntime(String),

    #[error("job {job_id} already has backend handle {existing}")]
    HandleAlreadyAssigned { job_id: String, existing: String },

    #[error("invalid job state: {0}")]
    InvalidState(String),
}

fn default_max_runtime() -> u32 {
    DEFAULT_MAX_RUNTIME_MINUTES
}

/// A logical job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Logical identifier, unique within the registry
    pub id: String,

    /// Command and arguments; argv[0] is the executable
    pub argv: Vec<String>,

    /// Directory the job runs in and writes its output files to
    pub working_directory: PathBuf,

    /// Backend-enforced wall-clock limit
    #[serde(default = "default_max_runtime")]
    pub max_runtime_minutes: u32,

    /// Backend handle, set once at submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    batch_id: Option<String>,

    /// Last known state
    #[serde(default)]
    pub state: JobState,

    /// When the backend accepted the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create an unsubmitted job with the default runtime limit.
    pub fn new(id: impl Into<String>, argv: Vec<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            argv,
            working_directory: working_directory.into(),
            max_runtime_minutes: DEFAULT_MAX_RUNTIME_MINUTES,
            batch_id: None,
            state: JobState::Pending,
            submitted_at: None,
        }
    }

    pub fn with_max_runtime(mut self, minutes: u32) -> Self {
        self.max_runtime_minutes = minutes;
        self
    }

    /// The backend handle, if the job has been submitted.
    pub fn batch_id(&self) -> Option<&str> {
        self.batch_id.as_deref()
    }

    /// Record the backend handle. Fails if one was already recorded.
    pub fn assign_handle(&mut self, handle: impl Into<String>) -> Result<(), JobError> {
        if let Some(existing) = &self.batch_id {
            return Err(JobError::HandleAlreadyAssigned {
                job_id: self.id.clone(),
                existing: existing.clone(),
            });
        }
        self.batch_id = Some(handle.into());
        self.submitted_at = Some(Utc::now());
        Ok(())
    }

    /// A fresh, unsubmitted copy of this job under the same logical id.
    pub fn resubmission(&self) -> Job {
        Job {
            id: self.id.clone(),
            argv: self.argv.clone(),
            working_directory: self.working_directory.clone(),
            max_runtime_minutes: self.max_runtime_minutes,
            batch_id: None,
            state: JobState::Pending,
            submitted_at: None,
        }
    }

    /// Name of the file the job's stdout is redirected to.
    pub fn stdout_file(&self) -> String {
        format!("stdout_{}.txt", self.id)
    }

    /// Name of the file the job's stderr is redirected to.
    pub fn stderr_file(&self) -> String {
        format!("stderr_{}.txt", self.id)
    }

    /// Check the fields needed before the job reaches a backend.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.id.is_empty() {
            return Err(JobError::EmptyId);
        }
        // ids end up in file names, environment assignments and scheduler
        // options, where `,` `%` `/` and quotes are all special
        if !self.id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            return Err(JobError::InvalidId(self.id.clone()));
        }
        if self.argv.is_empty() || self.argv[0].is_empty() {
            return Err(JobError::EmptyArgv(self.id.clone()));
        }
        if let Some(index) = self.argv.iter().position(|arg| arg.contains('\'')) {
            return Err(JobError::UnquotableArgument {
                job_id: self.id.clone(),
                index,
            });
        }
        if self.max_runtime_minutes == 0 {
            return Err(JobError::InvalidMaxRuntime(self.id.clone()));
        }
        Ok(())
    }
}

/// A job removed from the active set after cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedJob {
    #[serde(flatten)]
    pub job: Job,
    pub archived_at: DateTime<Utc>,
    pub reason: String,
}

impl ArchivedJob {
    pub fn new(job: &Job, reason: impl Into<String>) -> Self {
        let mut job = job.clone();
        job.state = JobState::Done;
        Self {
            job,
            archived_at: Utc::now(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Job {
        Job::new("job-1", vec!["echo".into(), "hi there".into()], "/tmp/jobs")
    }

    #[test]
    fn test_new_job_defaults() {
        let job = sample();
        assert_eq!(job.max_runtime_minutes, 1440);
        assert_eq!(job.state, JobState::Pending);
        assert!(job.batch_id().is_none());
        assert!(job.submitted_at.is_none());
    }

    #[test]
    fn test_handle_is_assigned_once() {
        let mut job = sample();
        job.assign_handle("4242").unwrap();
        assert_eq!(job.batch_id(), Some("4242"));
        assert!(job.submitted_at.is_some());

        let err = job.assign_handle("4343").unwrap_err();
        assert_eq!(
            err,
            JobError::HandleAlreadyAssigned {
                job_id: "job-1".into(),
                existing: "4242".into()
            }
        );
        assert_eq!(job.batch_id(), Some("4242"));
    }

    #[test]
    fn test_resubmission_clears_handle() {
        let mut job = sample();
        job.assign_handle("1").unwrap();
        job.state = JobState::Running;

        let again = job.resubmission();
        assert_eq!(again.id, job.id);
        assert_eq!(again.argv, job.argv);
        assert!(again.batch_id().is_none());
        assert_eq!(again.state, JobState::Pending);
    }

    #[test]
    fn test_output_file_names() {
        let job = sample();
        assert_eq!(job.stdout_file(), "stdout_job-1.txt");
        assert_eq!(job.stderr_file(), "stderr_job-1.txt");
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_records() {
        let mut job = sample();
        job.argv.clear();
        assert_eq!(job.validate(), Err(JobError::EmptyArgv("job-1".into())));

        let mut job = sample();
        job.argv.push("it's".into());
        assert_eq!(
            job.validate(),
            Err(JobError::UnquotableArgument {
                job_id: "job-1".into(),
                index: 2
            })
        );

        let mut job = sample();
        job.id = String::new();
        assert_eq!(job.validate(), Err(JobError::EmptyId));

        for id in ["../escape", "a,b%j", "a b", "it's", "x=y", "caf\u{e9}"] {
            let mut job = sample();
            job.id = id.into();
            assert_eq!(job.validate(), Err(JobError::InvalidId(id.into())), "{id:?}");
        }
        let mut job = sample();
        job.id = "wf-2026.10_run-3".into();
        assert!(job.validate().is_ok());

        let job = sample().with_max_runtime(0);
        assert!(matches!(job.validate(), Err(JobError::InvalidMaxRuntime(_))));
    }

    #[test]
    fn test_wire_format_uses_batch_id() {
        let mut job = sample();
        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("batch_id").is_none());

        job.assign_handle("77").unwrap();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["batch_id"], "77");
        assert_eq!(json["state"], "PENDING");

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back.batch_id(), Some("77"));
    }

    #[test]
    fn test_minimal_record_deserializes() {
        let job: Job = serde_json::from_str(
            r#"{"id": "a", "argv": ["true"], "working_directory": "/w", "batch_id": "9"}"#,
        )
        .unwrap();
        assert_eq!(job.batch_id(), Some("9"));
        assert_eq!(job.max_runtime_minutes, 1440);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("running".parse::<JobState>().unwrap(), JobState::Running);
        assert_eq!("DONE".parse::<JobState>().unwrap(), JobState::Done);
        assert!("finished".parse::<JobState>().is_err());
        assert!(JobState::Pending.is_active());
        assert!(!JobState::Unknown.is_active());
    }

    #[test]
    fn test_archived_job_is_done() {
        let mut job = sample();
        job.assign_handle("5").unwrap();
        job.state = JobState::Running;
        let archived = ArchivedJob::new(&job, "cancelled");
        assert_eq!(archived.job.state, JobState::Done);
        assert_eq!(archived.job.batch_id(), Some("5"));
        assert_eq!(archived.reason, "cancelled");

        let json = serde_json::to_value(&archived).unwrap();
        assert_eq!(json["id"], "job-1");
        assert_eq!(json["reason"], "cancelled");
    }
}
