//! Compute resource
//!
//! A `ComputeResource` is bound to one host for the life of the process.
//! It submits jobs, queries their states in batches, and cancels them,
//! opening one scoped session per call. It never retains job records; the
//! caller persists the returned handles and states.

use std::sync::Arc;

use cwl_model::{ArchivedJob, Job, JobError, JobState};
use tracing::{info, instrument, warn};

use crate::backend::{self, AbsentJobPolicy, Backend, BackendJob, Session, SubmissionMode};
use crate::command::CommandBuilder;
use crate::connection::ConnectionFactory;
use crate::credential;
use crate::error::{ComputeError, ComputeResult};
use crate::host::HostConfig;

/// Reason recorded on jobs archived by [`ComputeResource::kill`].
pub const CANCELLED_REASON: &str = "cancelled";

/// Submit, status and kill against a single host
#[derive(Debug)]
pub struct ComputeResource {
    connections: ConnectionFactory,
    builder: CommandBuilder,
    mode: SubmissionMode,
    absent_jobs: AbsentJobPolicy,
}

impl ComputeResource {
    /// Build a resource for `host`, selecting the backend from its scheme.
    pub fn new(host: HostConfig) -> ComputeResult<Self> {
        let backend = backend::for_host(&host)?;
        Ok(Self::with_backend(host, backend))
    }

    /// Build a resource for `host` on an explicit backend.
    pub fn with_backend(host: HostConfig, backend: Arc<dyn Backend>) -> Self {
        let credential = credential::resolve(host.properties());
        let mode = backend.submission_mode();
        let absent_jobs = host
            .absent_jobs
            .unwrap_or_else(|| backend.absent_job_policy());
        let builder = CommandBuilder::new(host.job_id_variable.clone());

        info!(
            host = %host.name,
            address = %host.address,
            backend = backend.kind(),
            mode = ?mode,
            credential = credential.as_ref().map(|c| c.kind()).unwrap_or("ambient"),
            "compute resource ready"
        );

        Self {
            connections: ConnectionFactory::new(backend, Arc::new(host), credential),
            builder,
            mode,
            absent_jobs,
        }
    }

    pub fn host(&self) -> &HostConfig {
        self.connections.host()
    }

    pub fn submission_mode(&self) -> SubmissionMode {
        self.mode
    }

    pub fn absent_job_policy(&self) -> AbsentJobPolicy {
        self.absent_jobs
    }

    /// Submit a job and return the backend handle.
    ///
    /// Interactive backends return once the backend has accepted the job;
    /// detached submissions return once the wrapper has been started. The
    /// caller records the handle on the job.
    #[instrument(skip(self, job), fields(host = %self.host().name, job_id = %job.id))]
    pub fn submit(&self, job: &Job) -> ComputeResult<String> {
        job.validate()?;
        if let Some(existing) = job.batch_id() {
            return Err(JobError::HandleAlreadyAssigned {
                job_id: job.id.clone(),
                existing: existing.to_string(),
            }
            .into());
        }

        let plan = self.builder.build(job, self.mode);
        let handle = self.connections.with_session(|session| {
            session
                .submit(&plan)
                .map_err(|e| ComputeError::io("Cannot submit job", e))
        })?;

        info!(%handle, "job submitted");
        Ok(handle)
    }

    /// States of `jobs`, in order.
    ///
    /// Every job must carry a handle; this is checked before any session is
    /// opened. The backend is listed once for the whole batch. A failure to
    /// query one job degrades that job to `Unknown` without failing the
    /// others.
    #[instrument(skip(self, jobs), fields(host = %self.host().name, count = jobs.len()))]
    pub fn status(&self, jobs: &[Job]) -> ComputeResult<Vec<JobState>> {
        let handles = jobs
            .iter()
            .map(require_handle)
            .collect::<ComputeResult<Vec<&str>>>()?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        self.connections.with_session(|session| {
            let listing = list(session)?;
            Ok(jobs
                .iter()
                .zip(handles)
                .map(|(job, handle)| self.resolve(session, &listing, &job.id, handle))
                .collect())
        })
    }

    fn resolve(&self, session: &mut dyn Session, listing: &[BackendJob], job_id: &str, handle: &str) -> JobState {
        let Some(entry) = listing.iter().find(|entry| entry.handle == handle) else {
            return self.absent_jobs.state();
        };
        match session.job_status(entry) {
            Ok(state) => state.to_job_state(),
            Err(e) => {
                warn!(%job_id, %handle, error = %e, "cannot query job state");
                JobState::Unknown
            }
        }
    }

    /// Cancel a job.
    ///
    /// Returns the archived job, or `None` if the backend no longer lists
    /// the handle.
    #[instrument(skip(self, job), fields(host = %self.host().name, job_id = %job.id))]
    pub fn kill(&self, job: &Job) -> ComputeResult<Option<ArchivedJob>> {
        let handle = require_handle(job)?;

        self.connections.with_session(|session| {
            let listing = list(session)?;
            let Some(entry) = listing.iter().find(|entry| entry.handle == handle) else {
                info!(%handle, "job no longer listed; nothing to cancel");
                return Ok(None);
            };

            session
                .cancel(entry)
                .map_err(|e| ComputeError::io("Cannot cancel job", e))?;
            info!(%handle, "job cancelled");
            Ok(Some(ArchivedJob::new(job, CANCELLED_REASON)))
        })
    }
}

fn require_handle(job: &Job) -> ComputeResult<&str> {
    job.batch_id().ok_or_else(|| ComputeError::MissingHandle {
        job_id: job.id.clone(),
    })
}

fn list(session: &mut dyn Session) -> ComputeResult<Vec<BackendJob>> {
    session
        .list_jobs()
        .map_err(|e| ComputeError::io("Cannot list jobs", e))
}
