//! Job service
//!
//! Composes one [`ComputeResource`] per configured host with a
//! [`JobRegistry`]. Resources are built up front; the service only routes
//! calls and writes handles and states back to the registry.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use cwl_model::{ArchivedJob, ErrorCode, Job, JobError};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::ComputeError;
use crate::host::HostConfig;
use crate::registry::{ArchivedRecord, JobRecord, JobRegistry, RegistryError};
use crate::resource::ComputeResource;

/// Reason recorded when a job being cancelled had already left the backend.
pub const FINISHED_REASON: &str = "finished";

/// Reason recorded for a job replaced by a submission under the same id.
pub const SUPERSEDED_REASON: &str = "superseded";

/// Reason recorded when a job is cancelled before it received a handle.
pub const UNSUBMITTED_REASON: &str = "unsubmitted";

/// Errors from service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),
}

impl From<JobError> for ServiceError {
    fn from(err: JobError) -> Self {
        ServiceError::Compute(err.into())
    }
}

impl ServiceError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Compute(e) => e.code().as_str(),
            ServiceError::Registry(_) => "REGISTRY_FAILURE",
            ServiceError::UnknownHost(_) => ErrorCode::ValidationFailure.as_str(),
            ServiceError::UnknownJob(_) => "UNKNOWN_JOB",
        }
    }

    /// Process exit code used by the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceError::Compute(e) => e.exit_code(),
            ServiceError::UnknownHost(_) => 10,
            ServiceError::UnknownJob(_) => 30,
            ServiceError::Registry(_) => 60,
        }
    }
}

/// Which output file of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Optional overrides for a submission
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Logical id; a UUID is generated when absent
    pub id: Option<String>,
    /// Defaults to the host's working directory
    pub working_directory: Option<PathBuf>,
    /// Defaults to the host's `max_time`
    pub max_runtime_minutes: Option<u32>,
}

/// Submission, status and cancellation across configured hosts
pub struct JobService {
    resources: BTreeMap<String, ComputeResource>,
    registry: Arc<dyn JobRegistry>,
}

impl JobService {
    pub fn new(resources: Vec<ComputeResource>, registry: Arc<dyn JobRegistry>) -> Self {
        let resources = resources
            .into_iter()
            .map(|resource| (resource.host().name.clone(), resource))
            .collect();
        Self {
            resources,
            registry,
        }
    }

    /// Build a resource for every host configuration.
    pub fn from_hosts(hosts: Vec<HostConfig>, registry: Arc<dyn JobRegistry>) -> Result<Self, ServiceError> {
        let resources = hosts
            .into_iter()
            .map(ComputeResource::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(resources, registry))
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostConfig> {
        self.resources.values().map(ComputeResource::host)
    }

    pub fn registry(&self) -> &dyn JobRegistry {
        self.registry.as_ref()
    }

    fn resource(&self, host: &str) -> Result<&ComputeResource, ServiceError> {
        self.resources
            .get(host)
            .ok_or_else(|| ServiceError::UnknownHost(host.to_string()))
    }

    fn record(&self, id: &str) -> Result<JobRecord, ServiceError> {
        self.registry
            .get(id)?
            .ok_or_else(|| ServiceError::UnknownJob(id.to_string()))
    }

    /// Submit `argv` to `host` and record the job with its handle.
    ///
    /// The record is written before the backend sees the job and receives
    /// the handle afterwards, so a submitted job is never untracked. An
    /// active job with the same id is cancelled and archived as superseded
    /// first; both would otherwise write the same output files.
    #[instrument(skip(self, argv, options), fields(host = %host))]
    pub fn submit(&self, host: &str, argv: Vec<String>, options: SubmitOptions) -> Result<JobRecord, ServiceError> {
        let resource = self.resource(host)?;
        let config = resource.host();

        let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let working_directory = options
            .working_directory
            .unwrap_or_else(|| config.working_directory.clone());
        let job = Job::new(id, argv, working_directory)
            .with_max_runtime(options.max_runtime_minutes.unwrap_or(config.max_time_default));
        job.validate()?;

        if let Some(previous) = self.registry.get(&job.id)? {
            self.supersede(previous)?;
        }
        self.registry.insert(JobRecord::new(host, job.clone()))?;

        let handle = match resource.submit(&job) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(cleanup) = self.registry.remove(&job.id) {
                    warn!(job_id = %job.id, error = %cleanup, "cannot drop record of failed submission");
                }
                return Err(e.into());
            }
        };

        match self.registry.set_handle(&job.id, &handle) {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(job_id = %job.id, %handle, error = %e, "cannot record handle, cancelling the job");
                let mut untracked = job;
                untracked.assign_handle(handle.as_str())?;
                if let Err(kill) = resource.kill(&untracked) {
                    warn!(job_id = %untracked.id, %handle, error = %kill, "job left running without a record");
                }
                Err(e.into())
            }
        }
    }

    /// Cancel the job recorded under an id about to be reused and archive it.
    fn supersede(&self, previous: JobRecord) -> Result<(), ServiceError> {
        if previous.job.batch_id().is_some() {
            self.resource(&previous.host)?.kill(&previous.job)?;
        }
        info!(
            job_id = %previous.job.id,
            previous = previous.job.batch_id().unwrap_or("-"),
            "superseding active job with the same id"
        );
        self.registry.archive(ArchivedRecord {
            host: previous.host,
            archived: ArchivedJob::new(&previous.job, SUPERSEDED_REASON),
        })?;
        Ok(())
    }

    /// Query the backends for `ids` (all active jobs when empty) and store
    /// the states. Jobs are batched per host; records come back in request
    /// order. Jobs still waiting for their handle keep their stored state.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn refresh(&self, ids: &[String]) -> Result<Vec<JobRecord>, ServiceError> {
        let mut records = if ids.is_empty() {
            self.registry.list()?
        } else {
            ids.iter()
                .map(|id| self.record(id))
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut by_host: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            if record.job.batch_id().is_some() {
                by_host.entry(record.host.as_str()).or_default().push(index);
            }
        }

        let mut updates = Vec::with_capacity(records.len());
        for (host, indices) in by_host {
            let resource = self.resource(host)?;
            let jobs: Vec<Job> = indices.iter().map(|&i| records[i].job.clone()).collect();
            let states = resource.status(&jobs)?;
            updates.extend(indices.into_iter().zip(states));
        }

        for (index, state) in updates {
            let record = &mut records[index];
            match self.registry.set_state(&record.job.id, state) {
                // archived by another process meanwhile
                Ok(()) | Err(RegistryError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            record.job.state = state;
        }
        Ok(records)
    }

    /// Cancel a job and move it to the archive.
    ///
    /// A job the backend no longer lists is archived as finished.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: &str) -> Result<ArchivedRecord, ServiceError> {
        let record = self.record(id)?;

        let archived = if record.job.batch_id().is_none() {
            ArchivedJob::new(&record.job, UNSUBMITTED_REASON)
        } else {
            match self.resource(&record.host)?.kill(&record.job)? {
                Some(archived) => archived,
                None => ArchivedJob::new(&record.job, FINISHED_REASON),
            }
        };

        let archived = ArchivedRecord {
            host: record.host,
            archived,
        };
        self.registry.archive(archived.clone())?;
        info!(job_id = %id, reason = %archived.archived.reason, "job archived");
        Ok(archived)
    }

    /// Location of a job's stdout or stderr file, for active or archived jobs.
    pub fn log_path(&self, id: &str, stream: LogStream) -> Result<PathBuf, ServiceError> {
        let job = match self.registry.get(id)? {
            Some(record) => record.job,
            None => self
                .registry
                .archived()?
                .into_iter()
                .rev()
                .find(|record| record.archived.job.id == id)
                .map(|record| record.archived.job)
                .ok_or_else(|| ServiceError::UnknownJob(id.to_string()))?,
        };

        let file = match stream {
            LogStream::Stdout => job.stdout_file(),
            LogStream::Stderr => job.stderr_file(),
        };
        Ok(job.working_directory.join(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendState;
    use crate::mock::{FailureConfig, MockBackend, MockOp};
    use crate::registry::MemoryRegistry;
    use cwl_model::JobState;

    fn service(backend: &MockBackend) -> JobService {
        let host = HostConfig::new("mock", "mock://node", "/w", BTreeMap::new())
            .unwrap()
            .with_max_time(45);
        let resource = ComputeResource::with_backend(host, Arc::new(backend.clone()));
        JobService::new(vec![resource], Arc::new(MemoryRegistry::new()))
    }

    fn argv() -> Vec<String> {
        vec!["sleep".into(), "600".into()]
    }

    #[test]
    fn test_submit_applies_host_defaults() {
        let backend = MockBackend::new();
        let service = service(&backend);

        let record = service.submit("mock", argv(), SubmitOptions::default()).unwrap();
        assert!(Uuid::parse_str(&record.job.id).is_ok());
        assert_eq!(record.job.working_directory, PathBuf::from("/w"));
        assert_eq!(record.job.max_runtime_minutes, 45);
        assert!(record.job.batch_id().is_some());

        let stored = service.registry().get(&record.job.id).unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn test_unknown_host() {
        let service = service(&MockBackend::new());
        let err = service.submit("nope", argv(), SubmitOptions::default()).unwrap_err();
        assert!(matches!(err, ServiceError::UnknownHost(_)));
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    fn test_refresh_writes_states_back() {
        let backend = MockBackend::new();
        let service = service(&backend);
        let a = service.submit("mock", argv(), SubmitOptions::default()).unwrap();
        let b = service.submit("mock", argv(), SubmitOptions::default()).unwrap();
        backend.purge(b.job.batch_id().unwrap());

        let refreshed = service
            .refresh(&[b.job.id.clone(), a.job.id.clone()])
            .unwrap();
        assert_eq!(refreshed[0].job.state, JobState::Done);
        assert_eq!(refreshed[1].job.state, JobState::Running);
        assert_eq!(backend.list_calls(), 1);

        let stored = service.registry().get(&b.job.id).unwrap().unwrap();
        assert_eq!(stored.job.state, JobState::Done);
    }

    #[test]
    fn test_cancel_gone_job_archives_as_finished() {
        let backend = MockBackend::new();
        let service = service(&backend);
        let record = service.submit("mock", argv(), SubmitOptions::default()).unwrap();
        backend.purge(record.job.batch_id().unwrap());

        let archived = service.cancel(&record.job.id).unwrap();
        assert_eq!(archived.archived.reason, FINISHED_REASON);
        assert!(service.registry().get(&record.job.id).unwrap().is_none());
        assert_eq!(backend.counts().cancel, 0);
    }

    fn with_id(id: &str) -> SubmitOptions {
        SubmitOptions {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resubmission_cancels_and_archives_previous_job() {
        let backend = MockBackend::new();
        let service = service(&backend);
        let first = service.submit("mock", argv(), with_id("dup")).unwrap();
        let second = service.submit("mock", argv(), with_id("dup")).unwrap();

        let first_handle = first.job.batch_id().unwrap();
        assert_ne!(Some(first_handle), second.job.batch_id());
        assert_eq!(backend.state_of(first_handle), Some(BackendState::Done));
        assert_eq!(backend.counts().cancel, 1);

        let archived = service.registry().archived().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].archived.reason, SUPERSEDED_REASON);
        assert_eq!(archived[0].archived.job.batch_id(), Some(first_handle));

        service.cancel("dup").unwrap();
        let handles: Vec<Option<String>> = service
            .registry()
            .archived()
            .unwrap()
            .into_iter()
            .map(|r| r.archived.job.batch_id().map(str::to_string))
            .collect();
        assert_eq!(
            handles,
            vec![
                Some(first_handle.to_string()),
                second.job.batch_id().map(str::to_string)
            ]
        );
        assert!(service.registry().list().unwrap().is_empty());
    }

    #[test]
    fn test_resubmission_keeps_previous_job_when_it_cannot_be_cancelled() {
        let backend = MockBackend::new();
        let service = service(&backend);
        let first = service.submit("mock", argv(), with_id("dup")).unwrap();
        backend.inject(MockOp::Cancel, FailureConfig::error("CancelError", "denied"));

        assert!(service.submit("mock", argv(), with_id("dup")).is_err());
        assert_eq!(backend.submitted().len(), 1);
        let stored = service.registry().get("dup").unwrap().unwrap();
        assert_eq!(stored.job.batch_id(), first.job.batch_id());
        assert!(service.registry().archived().unwrap().is_empty());
    }

    #[test]
    fn test_failed_submission_leaves_no_record() {
        let backend = MockBackend::new();
        let service = service(&backend);
        backend.inject(MockOp::Submit, FailureConfig::error("SubmitError", "queue closed"));

        let err = service.submit("mock", argv(), with_id("rejected")).unwrap_err();
        assert_eq!(err.exit_code(), 40);
        assert!(service.registry().get("rejected").unwrap().is_none());
    }

    #[test]
    fn test_refresh_skips_jobs_without_handle() {
        let backend = MockBackend::new();
        let service = service(&backend);
        service
            .registry()
            .insert(JobRecord::new("mock", Job::new("inflight", argv(), "/w")))
            .unwrap();

        let records = service.refresh(&[]).unwrap();
        assert_eq!(records[0].job.state, JobState::Pending);
        assert_eq!(backend.opened(), 0);

        let archived = service.cancel("inflight").unwrap();
        assert_eq!(archived.archived.reason, UNSUBMITTED_REASON);
    }

    #[test]
    fn test_log_path_survives_archive() {
        let backend = MockBackend::new();
        let service = service(&backend);
        let options = SubmitOptions {
            id: Some("logjob".into()),
            working_directory: Some("/data/run".into()),
            ..Default::default()
        };
        service.submit("mock", argv(), options).unwrap();

        assert_eq!(
            service.log_path("logjob", LogStream::Stderr).unwrap(),
            PathBuf::from("/data/run/stderr_logjob.txt")
        );
        service.cancel("logjob").unwrap();
        assert_eq!(
            service.log_path("logjob", LogStream::Stdout).unwrap(),
            PathBuf::from("/data/run/stdout_logjob.txt")
        );
        assert!(matches!(
            service.log_path("other", LogStream::Stdout),
            Err(ServiceError::UnknownJob(_))
        ));
    }
}
