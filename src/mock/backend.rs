//! Mock Backend Implementation
//!
//! In-memory backend whose state is shared between every session it opens
//! and every clone of the handle, so tests can drive job progression and
//! inspect call counters while a compute resource uses it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use super::failure::{FailureConfig, FailureInjector, MockOp};
use super::state::{CallCounts, MockState};
use crate::backend::{AbsentJobPolicy, Backend, BackendError, BackendJob, BackendState, Session, SubmissionMode};
use crate::command::ExecutionPlan;
use crate::credential::Credential;
use crate::host::HostConfig;

/// Configurable mock backend for testing
#[derive(Clone)]
pub struct MockBackend {
    mode: SubmissionMode,
    absent_jobs: AbsentJobPolicy,
    state: Arc<Mutex<MockState>>,
    failures: Arc<Mutex<FailureInjector>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Interactive backend that treats unlisted jobs as done.
    pub fn new() -> Self {
        Self {
            mode: SubmissionMode::Interactive,
            absent_jobs: AbsentJobPolicy::Done,
            state: Arc::new(Mutex::new(MockState::new())),
            failures: Arc::new(Mutex::new(FailureInjector::new())),
        }
    }

    pub fn with_mode(mut self, mode: SubmissionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_absent_policy(mut self, policy: AbsentJobPolicy) -> Self {
        self.absent_jobs = policy;
        self
    }

    /// State given to jobs submitted from now on.
    pub fn with_initial_state(self, state: BackendState) -> Self {
        self.lock_state().initial_state = state;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inject a failure for an operation
    pub fn inject(&self, op: MockOp, config: FailureConfig) {
        lock_failures(&self.failures).inject(op, config);
    }

    pub fn clear_failures(&self) {
        lock_failures(&self.failures).clear();
    }

    /// Make status queries for one handle fail.
    pub fn fail_status_of(&self, handle: &str) {
        self.lock_state().failing_status.insert(handle.to_string());
    }

    /// Mark a job finished but keep it listed.
    pub fn complete(&self, handle: &str) -> bool {
        self.lock_state().set_state(handle, BackendState::Done)
    }

    pub fn set_state(&self, handle: &str, state: BackendState) -> bool {
        self.lock_state().set_state(handle, state)
    }

    /// Remove a job from the listing.
    pub fn purge(&self, handle: &str) -> bool {
        self.lock_state().purge(handle)
    }

    /// Listed state of a job, if listed.
    pub fn state_of(&self, handle: &str) -> Option<BackendState> {
        self.lock_state().jobs.get(handle).map(|job| job.state.clone())
    }

    /// Every plan accepted so far
    pub fn submitted(&self) -> Vec<ExecutionPlan> {
        self.lock_state().submitted.clone()
    }

    pub fn counts(&self) -> CallCounts {
        self.lock_state().counts
    }

    pub fn opened(&self) -> u32 {
        self.counts().opened
    }

    pub fn closed(&self) -> u32 {
        self.counts().closed
    }

    pub fn list_calls(&self) -> u32 {
        self.counts().list
    }
}

fn lock_failures(failures: &Mutex<FailureInjector>) -> MutexGuard<'_, FailureInjector> {
    failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Apply an injected failure: sleep for its delay, then return its error.
fn injected(failures: &Mutex<FailureInjector>, op: MockOp) -> Result<(), BackendError> {
    let Some(config) = lock_failures(failures).check(op) else {
        return Ok(());
    };
    if let Some(delay) = config.delay {
        thread::sleep(delay);
    }
    match config.to_error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

impl Backend for MockBackend {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn submission_mode(&self) -> SubmissionMode {
        self.mode
    }

    fn absent_job_policy(&self) -> AbsentJobPolicy {
        self.absent_jobs
    }

    fn open(&self, _host: &HostConfig, _credential: Option<&Credential>) -> Result<Box<dyn Session>, BackendError> {
        injected(&self.failures, MockOp::Open)?;
        self.lock_state().counts.opened += 1;
        Ok(Box::new(MockSession {
            backend: self.clone(),
        }))
    }
}

struct MockSession {
    backend: MockBackend,
}

impl MockSession {
    fn check(&self, op: MockOp) -> Result<(), BackendError> {
        injected(&self.backend.failures, op)
    }
}

impl Session for MockSession {
    fn list_jobs(&mut self) -> Result<Vec<BackendJob>, BackendError> {
        self.backend.lock_state().counts.list += 1;
        self.check(MockOp::List)?;
        Ok(self.backend.lock_state().listing())
    }

    fn job_status(&mut self, job: &BackendJob) -> Result<BackendState, BackendError> {
        self.backend.lock_state().counts.status += 1;
        self.check(MockOp::Status)?;

        let state = self.backend.lock_state();
        if state.failing_status.contains(&job.handle) {
            return Err(BackendError::new(
                "MockStatusError",
                format!("cannot query {}", job.handle),
            ));
        }
        Ok(job.state.clone())
    }

    fn submit(&mut self, plan: &ExecutionPlan) -> Result<String, BackendError> {
        self.backend.lock_state().counts.submit += 1;
        self.check(MockOp::Submit)?;
        Ok(self.backend.lock_state().accept(plan))
    }

    fn cancel(&mut self, job: &BackendJob) -> Result<(), BackendError> {
        self.backend.lock_state().counts.cancel += 1;
        self.check(MockOp::Cancel)?;
        self.backend.lock_state().set_state(&job.handle, BackendState::Done);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.backend.lock_state().counts.closed += 1;
        self.check(MockOp::Close)
    }
}
