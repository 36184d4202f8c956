//! Mock Backend State Management
//!
//! Tracks submitted jobs and per-operation call counters for the mock
//! backend.

use std::collections::{BTreeMap, BTreeSet};

use crate::backend::{BackendJob, BackendState};
use crate::command::ExecutionPlan;

/// A job accepted by the mock backend
#[derive(Debug, Clone)]
pub struct MockJob {
    pub handle: String,
    pub plan: ExecutionPlan,
    pub state: BackendState,
}

/// Number of times each backend operation was invoked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub opened: u32,
    pub closed: u32,
    pub list: u32,
    pub status: u32,
    pub submit: u32,
    pub cancel: u32,
}

/// Mock backend state container
#[derive(Debug)]
pub struct MockState {
    /// Listed jobs by handle
    pub jobs: BTreeMap<String, MockJob>,
    /// Every plan accepted, in submission order
    pub submitted: Vec<ExecutionPlan>,
    /// Handles whose status query fails
    pub failing_status: BTreeSet<String>,
    /// State given to newly submitted jobs
    pub initial_state: BackendState,
    pub counts: CallCounts,
    /// Counter for generating unique handles
    handle_counter: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            jobs: BTreeMap::new(),
            submitted: Vec::new(),
            failing_status: BTreeSet::new(),
            initial_state: BackendState::Running,
            counts: CallCounts::default(),
            handle_counter: 0,
        }
    }
}

impl MockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a unique handle
    pub fn next_handle(&mut self) -> String {
        self.handle_counter += 1;
        format!("mock-{:04}", self.handle_counter)
    }

    /// Accept a plan and list it under a fresh handle.
    pub fn accept(&mut self, plan: &ExecutionPlan) -> String {
        let handle = self.next_handle();
        self.submitted.push(plan.clone());
        self.jobs.insert(
            handle.clone(),
            MockJob {
                handle: handle.clone(),
                plan: plan.clone(),
                state: self.initial_state.clone(),
            },
        );
        handle
    }

    /// Current listing snapshot
    pub fn listing(&self) -> Vec<BackendJob> {
        self.jobs
            .values()
            .map(|job| BackendJob::new(job.handle.clone(), job.state.clone()))
            .collect()
    }

    /// Set a listed job's state. Returns false if the handle is not listed.
    pub fn set_state(&mut self, handle: &str, state: BackendState) -> bool {
        match self.jobs.get_mut(handle) {
            Some(job) => {
                job.state = state;
                true
            }
            None => false,
        }
    }

    /// Drop a job from the listing, as a scheduler forgets finished jobs.
    pub fn purge(&mut self, handle: &str) -> bool {
        self.jobs.remove(handle).is_some()
    }
}
