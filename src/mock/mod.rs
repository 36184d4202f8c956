//! Mock Backend Implementation
//!
//! An in-process execution backend for testing compute resources without
//! a real host. Supports every session operation with failure injection
//! for testing error paths.
//!
//! # Operations
//!
//! - `open` / `close`: counted, so tests can check sessions are released
//! - `list_jobs`: snapshot of accepted jobs that have not been purged
//! - `job_status`: listed state, or an error for handles marked failing
//! - `submit`: accept a plan under a sequential `mock-NNNN` handle
//! - `cancel`: mark the job done

mod backend;
mod failure;
mod state;

pub use backend::MockBackend;
pub use failure::{FailureConfig, FailureInjector, MockOp};
pub use state::{CallCounts, MockJob, MockState};
