//! CWL Compute Model Types
//!
//! Defines the job record, host address and stable error codes shared
//! between the compute resource, the job registry and the CLI.

pub mod error;
pub mod host;
pub mod job;

pub use error::ErrorCode;
pub use host::{AddressError, HostAddress};
pub use job::{ArchivedJob, Job, JobError, JobState};

/// Default wall-clock limit for a job, in minutes.
pub const DEFAULT_MAX_RUNTIME_MINUTES: u32 = 1440;

/// Environment variable that carries the logical job id into the job.
pub const DEFAULT_JOB_ID_VARIABLE: &str = "SIMCITY_JOBID";

/// Separator between scheme and hostname in a host address.
pub const SCHEME_SEPARATOR: &str = "://";
