//! CWL Compute - job submission to local and remote compute hosts
//!
//! This crate submits commands for asynchronous execution on a host it
//! does not control (a local shell, a remote shell over SSH, or a Slurm
//! cluster), maps the host's native job handles to logical job ids,
//! queries their states in batches, and cancels them.

pub mod backend;
pub mod command;
pub mod connection;
pub mod credential;
pub mod error;
pub mod host;
pub mod inventory;
pub mod logging;
pub mod mock;
pub mod registry;
pub mod resource;
pub mod service;

pub use backend::{AbsentJobPolicy, Backend, BackendError, Session, SubmissionMode};
pub use command::{CommandBuilder, ExecutionPlan};
pub use credential::Credential;
pub use cwl_model::{ArchivedJob, ErrorCode, HostAddress, Job, JobState};
pub use error::{ComputeError, ComputeResult};
pub use host::HostConfig;
pub use inventory::{HostInventory, InventoryError};
pub use registry::{FileRegistry, JobRecord, JobRegistry, MemoryRegistry, RegistryError};
pub use resource::ComputeResource;
pub use service::{JobService, LogStream, ServiceError, SubmitOptions};
