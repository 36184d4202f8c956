//! Host configuration
//!
//! A `HostConfig` binds one compute resource to one `scheme://host`
//! address and carries the properties forwarded to its backend:
//! - `xenon-property-*`: connection properties (prefix stripped)
//! - `scheduler-property-*`: scheduler properties (prefix stripped)
//! - `private-key` / `password`: credential material
//! - `absent-job-state`, `job-id-variable`: resource behavior

pub mod transport;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use cwl_model::{HostAddress, DEFAULT_JOB_ID_VARIABLE, DEFAULT_MAX_RUNTIME_MINUTES};

use crate::backend::AbsentJobPolicy;
use crate::error::ComputeError;

/// Prefix of properties forwarded to the connection layer.
pub const CONNECTION_PROPERTY_PREFIX: &str = "xenon-property-";

/// Prefix of properties forwarded to the scheduler.
pub const SCHEDULER_PROPERTY_PREFIX: &str = "scheduler-property-";

/// Property overriding the backend's policy for unlisted jobs.
pub const ABSENT_JOB_STATE_PROPERTY: &str = "absent-job-state";

/// Property overriding the job-id environment variable name.
pub const JOB_ID_VARIABLE_PROPERTY: &str = "job-id-variable";

/// Default bound on every backend command issued by a session.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration of a single compute host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Name used by callers to select this host
    pub name: String,
    /// Parsed `scheme://hostname`
    pub address: HostAddress,
    /// Default working directory for jobs on this host
    pub working_directory: PathBuf,
    /// Default wall-clock limit for jobs, in minutes
    pub max_time_default: u32,
    /// Properties forwarded to the connection (e.g. `ssh -o`)
    pub connection_properties: BTreeMap<String, String>,
    /// Properties forwarded to the scheduler (e.g. `sbatch --key=value`)
    pub scheduler_properties: BTreeMap<String, String>,
    /// Override for the backend's default absent-job policy
    pub absent_jobs: Option<AbsentJobPolicy>,
    /// Name of the environment variable carrying the job id
    pub job_id_variable: String,
    /// Bound on each backend command
    pub call_timeout: Duration,
    properties: BTreeMap<String, String>,
}

impl HostConfig {
    /// Build a host configuration from an address string and a flat
    /// property map. Fails with `ValidationFailure` on a malformed address
    /// or an unrecognized `absent-job-state`.
    pub fn new(
        name: impl Into<String>,
        address: &str,
        working_directory: impl Into<PathBuf>,
        properties: BTreeMap<String, String>,
    ) -> Result<Self, ComputeError> {
        let address = HostAddress::parse(address)?;

        let absent_jobs = properties
            .get(ABSENT_JOB_STATE_PROPERTY)
            .map(|value| value.parse::<AbsentJobPolicy>())
            .transpose()?;

        let job_id_variable = properties
            .get(JOB_ID_VARIABLE_PROPERTY)
            .cloned()
            .unwrap_or_else(|| DEFAULT_JOB_ID_VARIABLE.to_string());
        if !is_valid_variable_name(&job_id_variable) {
            return Err(ComputeError::ValidationFailure(format!(
                "invalid environment variable name for {JOB_ID_VARIABLE_PROPERTY}: {job_id_variable:?}"
            )));
        }

        Ok(Self {
            name: name.into(),
            address,
            working_directory: working_directory.into(),
            max_time_default: DEFAULT_MAX_RUNTIME_MINUTES,
            connection_properties: strip_prefix(&properties, CONNECTION_PROPERTY_PREFIX),
            scheduler_properties: strip_prefix(&properties, SCHEDULER_PROPERTY_PREFIX),
            absent_jobs,
            job_id_variable,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            properties,
        })
    }

    pub fn with_max_time(mut self, minutes: u32) -> Self {
        self.max_time_default = minutes;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The raw property map, including credential keys.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

fn strip_prefix(properties: &BTreeMap<String, String>, prefix: &str) -> BTreeMap<String, String> {
    properties
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .filter(|stripped| !stripped.is_empty())
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect()
}

fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
