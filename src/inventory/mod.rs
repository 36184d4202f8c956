//! Host Inventory Configuration
//!
//! Parses and validates the host inventory file at
//! `~/.config/cwl-compute/hosts.toml`. Each host entry binds a name to a
//! `scheme://hostname` address, a working directory and the properties
//! forwarded to its backend.
//!
//! ```toml
//! call_timeout_seconds = 60
//! registry = "$HOME/.local/share/cwl-compute/jobs.json"
//! log_level = "info"
//!
//! [[host]]
//! name = "cluster"
//! address = "slurm://login.example.org"
//! path = "/scratch/$USER/cwl"
//! max_time = 720
//!
//! [host.properties]
//! private-key = "~/.ssh/id_ed25519"
//! scheduler-property-partition = "short"
//! ```

pub mod expand;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cwl_model::{HostAddress, DEFAULT_MAX_RUNTIME_MINUTES};
use serde::{Deserialize, Serialize};

use crate::host::HostConfig;

/// Upper bound for `call_timeout_seconds`.
pub const MAX_CALL_TIMEOUT_SECONDS: u64 = 3600;

/// Host inventory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInventory {
    /// Bound on each backend command, in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Path of the JSON job registry
    #[serde(default)]
    pub registry: Option<String>,

    /// Default log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Configured hosts
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostEntry>,
}

fn default_call_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A single host entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    /// Unique identifier for this host
    pub name: String,

    /// `scheme://hostname`
    pub address: String,

    /// Working directory for jobs
    pub path: String,

    /// Default wall-clock limit in minutes
    #[serde(default = "default_max_time")]
    pub max_time: u32,

    /// Credential, connection and scheduler properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_max_time() -> u32 {
    DEFAULT_MAX_RUNTIME_MINUTES
}

/// Errors that can occur when loading or validating the inventory
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Failed to read inventory file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate host name: '{0}'")]
    DuplicateName(String),

    #[error("Host '{name}': missing required field '{field}'")]
    MissingField { name: String, field: String },

    #[error("Host '{name}': invalid value for '{field}': {reason}")]
    InvalidValue {
        name: String,
        field: String,
        reason: String,
    },

    #[error("call_timeout_seconds must be in 1..={MAX_CALL_TIMEOUT_SECONDS}, got {0}")]
    InvalidTimeout(u64),

    #[error("Inventory file not found: {0}")]
    NotFound(PathBuf),

    #[error("Unknown host: '{0}'")]
    UnknownHost(String),

    #[error("HOME environment variable not set")]
    NoHome,
}

fn home() -> Result<PathBuf, InventoryError> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| InventoryError::NoHome)
}

impl HostInventory {
    /// Load the inventory from the default location
    pub fn load_default() -> Result<Self, InventoryError> {
        Self::load(&Self::default_path()?)
    }

    /// Get the default inventory file path
    pub fn default_path() -> Result<PathBuf, InventoryError> {
        Ok(home()?.join(".config/cwl-compute/hosts.toml"))
    }

    /// Load the inventory from a specific path
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        if !path.exists() {
            return Err(InventoryError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse the inventory, expanding variables from the process environment
    pub fn parse(content: &str) -> Result<Self, InventoryError> {
        Self::parse_with(content, |name| std::env::var(name).ok())
    }

    /// Parse the inventory, expanding variables with `lookup`
    pub fn parse_with<F>(content: &str, lookup: F) -> Result<Self, InventoryError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut inventory: HostInventory = toml::from_str(content)?;
        inventory.expand(&lookup);
        inventory.validate()?;
        Ok(inventory)
    }

    fn expand<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(registry) = &mut self.registry {
            *registry = expand::expand_with(registry, lookup);
        }
        for host in &mut self.hosts {
            host.path = expand::expand_with(&host.path, lookup);
            for value in host.properties.values_mut() {
                *value = expand::expand_with(value, lookup);
            }
        }
    }

    fn validate(&self) -> Result<(), InventoryError> {
        if self.call_timeout_seconds == 0 || self.call_timeout_seconds > MAX_CALL_TIMEOUT_SECONDS {
            return Err(InventoryError::InvalidTimeout(self.call_timeout_seconds));
        }

        let mut seen_names = HashSet::new();
        for host in &self.hosts {
            if !seen_names.insert(&host.name) {
                return Err(InventoryError::DuplicateName(host.name.clone()));
            }
        }

        for host in &self.hosts {
            host.validate()?;
        }

        Ok(())
    }

    /// Get a host entry by name
    pub fn get(&self, name: &str) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    /// The registry path, defaulting to `~/.local/share/cwl-compute/jobs.json`
    pub fn registry_path(&self) -> Result<PathBuf, InventoryError> {
        match &self.registry {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(home()?.join(".local/share/cwl-compute/jobs.json")),
        }
    }

    /// Host configuration for a named host
    pub fn host_config(&self, name: &str) -> Result<HostConfig, InventoryError> {
        let entry = self
            .get(name)
            .ok_or_else(|| InventoryError::UnknownHost(name.to_string()))?;
        entry.to_host_config(self.call_timeout())
    }

    /// Host configurations for every entry, in file order
    pub fn host_configs(&self) -> Result<Vec<HostConfig>, InventoryError> {
        self.hosts
            .iter()
            .map(|entry| entry.to_host_config(self.call_timeout()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }
}

impl HostEntry {
    fn validate(&self) -> Result<(), InventoryError> {
        if self.name.is_empty() {
            return Err(InventoryError::MissingField {
                name: "(unnamed)".to_string(),
                field: "name".to_string(),
            });
        }

        if !self.name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
            return Err(InventoryError::InvalidValue {
                name: self.name.clone(),
                field: "name".to_string(),
                reason: "name must contain only alphanumeric characters, dashes, and underscores".to_string(),
            });
        }

        if self.address.is_empty() {
            return Err(self.missing("address"));
        }
        HostAddress::parse(&self.address).map_err(|e| self.invalid("address", e))?;

        if self.path.is_empty() {
            return Err(self.missing("path"));
        }

        if self.max_time == 0 {
            return Err(self.invalid("max_time", "max_time must be positive"));
        }

        // property values such as absent-job-state are checked here too
        self.to_host_config(Duration::from_secs(default_call_timeout()))?;
        Ok(())
    }

    fn missing(&self, field: &str) -> InventoryError {
        InventoryError::MissingField {
            name: self.name.clone(),
            field: field.to_string(),
        }
    }

    fn invalid(&self, field: &str, reason: impl ToString) -> InventoryError {
        InventoryError::InvalidValue {
            name: self.name.clone(),
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build the host configuration for this entry.
    pub fn to_host_config(&self, call_timeout: Duration) -> Result<HostConfig, InventoryError> {
        let config = HostConfig::new(
            self.name.clone(),
            &self.address,
            &self.path,
            self.properties.clone(),
        )
        .map_err(|e| self.invalid("properties", e))?;
        Ok(config
            .with_max_time(self.max_time)
            .with_call_timeout(call_timeout))
    }
}

impl Default for HostInventory {
    fn default() -> Self {
        Self {
            call_timeout_seconds: default_call_timeout(),
            registry: None,
            log_level: default_log_level(),
            hosts: Vec::new(),
        }
    }
}
