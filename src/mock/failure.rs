//! Failure Injection for the Mock Backend
//!
//! Supports configurable failure injection for testing error paths.

use std::collections::HashMap;
use std::time::Duration;

use crate::backend::BackendError;

/// Backend operation a failure can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open,
    List,
    Status,
    Submit,
    Cancel,
    Close,
}

/// Failure configuration for an operation
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Native error class reported by the backend
    pub class: Option<String>,
    /// Error message to return
    pub message: Option<String>,
    /// Native error code
    pub code: Option<i32>,
    /// Delay to add before responding
    pub delay: Option<Duration>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    /// Create a config that returns an error
    pub fn error(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: Some(class.into()),
            message: Some(message.into()),
            code: None,
            delay: None,
            fail_count: None,
        }
    }

    /// Create a config that just adds delay
    pub fn delay(duration: Duration) -> Self {
        Self {
            class: None,
            message: None,
            code: None,
            delay: Some(duration),
            fail_count: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }

    /// The backend error this config produces, if it produces one.
    pub fn to_error(&self) -> Option<BackendError> {
        let class = self.class.as_ref()?;
        let error = BackendError::new(class.clone(), self.message.clone().unwrap_or_default());
        Some(match self.code {
            Some(code) => error.with_code(code),
            None => error,
        })
    }
}

/// Failure injector for the mock backend
#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<MockOp, FailureConfig>,
    /// Call counts per operation (for fail_count tracking)
    call_counts: HashMap<MockOp, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a failure for an operation
    pub fn inject(&mut self, op: MockOp, config: FailureConfig) {
        self.configs.insert(op, config);
        self.call_counts.insert(op, 0);
    }

    pub fn inject_error(&mut self, op: MockOp, class: impl Into<String>, message: impl Into<String>) {
        self.inject(op, FailureConfig::error(class, message));
    }

    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    pub fn clear_op(&mut self, op: MockOp) {
        self.configs.remove(&op);
        self.call_counts.remove(&op);
    }

    /// Check if a failure should occur for an operation.
    /// Returns the failure config if one should occur, None otherwise.
    pub fn check(&mut self, op: MockOp) -> Option<FailureConfig> {
        let config = self.configs.get(&op)?;
        let count = self.call_counts.entry(op).or_insert(0);
        *count += 1;

        if let Some(fail_limit) = config.fail_count {
            if *count > fail_limit {
                return None;
            }
        }

        Some(config.clone())
    }
}
