//! Scoped backend sessions
//!
//! Every compute resource call opens its own session through
//! [`ConnectionFactory::with_session`] and releases it before returning,
//! whether the body succeeded, failed, or panicked.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{Backend, Session};
use crate::credential::Credential;
use crate::error::{ComputeError, ComputeResult};
use crate::host::HostConfig;

/// Opens sessions to one host's backend
#[derive(Clone)]
pub struct ConnectionFactory {
    backend: Arc<dyn Backend>,
    host: Arc<HostConfig>,
    credential: Option<Credential>,
}

impl ConnectionFactory {
    pub fn new(backend: Arc<dyn Backend>, host: Arc<HostConfig>, credential: Option<Credential>) -> Self {
        Self {
            backend,
            host,
            credential,
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    /// Run `body` against a freshly opened session, closing it afterwards.
    ///
    /// Failure to open maps to `ConnectionFailure`. A failure to close is
    /// logged and never replaces the body's result.
    pub fn with_session<T, F>(&self, body: F) -> ComputeResult<T>
    where
        F: FnOnce(&mut dyn Session) -> ComputeResult<T>,
    {
        let session = self
            .backend
            .open(&self.host, self.credential.as_ref())
            .map_err(ComputeError::connection)?;
        debug!(host = %self.host.name, backend = self.backend.kind(), "session opened");

        let mut guard = SessionGuard {
            session,
            released: false,
            host: &self.host.name,
        };
        let result = body(&mut *guard.session);
        guard.release();
        result
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("backend", &self.backend.kind())
            .field("host", &self.host.name)
            .field("credential", &self.credential.as_ref().map(Credential::kind))
            .finish()
    }
}

/// Closes the session on drop if it was not released explicitly.
struct SessionGuard<'a> {
    session: Box<dyn Session>,
    released: bool,
    host: &'a str,
}

impl SessionGuard<'_> {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.session.close() {
            Ok(()) => debug!(host = %self.host, "session closed"),
            Err(e) => warn!(host = %self.host, error = %e, "failed to close session"),
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
