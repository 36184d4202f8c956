//! Job registry
//!
//! Maps logical job ids to their records: the host a job was submitted to,
//! its backend handle and its last known state. Cancelled jobs move to an
//! archive kept next to the active set.
//!
//! [`FileRegistry`] is shared by every `cwl-compute` process on the machine.
//! Writers serialize on an advisory lock on a sibling `.lock` file and
//! replace the document atomically, so readers never need the lock.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use cwl_model::{ArchivedJob, Job, JobError, JobState};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// How long a writer waits for the registry lock by default.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Contention longer than this is logged.
const LOCK_CONTENTION_WARNING: Duration = Duration::from_millis(500);

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no job with id {0}")]
    NotFound(String),

    #[error("job {0} is already active")]
    Duplicate(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("registry I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registry at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("registry lock {path} still held by another process after {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },
}

/// An active job and the host it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub host: String,
    #[serde(flatten)]
    pub job: Job,
}

impl JobRecord {
    pub fn new(host: impl Into<String>, job: Job) -> Self {
        Self {
            host: host.into(),
            job,
        }
    }
}

/// A job that left the active set and the host it ran on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedRecord {
    pub host: String,
    #[serde(flatten)]
    pub archived: ArchivedJob,
}

/// Storage for job records
pub trait JobRegistry: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<JobRecord>, RegistryError>;

    /// Add an active record. Fails with `Duplicate` if the id is active.
    fn insert(&self, record: JobRecord) -> Result<(), RegistryError>;

    /// Record the backend handle of an active job and return the updated
    /// record. Fails if it already has one.
    fn set_handle(&self, id: &str, handle: &str) -> Result<JobRecord, RegistryError>;

    fn set_state(&self, id: &str, state: JobState) -> Result<(), RegistryError>;

    fn remove(&self, id: &str) -> Result<Option<JobRecord>, RegistryError>;

    /// Active records ordered by id
    fn list(&self) -> Result<Vec<JobRecord>, RegistryError>;

    /// Append to the archive and drop the active record with the same id in
    /// one write. Returns the dropped record.
    fn archive(&self, record: ArchivedRecord) -> Result<Option<JobRecord>, RegistryError>;

    /// Archived records, oldest first
    fn archived(&self) -> Result<Vec<ArchivedRecord>, RegistryError>;
}

/// Registry contents as persisted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    jobs: BTreeMap<String, JobRecord>,
    #[serde(default)]
    archive: Vec<ArchivedRecord>,
}

impl RegistryDocument {
    fn record_mut(&mut self, id: &str) -> Result<&mut JobRecord, RegistryError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    fn insert(&mut self, record: JobRecord) -> Result<(), RegistryError> {
        match self.jobs.entry(record.job.id.clone()) {
            Entry::Occupied(entry) => Err(RegistryError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(())
            }
        }
    }

    fn set_handle(&mut self, id: &str, handle: &str) -> Result<JobRecord, RegistryError> {
        let record = self.record_mut(id)?;
        record.job.assign_handle(handle)?;
        Ok(record.clone())
    }

    fn set_state(&mut self, id: &str, state: JobState) -> Result<(), RegistryError> {
        self.record_mut(id)?.job.state = state;
        Ok(())
    }

    fn archive(&mut self, record: ArchivedRecord) -> Option<JobRecord> {
        let removed = self.jobs.remove(&record.archived.job.id);
        self.archive.push(record);
        removed
    }
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    document: Mutex<RegistryDocument>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryDocument> {
        self.document.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobRegistry for MemoryRegistry {
    fn get(&self, id: &str) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    fn insert(&self, record: JobRecord) -> Result<(), RegistryError> {
        self.lock().insert(record)
    }

    fn set_handle(&self, id: &str, handle: &str) -> Result<JobRecord, RegistryError> {
        self.lock().set_handle(id, handle)
    }

    fn set_state(&self, id: &str, state: JobState) -> Result<(), RegistryError> {
        self.lock().set_state(id, state)
    }

    fn remove(&self, id: &str) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self.lock().jobs.remove(id))
    }

    fn list(&self) -> Result<Vec<JobRecord>, RegistryError> {
        Ok(self.lock().jobs.values().cloned().collect())
    }

    fn archive(&self, record: ArchivedRecord) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self.lock().archive(record))
    }

    fn archived(&self) -> Result<Vec<ArchivedRecord>, RegistryError> {
        Ok(self.lock().archive.clone())
    }
}

/// Exclusive advisory lock on a registry's lock file, released on drop.
struct RegistryLock {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<fs::File>,
    #[cfg(not(unix))]
    path: PathBuf,
}

impl RegistryLock {
    /// Wait up to `timeout` for the lock at `path`, creating the file if
    /// needed.
    fn acquire(path: &Path, timeout: Duration) -> Result<Self, RegistryError> {
        let start = Instant::now();
        let mut warned = false;

        loop {
            match Self::try_acquire(path) {
                Ok(lock) => {
                    if warned {
                        debug!(
                            path = %path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "registry lock acquired after contention"
                        );
                    }
                    return Ok(lock);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > LOCK_CONTENTION_WARNING {
                        warn!(path = %path.display(), "registry locked by another process, waiting");
                        warned = true;
                    }
                }
                Err(source) => {
                    return Err(RegistryError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }

            if start.elapsed() >= timeout {
                return Err(RegistryError::LockTimeout {
                    path: path.to_path_buf(),
                    waited: timeout,
                });
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    #[cfg(unix)]
    fn try_acquire(path: &Path) -> io::Result<Self> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Self { _lock: lock }),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(io::ErrorKind::WouldBlock.into()),
            Err((_, errno)) => Err(errno.into()),
        }
    }

    /// Without `flock`, the lock is the existence of the file.
    #[cfg(not(unix))]
    fn try_acquire(path: &Path) -> io::Result<Self> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(Self {
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(io::ErrorKind::WouldBlock.into()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(not(unix))]
impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Registry persisted as a JSON document, rewritten on every mutation
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    lock_timeout: Duration,
}

impl FileRegistry {
    /// Open the registry at `path`. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file writers lock, e.g. `jobs.lock` for `jobs.json`
    pub fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    fn io_error(&self, source: io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn load(&self) -> Result<RegistryDocument, RegistryError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RegistryDocument::default()),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_str(&json).map_err(|source| RegistryError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Write to a uniquely named temp file in the same directory, then
    /// rename it over the document.
    fn save(&self, document: &RegistryDocument) -> Result<(), RegistryError> {
        let json = serde_json::to_string_pretty(document).map_err(|source| RegistryError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let mut temp = NamedTempFile::new_in(self.dir()).map_err(|e| self.io_error(e))?;
        temp.write_all(json.as_bytes()).map_err(|e| self.io_error(e))?;
        temp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        debug!(path = %self.path.display(), jobs = document.jobs.len(), "registry saved");
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryDocument) -> T) -> Result<T, RegistryError> {
        Ok(f(&self.load()?))
    }

    /// Load, apply `f` and save under the lock. Nothing is written if `f`
    /// fails.
    fn update<T>(&self, f: impl FnOnce(&mut RegistryDocument) -> Result<T, RegistryError>) -> Result<T, RegistryError> {
        fs::create_dir_all(self.dir()).map_err(|e| self.io_error(e))?;
        let _lock = RegistryLock::acquire(&self.lock_path(), self.lock_timeout)?;

        let mut document = self.load()?;
        let value = f(&mut document)?;
        self.save(&document)?;
        Ok(value)
    }
}

impl JobRegistry for FileRegistry {
    fn get(&self, id: &str) -> Result<Option<JobRecord>, RegistryError> {
        self.read(|doc| doc.jobs.get(id).cloned())
    }

    fn insert(&self, record: JobRecord) -> Result<(), RegistryError> {
        self.update(|doc| doc.insert(record))
    }

    fn set_handle(&self, id: &str, handle: &str) -> Result<JobRecord, RegistryError> {
        self.update(|doc| doc.set_handle(id, handle))
    }

    fn set_state(&self, id: &str, state: JobState) -> Result<(), RegistryError> {
        self.update(|doc| doc.set_state(id, state))
    }

    fn remove(&self, id: &str) -> Result<Option<JobRecord>, RegistryError> {
        self.update(|doc| Ok(doc.jobs.remove(id)))
    }

    fn list(&self) -> Result<Vec<JobRecord>, RegistryError> {
        self.read(|doc| doc.jobs.values().cloned().collect())
    }

    fn archive(&self, record: ArchivedRecord) -> Result<Option<JobRecord>, RegistryError> {
        self.update(|doc| Ok(doc.archive(record)))
    }

    fn archived(&self) -> Result<Vec<ArchivedRecord>, RegistryError> {
        self.read(|doc| doc.archive.clone())
    }
}
