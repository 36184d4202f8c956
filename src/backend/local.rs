//! Local fork-exec backend
//!
//! Jobs are child processes of this service. The process table is shared by
//! every session in the process and is created once, on first use. Finished
//! processes stay listed as done for a short retention period and are then
//! purged, the way batch schedulers forget completed jobs. The wall-clock
//! limit is enforced whenever the table is listed.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{Backend, BackendError, BackendJob, BackendState, Session, SubmissionMode};
use crate::command::ExecutionPlan;
use crate::credential::Credential;
use crate::host::HostConfig;

/// How long finished processes remain listed.
const FINISHED_RETENTION: Duration = Duration::from_secs(300);

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

struct LocalProcess {
    job_id: String,
    child: Child,
    deadline: Instant,
    finished_at: Option<Instant>,
}

impl LocalProcess {
    /// Refresh and return whether the process has exited.
    fn poll(&mut self) -> bool {
        if self.finished_at.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(job_id = %self.job_id, pid = self.child.id(), %status, "local job exited");
                    self.finished_at = Some(Instant::now());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %self.job_id, error = %e, "cannot poll local job");
                }
            }
        }
        self.finished_at.is_some()
    }
}

type ProcessTable = Mutex<BTreeMap<String, LocalProcess>>;

static PROCESS_TABLE: OnceLock<ProcessTable> = OnceLock::new();

fn table() -> &'static ProcessTable {
    PROCESS_TABLE.get_or_init(|| {
        info!("initializing local process table");
        Mutex::new(BTreeMap::new())
    })
}

fn lock() -> MutexGuard<'static, BTreeMap<String, LocalProcess>> {
    // a panic while holding the lock leaves the table itself consistent
    table().lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Send SIGTERM, wait for the grace period, then SIGKILL.
fn terminate(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(child.id() as i32);
        let _ = signal::kill(pid, Signal::SIGTERM);

        let start = Instant::now();
        while start.elapsed() < TERMINATE_GRACE {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    match child.kill() {
        Ok(()) => {}
        // already exited
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait().map(|_| ())
}

fn open_output(dir: &Path, name: &str) -> Result<File, BackendError> {
    File::create(dir.join(name)).map_err(|e| {
        BackendError::new(
            "LocalOutputError",
            format!("cannot create {}: {e}", dir.join(name).display()),
        )
    })
}

/// Backend that runs jobs as local child processes
#[derive(Debug, Default, Clone)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn submission_mode(&self) -> SubmissionMode {
        SubmissionMode::Interactive
    }

    fn open(&self, host: &HostConfig, _credential: Option<&Credential>) -> Result<Box<dyn Session>, BackendError> {
        let hostname = host.address.hostname();
        if hostname != "localhost" && hostname != "127.0.0.1" {
            return Err(BackendError::new(
                "LocalHostError",
                format!("local backend only runs on localhost, not {hostname}"),
            ));
        }
        table();
        Ok(Box::new(LocalSession))
    }
}

struct LocalSession;

impl Session for LocalSession {
    fn list_jobs(&mut self) -> Result<Vec<BackendJob>, BackendError> {
        let now = Instant::now();

        // terminating waits out the grace period, so overdue jobs leave the
        // table while they are killed, as in `cancel`
        let overdue: Vec<(String, LocalProcess)> = {
            let mut table = lock();
            let handles: Vec<String> = table
                .iter_mut()
                .filter_map(|(handle, process)| (!process.poll() && now >= process.deadline).then(|| handle.clone()))
                .collect();
            let removed = handles
                .into_iter()
                .filter_map(|handle| table.remove(&handle).map(|process| (handle, process)))
                .collect();
            removed
        };

        for (handle, mut process) in overdue {
            info!(job_id = %process.job_id, %handle, "local job exceeded its wall-clock limit");
            if let Err(e) = terminate(&mut process.child) {
                warn!(%handle, error = %e, "cannot terminate overdue local job");
            }
            process.finished_at = Some(Instant::now());
            lock().insert(handle, process);
        }

        let mut table = lock();
        table.retain(|_, process| {
            process
                .finished_at
                .map_or(true, |finished| now.duration_since(finished) < FINISHED_RETENTION)
        });

        Ok(table
            .iter()
            .map(|(handle, process)| {
                let state = if process.finished_at.is_some() {
                    BackendState::Done
                } else {
                    BackendState::Running
                };
                BackendJob::new(handle.clone(), state)
            })
            .collect())
    }

    fn job_status(&mut self, job: &BackendJob) -> Result<BackendState, BackendError> {
        Ok(job.state.clone())
    }

    fn submit(&mut self, plan: &ExecutionPlan) -> Result<String, BackendError> {
        let dir = &plan.working_directory;
        fs::create_dir_all(dir).map_err(|e| {
            BackendError::new(
                "LocalWorkdirError",
                format!("cannot create {}: {e}", dir.display()),
            )
        })?;

        let stdout = open_output(dir, &plan.stdout_path)?;
        let stderr = open_output(dir, &plan.stderr_path)?;

        let child = Command::new(&plan.executable)
            .args(&plan.arguments)
            .current_dir(dir)
            .envs(&plan.environment)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| BackendError::new("LocalSpawnError", format!("cannot start {}: {e}", plan.executable)))?;

        let handle = child.id().to_string();
        let job_id = plan.job_id.clone();
        debug!(%handle, %job_id, executable = %plan.executable, "started local job");

        let deadline = Instant::now() + Duration::from_secs(u64::from(plan.max_runtime_minutes) * 60);
        lock().insert(
            handle.clone(),
            LocalProcess {
                job_id,
                child,
                deadline,
                finished_at: None,
            },
        );

        Ok(handle)
    }

    fn cancel(&mut self, job: &BackendJob) -> Result<(), BackendError> {
        let Some(mut process) = lock().remove(&job.handle) else {
            return Ok(());
        };

        let result = if process.poll() {
            Ok(())
        } else {
            terminate(&mut process.child)
        };
        process.finished_at.get_or_insert_with(Instant::now);
        lock().insert(job.handle.clone(), process);

        result.map_err(|e| BackendError::new("LocalKillError", format!("cannot kill {}: {e}", job.handle)))
    }

    fn close(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plan(dir: &Path, id: &str, argv: &[&str], minutes: u32) -> ExecutionPlan {
        let mut environment = BTreeMap::new();
        environment.insert("SIMCITY_JOBID".to_string(), id.to_string());
        ExecutionPlan {
            job_id: id.to_string(),
            executable: argv[0].to_string(),
            arguments: argv[1..].iter().map(|s| s.to_string()).collect(),
            stdout_path: format!("stdout_{id}.txt"),
            stderr_path: format!("stderr_{id}.txt"),
            environment,
            working_directory: dir.to_path_buf(),
            max_runtime_minutes: minutes,
            mode: SubmissionMode::Interactive,
        }
    }

    fn find(session: &mut LocalSession, handle: &str) -> Option<BackendJob> {
        session
            .list_jobs()
            .unwrap()
            .into_iter()
            .find(|job| job.handle == handle)
    }

    #[test]
    fn test_submit_redirects_output_and_sets_env() {
        let dir = TempDir::new().unwrap();
        let mut session = LocalSession;
        let handle = session
            .submit(&plan(dir.path(), "envjob", &["sh", "-c", "echo $SIMCITY_JOBID; echo oops >&2"], 5))
            .unwrap();

        let start = Instant::now();
        while find(&mut session, &handle).map(|j| j.state) != Some(BackendState::Done) {
            assert!(start.elapsed() < Duration::from_secs(10), "job did not finish");
            thread::sleep(Duration::from_millis(20));
        }

        let stdout = fs::read_to_string(dir.path().join("stdout_envjob.txt")).unwrap();
        let stderr = fs::read_to_string(dir.path().join("stderr_envjob.txt")).unwrap();
        assert_eq!(stdout.trim(), "envjob");
        assert_eq!(stderr.trim(), "oops");
    }

    #[test]
    fn test_cancel_running_job() {
        let dir = TempDir::new().unwrap();
        let mut session = LocalSession;
        let handle = session.submit(&plan(dir.path(), "sleeper", &["sleep", "30"], 5)).unwrap();

        let listed = find(&mut session, &handle).unwrap();
        assert_eq!(listed.state, BackendState::Running);

        session.cancel(&listed).unwrap();
        assert_eq!(find(&mut session, &handle).unwrap().state, BackendState::Done);
    }

    #[test]
    fn test_overdue_job_is_killed_without_blocking_other_sessions() {
        let dir = TempDir::new().unwrap();
        let mut session = LocalSession;
        // ignores SIGTERM, so termination waits out the whole grace period
        let handle = session
            .submit(&plan(dir.path(), "stubborn", &["sh", "-c", "trap '' TERM; sleep 10"], 0))
            .unwrap();
        thread::sleep(Duration::from_millis(200));

        let reaper = thread::spawn(move || LocalSession.list_jobs().unwrap());
        thread::sleep(Duration::from_millis(300));

        let start = Instant::now();
        LocalSession.list_jobs().unwrap();
        assert!(start.elapsed() < TERMINATE_GRACE / 2, "listing waited for termination");

        reaper.join().unwrap();
        assert_eq!(find(&mut session, &handle).unwrap().state, BackendState::Done);
    }

    #[test]
    fn test_spawn_failure_is_backend_error() {
        let dir = TempDir::new().unwrap();
        let mut session = LocalSession;
        let err = session
            .submit(&plan(dir.path(), "missing", &["/nonexistent/program"], 5))
            .unwrap_err();
        assert_eq!(err.class, "LocalSpawnError");
    }

    #[test]
    fn test_open_rejects_remote_hostname() {
        let host = HostConfig::new("x", "local://elsewhere", "/tmp", BTreeMap::new()).unwrap();
        assert!(LocalBackend::new().open(&host, None).is_err());
    }
}
