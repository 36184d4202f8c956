//! POSIX shell backend over SSH
//!
//! Every command is a fire-and-forget SSH exec, so jobs are submitted as
//! detached shell wrappers. The job listing is the host's process table
//! (`ps`). A handle is `<pid>@<start time>`, so a PID reused by an unrelated
//! process after the job exits never matches the job's handle.

use tracing::debug;

use super::{command_failed, connect_ssh, Backend, BackendError, BackendJob, BackendState, Session, SubmissionMode};
use crate::command::{ExecutionPlan, DETACHED_SHELL};
use crate::credential::Credential;
use crate::host::transport::{sh_join, sh_quote, CommandRunner};
use crate::host::HostConfig;

/// Backend that runs detached jobs through a remote POSIX shell
#[derive(Debug, Default, Clone)]
pub struct ShellBackend;

impl ShellBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for ShellBackend {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    fn submission_mode(&self) -> SubmissionMode {
        SubmissionMode::Detached
    }

    fn open(&self, host: &HostConfig, credential: Option<&Credential>) -> Result<Box<dyn Session>, BackendError> {
        let runner = connect_ssh(host, credential)?;
        Ok(Box::new(ShellSession::new(runner)))
    }
}

/// Session issuing `ps`, `kill` and detached submissions through a runner
pub struct ShellSession {
    runner: Box<dyn CommandRunner>,
}

impl ShellSession {
    pub fn new(runner: Box<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

/// Map a `ps` STAT column to a backend state.
fn parse_stat(stat: &str) -> BackendState {
    match stat.chars().next() {
        Some('R' | 'S' | 'D' | 'I' | 'W') => BackendState::Running,
        Some('Z' | 'X') => BackendState::Done,
        Some('T' | 't') => BackendState::Other("stopped".to_string()),
        _ => BackendState::Other(stat.to_string()),
    }
}

/// Handle for a process started at `started` (the `lstart` column, one
/// field per word).
fn process_handle<'a>(pid: &str, started: impl Iterator<Item = &'a str>) -> String {
    let started: Vec<&str> = started.collect();
    format!("{pid}@{}", started.join("_"))
}

/// PID part of a handle
fn handle_pid(handle: &str) -> &str {
    handle.split_once('@').map_or(handle, |(pid, _)| pid)
}

/// Parse `ps -eo pid=,stat=,lstart=` output.
fn parse_ps(output: &str) -> Vec<BackendJob> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?;
            let stat = fields.next()?;
            pid.parse::<u32>().ok()?;
            let mut started = fields.peekable();
            started.peek()?;
            Some(BackendJob::new(process_handle(pid, started), parse_stat(stat)))
        })
        .collect()
}

/// Remote script that starts the detached plan and prints its PID and
/// start time.
fn submit_script(plan: &ExecutionPlan) -> String {
    let mut argv = plan.argv();
    if let Some(script) = argv.last_mut() {
        script.push_str(" pid=$!; echo $pid $(LC_ALL=C ps -o lstart= -p $pid)");
    }

    let environment: Vec<String> = plan
        .environment
        .iter()
        .map(|(name, value)| format!("{}={}", name, sh_quote(value)))
        .collect();

    let workdir = sh_quote(&plan.working_directory.display().to_string());
    format!(
        "mkdir -p {workdir} && cd {workdir} && {} exec {}",
        environment.join(" "),
        sh_join(&argv)
    )
}

/// Handle from the submit script's last line. A job that exits before its
/// start time is read gets an empty start time, which no listing entry
/// matches, so it reads as absent.
fn parse_submit(stdout: &str) -> Option<String> {
    let mut fields = stdout.lines().last()?.split_whitespace();
    let pid = fields.next()?;
    pid.parse::<u32>().ok()?;
    Some(process_handle(pid, fields))
}

impl Session for ShellSession {
    fn list_jobs(&mut self) -> Result<Vec<BackendJob>, BackendError> {
        let output = self
            .runner
            .run(&[
                "env".to_string(),
                "LC_ALL=C".to_string(),
                "ps".to_string(),
                "-eo".to_string(),
                "pid=,stat=,lstart=".to_string(),
            ])?;
        if !output.success() {
            return Err(command_failed("ShellListError", &output));
        }
        Ok(parse_ps(&output.stdout))
    }

    fn job_status(&mut self, job: &BackendJob) -> Result<BackendState, BackendError> {
        Ok(job.state.clone())
    }

    fn submit(&mut self, plan: &ExecutionPlan) -> Result<String, BackendError> {
        if plan.mode != SubmissionMode::Detached || plan.executable != DETACHED_SHELL {
            return Err(BackendError::new(
                "ShellSubmitError",
                "the shell backend only accepts detached plans",
            ));
        }

        let script = submit_script(plan);
        debug!(host = %self.runner.describe(), "submitting detached job");
        let output = self
            .runner
            .run(&[DETACHED_SHELL.to_string(), "-c".to_string(), script])?;
        if !output.success() {
            return Err(command_failed("ShellSubmitError", &output));
        }

        parse_submit(&output.stdout).ok_or_else(|| {
            BackendError::new(
                "ShellSubmitError",
                format!("expected a process id, got {:?}", output.stdout.trim()),
            )
        })
    }

    fn cancel(&mut self, job: &BackendJob) -> Result<(), BackendError> {
        let output = self
            .runner
            .run(&["kill".to_string(), "-TERM".to_string(), handle_pid(&job.handle).to_string()])?;
        if !output.success() {
            return Err(command_failed("ShellCancelError", &output));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.runner.close().map_err(BackendError::from)
    }
}
