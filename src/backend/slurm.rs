//! Slurm backend
//!
//! Drives `sbatch`, `squeue` and `scancel` on the login node, over SSH or
//! directly when the host is `localhost`. Slurm manages output
//! redirection and backgrounding itself, so plans are interactive: the
//! job's argv becomes the batch script body.

use tracing::debug;

use super::{command_failed, connect_ssh, Backend, BackendError, BackendJob, BackendState, Session, SubmissionMode};
use crate::command::ExecutionPlan;
use crate::credential::Credential;
use crate::host::transport::{sh_join, CommandRunner, LocalRunner};
use crate::host::HostConfig;

/// Slurm job states that mean the job will not run again.
const TERMINAL_STATES: &[&str] = &[
    "COMPLETED",
    "COMPLETING",
    "CANCELLED",
    "FAILED",
    "TIMEOUT",
    "NODE_FAIL",
    "PREEMPTED",
    "BOOT_FAIL",
    "DEADLINE",
    "OUT_OF_MEMORY",
];

/// Backend for Slurm clusters
#[derive(Debug, Default, Clone)]
pub struct SlurmBackend;

impl SlurmBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for SlurmBackend {
    fn kind(&self) -> &'static str {
        "slurm"
    }

    fn submission_mode(&self) -> SubmissionMode {
        SubmissionMode::Interactive
    }

    fn open(&self, host: &HostConfig, credential: Option<&Credential>) -> Result<Box<dyn Session>, BackendError> {
        let runner: Box<dyn CommandRunner> = if host.address.hostname() == "localhost" {
            Box::new(LocalRunner::new(host.call_timeout))
        } else {
            connect_ssh(host, credential)?
        };
        Ok(Box::new(SlurmSession::new(
            runner,
            host.scheduler_properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        )))
    }
}

/// Session issuing Slurm client commands through a runner
pub struct SlurmSession {
    runner: Box<dyn CommandRunner>,
    /// Forwarded to `sbatch` as `--key=value`
    scheduler_properties: Vec<(String, String)>,
}

impl SlurmSession {
    pub fn new(runner: Box<dyn CommandRunner>, scheduler_properties: Vec<(String, String)>) -> Self {
        Self {
            runner,
            scheduler_properties,
        }
    }

    fn sbatch_args(&self, plan: &ExecutionPlan) -> Vec<String> {
        let mut args = vec![
            "sbatch".to_string(),
            "--parsable".to_string(),
            format!("--chdir={}", plan.working_directory.display()),
            format!("--output={}", plan.stdout_path),
            format!("--error={}", plan.stderr_path),
            format!("--time={}", plan.max_runtime_minutes),
        ];

        args.push(format!("--job-name={}", plan.job_id));

        let exports: Vec<String> = plan
            .environment
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        args.push(format!("--export=ALL,{}", exports.join(",")));

        for (key, value) in &self.scheduler_properties {
            args.push(format!("--{key}={value}"));
        }

        args.push(format!("--wrap={}", sh_join(&plan.argv())));
        args
    }
}

fn parse_state(state: &str) -> BackendState {
    let state = state.trim().trim_end_matches('+');
    if state == "RUNNING" {
        BackendState::Running
    } else if TERMINAL_STATES.contains(&state) {
        BackendState::Done
    } else {
        BackendState::Other(state.to_string())
    }
}

/// Parse `squeue --format='%i %T'` output.
fn parse_squeue(output: &str) -> Vec<BackendJob> {
    output
        .lines()
        .filter_map(|line| {
            let (id, state) = line.trim().split_once(char::is_whitespace)?;
            Some(BackendJob::new(id, parse_state(state)))
        })
        .collect()
}

impl Session for SlurmSession {
    fn list_jobs(&mut self) -> Result<Vec<BackendJob>, BackendError> {
        let output = self.runner.run(&[
            "squeue".to_string(),
            "--me".to_string(),
            "--noheader".to_string(),
            "--format=%i %T".to_string(),
        ])?;
        if !output.success() {
            return Err(command_failed("SlurmListError", &output));
        }
        Ok(parse_squeue(&output.stdout))
    }

    fn job_status(&mut self, job: &BackendJob) -> Result<BackendState, BackendError> {
        Ok(job.state.clone())
    }

    fn submit(&mut self, plan: &ExecutionPlan) -> Result<String, BackendError> {
        let args = self.sbatch_args(plan);
        debug!(host = %self.runner.describe(), "submitting slurm batch job");

        let output = self.runner.run(&args)?;
        if !output.success() {
            return Err(command_failed("SlurmSubmitError", &output));
        }

        // --parsable prints `jobid` or `jobid;cluster`
        let line = output.stdout.lines().last().unwrap_or("").trim();
        let job_id = line.split(';').next().unwrap_or("");
        if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_digit() || c == '_') {
            return Err(BackendError::new(
                "SlurmSubmitError",
                format!("unexpected sbatch output {:?}", output.stdout.trim()),
            ));
        }
        Ok(job_id.to_string())
    }

    fn cancel(&mut self, job: &BackendJob) -> Result<(), BackendError> {
        let output = self
            .runner
            .run(&["scancel".to_string(), job.handle.clone()])?;
        if !output.success() {
            return Err(command_failed("SlurmCancelError", &output));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.runner.close().map_err(BackendError::from)
    }
}
