//! Execution plans for submitted jobs
//!
//! Interactive backends get the job's argv as-is. Detached backends get a
//! `/bin/sh -c` wrapper that redirects output to files and backgrounds the
//! command so it outlives the submitting connection:
//!
//! ```text
//! /bin/sh -c "'echo' 'hi there' >'stdout_<id>.txt' 2>'stderr_<id>.txt' &"
//! ```
//!
//! Words are wrapped in single quotes without further escaping, so argv
//! elements containing `'` must be rejected by `Job::validate` first.

use std::collections::BTreeMap;
use std::path::PathBuf;

use cwl_model::Job;

use crate::backend::SubmissionMode;

/// Shell used for detached submissions.
pub const DETACHED_SHELL: &str = "/bin/sh";

/// Concrete instructions handed to a backend session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Logical id of the job the plan runs
    pub job_id: String,
    pub executable: String,
    pub arguments: Vec<String>,
    /// Relative to `working_directory`
    pub stdout_path: String,
    /// Relative to `working_directory`
    pub stderr_path: String,
    pub environment: BTreeMap<String, String>,
    pub working_directory: PathBuf,
    pub max_runtime_minutes: u32,
    pub mode: SubmissionMode,
}

impl ExecutionPlan {
    /// Executable followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.executable.clone())
            .chain(self.arguments.iter().cloned())
            .collect()
    }
}

/// Builds execution plans for one host
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    job_id_variable: String,
}

impl CommandBuilder {
    pub fn new(job_id_variable: impl Into<String>) -> Self {
        Self {
            job_id_variable: job_id_variable.into(),
        }
    }

    pub fn build(&self, job: &Job, mode: SubmissionMode) -> ExecutionPlan {
        debug_assert!(job.validate().is_ok(), "job must be validated before building a plan");

        let stdout_path = job.stdout_file();
        let stderr_path = job.stderr_file();

        let (executable, arguments) = match mode {
            SubmissionMode::Interactive => (job.argv[0].clone(), job.argv[1..].to_vec()),
            SubmissionMode::Detached => (
                DETACHED_SHELL.to_string(),
                vec![
                    "-c".to_string(),
                    format!(
                        "{} >'{}' 2>'{}' &",
                        quote_words(&job.argv),
                        stdout_path,
                        stderr_path
                    ),
                ],
            ),
        };

        let mut environment = BTreeMap::new();
        environment.insert(self.job_id_variable.clone(), job.id.clone());

        ExecutionPlan {
            job_id: job.id.clone(),
            executable,
            arguments,
            stdout_path,
            stderr_path,
            environment,
            working_directory: job.working_directory.clone(),
            max_runtime_minutes: job.max_runtime_minutes,
            mode,
        }
    }
}

/// `'a0'` or `'a0' 'a1' 'a2'`
fn quote_words(argv: &[String]) -> String {
    match argv.split_first() {
        Some((first, [])) => format!("'{first}'"),
        Some((first, rest)) => format!("'{}' '{}'", first, rest.join("' '")),
        None => String::new(),
    }
}
