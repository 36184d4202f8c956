//! Transport layer for backend commands
//!
//! Backends drive their hosts by running short commands (`ps`, `kill`,
//! `sbatch`, ...). This module abstracts where those commands run:
//! - `CommandRunner`: interface used by backend sessions
//! - `LocalRunner`: runs the command on this machine
//! - `SshSession`: runs the command on a remote host through an SSH
//!   control master that lives exactly as long as the session
//!
//! Every command is bounded by a timeout; on expiry the child is killed.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::credential::{Credential, Secret};

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Single-line diagnostic, preferring stderr.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match self.status {
            Some(code) => format!("exit status {code}: {}", text.replace('\n', "; ")),
            None => format!("terminated by signal: {}", text.replace('\n', "; ")),
        }
    }
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} did not finish within {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("empty command")]
    EmptyCommand,
}

impl TransportError {
    /// Stable class name used when the error is surfaced to callers.
    pub fn class(&self) -> &'static str {
        match self {
            TransportError::Spawn { .. } => "SpawnError",
            TransportError::Timeout { .. } => "TimeoutError",
            TransportError::Io(_) => "IoError",
            TransportError::EmptyCommand => "EmptyCommand",
        }
    }
}

/// Runs backend commands somewhere
pub trait CommandRunner: Send {
    /// Run `argv` to completion and capture its output.
    fn run(&self, argv: &[String]) -> Result<CommandOutput, TransportError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Release whatever connection the runner holds.
    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Quote a string as a single POSIX shell word.
pub fn sh_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', "'\\''"))
}

/// Join an argv into a shell command line, quoting every word.
pub fn sh_join(argv: &[String]) -> String {
    argv.iter().map(|word| sh_quote(word)).collect::<Vec<_>>().join(" ")
}

/// Wait for `child` with a timeout, collecting stdout and stderr.
///
/// Both pipes are drained on helper threads so a chatty child cannot
/// block on a full pipe while we wait.
fn collect(mut child: Child, program: &str, timeout: Duration) -> Result<CommandOutput, TransportError> {
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::Timeout {
                program: program.to_string(),
                seconds: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout.map(|h| h.join().unwrap_or_default()).unwrap_or_default();
    let stderr = stderr.map(|h| h.join().unwrap_or_default()).unwrap_or_default();

    Ok(CommandOutput {
        status: status.code(),
        stdout,
        stderr,
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn spawn_captured(mut command: Command, program: &str) -> Result<Child, TransportError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| TransportError::Spawn {
            program: program.to_string(),
            source,
        })
}

/// Runs commands on this machine without a shell.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    timeout: Duration,
}

impl LocalRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for LocalRunner {
    fn run(&self, argv: &[String]) -> Result<CommandOutput, TransportError> {
        let (program, args) = argv.split_first().ok_or(TransportError::EmptyCommand)?;
        debug!(command = %sh_join(argv), "running local command");

        let mut command = Command::new(program);
        command.args(args);
        let child = spawn_captured(command, program)?;
        collect(child, program, self.timeout)
    }

    fn describe(&self) -> String {
        "localhost".to_string()
    }
}

/// SSH destination parsed from a hostname of the form `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshTarget {
    pub fn parse(hostname: &str) -> Result<Self, String> {
        let (user, rest) = match hostname.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(format!("empty user in {hostname:?}")),
            None => (None, hostname),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in {hostname:?}"))?;
                (host, Some(port))
            }
            None => (rest, None),
        };

        if host.is_empty() {
            return Err(format!("empty host in {hostname:?}"));
        }

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }

    /// Destination argument passed to `ssh`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// SSH session configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub target: SshTarget,
    pub credential: Option<Credential>,
    /// Extra `-o Key=Value` options
    pub options: BTreeMap<String, String>,
    /// Bound on each command, including connection setup
    pub timeout: Duration,
    pub server_alive_interval: u32,
    pub server_alive_count_max: u32,
}

impl SshConfig {
    pub fn new(target: SshTarget, timeout: Duration) -> Self {
        Self {
            target,
            credential: None,
            options: BTreeMap::new(),
            timeout,
            server_alive_interval: 15,
            server_alive_count_max: 2,
        }
    }

    /// Options common to the master and every multiplexed command.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.server_alive_interval),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", self.server_alive_count_max),
        ];

        if let Some(port) = self.target.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }

        for (key, value) in &self.options {
            args.push("-o".to_string());
            args.push(format!("{key}={value}"));
        }

        args
    }
}

static SSH_CLIENT: OnceLock<Result<String, String>> = OnceLock::new();

/// Probe the local `ssh` client once per process.
///
/// Concurrent first callers block on the same probe; the outcome is
/// reused by every later session.
pub fn ssh_client_version() -> Result<&'static str, String> {
    SSH_CLIENT
        .get_or_init(|| {
            let mut command = Command::new("ssh");
            command.arg("-V");
            let child = spawn_captured(command, "ssh").map_err(|e| e.to_string())?;
            let output = collect(child, "ssh", Duration::from_secs(10)).map_err(|e| e.to_string())?;
            // OpenSSH prints its version on stderr
            let version = format!("{}{}", output.stderr, output.stdout).trim().to_string();
            if output.success() {
                debug!(%version, "ssh client available");
                Ok(version)
            } else {
                Err(output.diagnostic())
            }
        })
        .as_ref()
        .map(String::as_str)
        .map_err(Clone::clone)
}

/// Errors opening an SSH session
#[derive(Debug, thiserror::Error)]
pub enum SshConnectError {
    #[error("ssh client unavailable: {0}")]
    ClientUnavailable(String),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("authentication or connection failed: {message}")]
    Rejected { code: Option<i32>, message: String },
}

impl SshConnectError {
    pub fn code(&self) -> Option<i32> {
        match self {
            SshConnectError::Rejected { code, .. } => *code,
            _ => None,
        }
    }
}

/// An SSH control master plus the commands multiplexed over it.
///
/// The master is started by `connect` and stopped by `close` (or on drop).
pub struct SshSession {
    config: SshConfig,
    control_dir: Option<TempDir>,
}

impl SshSession {
    /// Start a control master and wait until it has authenticated.
    pub fn connect(config: SshConfig) -> Result<Self, SshConnectError> {
        ssh_client_version().map_err(SshConnectError::ClientUnavailable)?;

        let control_dir = tempfile::Builder::new().prefix("cwl-ssh-")
            .tempdir()
            .map_err(TransportError::from)?;
        let log_path = control_dir.path().join("master.log");
        let control_path = control_dir.path().join("ctl");

        let secret = config.credential.as_ref().and_then(Credential::prompt_secret);

        let mut argv: Vec<String> = Vec::new();
        if let Some(credential) = &config.credential {
            if secret.is_some() {
                argv.push("sshpass".to_string());
                argv.push("-e".to_string());
                if matches!(credential, Credential::Certificate { .. }) {
                    argv.push("-P".to_string());
                    argv.push("assphrase".to_string());
                }
            }
        }
        argv.push("ssh".to_string());
        argv.extend([
            "-M".to_string(),
            "-S".to_string(),
            control_path.display().to_string(),
            "-o".to_string(),
            "ControlPersist=no".to_string(),
            "-f".to_string(),
            "-N".to_string(),
            "-E".to_string(),
            log_path.display().to_string(),
        ]);
        if secret.is_none() {
            argv.push("-o".to_string());
            argv.push("BatchMode=yes".to_string());
        }
        if let Some(Credential::Certificate { key_path, .. }) = &config.credential {
            argv.push("-i".to_string());
            argv.push(key_path.display().to_string());
            argv.push("-o".to_string());
            argv.push("IdentitiesOnly=yes".to_string());
        }
        argv.extend(config.base_args());
        argv.push(config.target.destination());

        debug!(
            destination = %config.target.destination(),
            credential = config.credential.as_ref().map(Credential::kind).unwrap_or("agent"),
            "starting ssh control master"
        );

        let status = run_master(&argv, secret, config.timeout)?;
        if status != Some(0) {
            let message = fs::read_to_string(&log_path)
                .unwrap_or_default()
                .trim()
                .replace('\n', "; ");
            return Err(SshConnectError::Rejected {
                code: status,
                message: if message.is_empty() {
                    format!("ssh exited with {status:?}")
                } else {
                    message
                },
            });
        }

        Ok(Self {
            config,
            control_dir: Some(control_dir),
        })
    }

    fn control_path(&self) -> Option<PathBuf> {
        self.control_dir.as_ref().map(|dir| dir.path().join("ctl"))
    }

    fn multiplexed_args(&self, control_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            control_path.display().to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        args.extend(self.config.base_args());
        args
    }

    /// Stop the control master. Safe to call more than once.
    fn stop_master(&mut self) -> Result<(), TransportError> {
        let Some(control_path) = self.control_path() else {
            return Ok(());
        };

        let mut command = Command::new("ssh");
        command
            .args(["-S", &control_path.display().to_string(), "-O", "exit"])
            .arg(self.config.target.destination());
        let result = spawn_captured(command, "ssh").and_then(|child| collect(child, "ssh", self.config.timeout));

        // dropping the directory removes the control socket
        self.control_dir = None;

        match result {
            Ok(output) if !output.success() => {
                warn!(diagnostic = %output.diagnostic(), "ssh control master did not exit cleanly");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn run_master(argv: &[String], secret: Option<&Secret>, timeout: Duration) -> Result<Option<i32>, TransportError> {
    let (program, args) = argv.split_first().ok_or(TransportError::EmptyCommand)?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(secret) = secret {
        command.env("SSHPASS", secret.expose());
    }

    let mut child = command.spawn().map_err(|source| TransportError::Spawn {
        program: program.clone(),
        source,
    })?;

    match child.wait_timeout(timeout)? {
        Some(status) => Ok(status.code()),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(TransportError::Timeout {
                program: program.clone(),
                seconds: timeout.as_secs(),
            })
        }
    }
}

impl CommandRunner for SshSession {
    fn run(&self, argv: &[String]) -> Result<CommandOutput, TransportError> {
        if argv.is_empty() {
            return Err(TransportError::EmptyCommand);
        }
        let control_path = self.control_path().ok_or_else(|| {
            TransportError::Io(io::Error::new(io::ErrorKind::NotConnected, "ssh session is closed"))
        })?;

        let remote = sh_join(argv);
        debug!(destination = %self.config.target.destination(), command = %remote, "running remote command");

        let mut command = Command::new("ssh");
        command
            .args(self.multiplexed_args(&control_path))
            .arg(self.config.target.destination())
            .arg("--")
            .arg(remote);
        let child = spawn_captured(command, "ssh")?;
        collect(child, "ssh", self.config.timeout)
    }

    fn describe(&self) -> String {
        self.config.target.destination()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.stop_master()
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.control_dir.is_some() {
            if let Err(e) = self.stop_master() {
                warn!(error = %e, "failed to stop ssh control master");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("hi there"), "'hi there'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn test_sh_join() {
        let argv = vec!["kill".to_string(), "-TERM".to_string(), "42".to_string()];
        assert_eq!(sh_join(&argv), "'kill' '-TERM' '42'");
    }

    #[test]
    fn test_ssh_target_parse() {
        assert_eq!(
            SshTarget::parse("login.example.org").unwrap(),
            SshTarget {
                user: None,
                host: "login.example.org".into(),
                port: None
            }
        );

        let target = SshTarget::parse("alice@login:2222").unwrap();
        assert_eq!(target.user.as_deref(), Some("alice"));
        assert_eq!(target.host, "login");
        assert_eq!(target.port, Some(2222));
        assert_eq!(target.destination(), "alice@login");

        assert!(SshTarget::parse("@host").is_err());
        assert!(SshTarget::parse("host:port").is_err());
        assert!(SshTarget::parse("alice@:22").is_err());
    }

    #[test]
    fn test_ssh_base_args_forward_options() {
        let mut config = SshConfig::new(SshTarget::parse("bob@h:2200").unwrap(), Duration::from_secs(30));
        config
            .options
            .insert("StrictHostKeyChecking".into(), "no".into());

        let args = config.base_args();
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2200"]));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
    }

    #[test]
    fn test_command_output_diagnostic() {
        let output = CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: "line one\nline two\n".into(),
        };
        assert!(!output.success());
        assert_eq!(output.diagnostic(), "exit status 1: line one; line two");
    }

    #[cfg(unix)]
    #[test]
    fn test_local_runner_captures_output() {
        let runner = LocalRunner::new(Duration::from_secs(10));
        let output = runner
            .run(&["sh".into(), "-c".into(), "echo out; echo err >&2; exit 3".into()])
            .unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn test_local_runner_enforces_timeout() {
        let runner = LocalRunner::new(Duration::from_millis(200));
        let err = runner.run(&["sleep".into(), "5".into()]).unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert_eq!(err.class(), "TimeoutError");
    }

    #[test]
    fn test_local_runner_reports_missing_program() {
        let runner = LocalRunner::new(Duration::from_secs(5));
        let err = runner
            .run(&["definitely-not-a-real-program-xyz".into()])
            .unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
        assert!(matches!(runner.run(&[]), Err(TransportError::EmptyCommand)));
    }
}
