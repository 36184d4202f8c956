//! CWL Compute CLI
//!
//! Entry point for the `cwl-compute` command-line tool.

use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use cwl_compute::registry::ArchivedRecord;
use cwl_compute::{
    logging, FileRegistry, HostInventory, InventoryError, JobRecord, JobService, LogStream, RegistryError,
    ServiceError, SubmitOptions,
};

#[derive(Parser)]
#[command(name = "cwl-compute")]
#[command(about = "Submit, track and cancel jobs on local and remote compute hosts", version)]
struct Cli {
    /// Path to host inventory (default: ~/.config/cwl-compute/hosts.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Raise log verbosity (repeatable)
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured hosts
    Hosts,

    /// Submit a command to a host
    Submit {
        /// Host name from the inventory
        #[arg(long)]
        host: String,

        /// Logical job id (default: a random UUID)
        #[arg(long)]
        id: Option<String>,

        /// Working directory (default: the host's path)
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Wall-clock limit in minutes (default: the host's max_time)
        #[arg(long)]
        max_time: Option<u32>,

        /// The command to run (after --)
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },

    /// Refresh and show job states (all active jobs when no id is given)
    Status {
        ids: Vec<String>,
    },

    /// Cancel a job and archive it
    Cancel {
        id: String,
    },

    /// List active jobs without contacting any host
    Jobs,

    /// Show a job's output file
    Log {
        id: String,

        /// Show stderr instead of stdout
        #[arg(long)]
        stderr: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Error serializing output: {0}")]
    Output(#[from] serde_json::Error),
}

impl From<RegistryError> for CliError {
    fn from(err: RegistryError) -> Self {
        CliError::Service(err.into())
    }
}

impl CliError {
    fn code(&self) -> &'static str {
        match self {
            CliError::Inventory(_) => "CONFIG_FAILURE",
            CliError::Service(e) => e.code(),
            CliError::Output(_) => "OUTPUT_FAILURE",
        }
    }

    fn exit_code(&self) -> i32 {
        match self {
            CliError::Inventory(_) => 3,
            CliError::Service(e) => e.exit_code(),
            CliError::Output(_) => 1,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let inventory = match &cli.config {
        Some(path) => HostInventory::load(path),
        None => HostInventory::load_default(),
    };
    let level = inventory
        .as_ref()
        .map(|inv| inv.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    logging::init(&level, cli.verbose);

    let result = inventory
        .map_err(CliError::from)
        .and_then(|inventory| run(&cli, &inventory));

    if let Err(e) = result {
        if cli.json {
            println!("{}", json!({ "code": e.code(), "message": e.to_string() }));
        } else {
            eprintln!("Error: {}", e);
        }
        process::exit(e.exit_code());
    }
}

fn run(cli: &Cli, inventory: &HostInventory) -> Result<(), CliError> {
    let registry = FileRegistry::open(inventory.registry_path()?);
    let service = JobService::from_hosts(inventory.host_configs()?, Arc::new(registry))?;

    match &cli.command {
        Commands::Hosts => run_hosts(&service, cli.json),
        Commands::Submit {
            host,
            id,
            workdir,
            max_time,
            argv,
        } => {
            let options = SubmitOptions {
                id: id.clone(),
                working_directory: workdir.clone(),
                max_runtime_minutes: *max_time,
            };
            let record = service.submit(host, argv.clone(), options)?;
            if cli.json {
                print_json(&record)
            } else {
                println!(
                    "Submitted job {} on {} (handle {})",
                    record.job.id,
                    record.host,
                    record.job.batch_id().unwrap_or("-")
                );
                Ok(())
            }
        }
        Commands::Status { ids } => {
            let records = service.refresh(ids)?;
            print_records(&records, cli.json)
        }
        Commands::Cancel { id } => {
            let archived = service.cancel(id)?;
            if cli.json {
                print_json(&archived)
            } else {
                print_archived(&archived);
                Ok(())
            }
        }
        Commands::Jobs => {
            let records = service.registry().list()?;
            print_records(&records, cli.json)
        }
        Commands::Log { id, stderr } => {
            let stream = if *stderr { LogStream::Stderr } else { LogStream::Stdout };
            let path = service.log_path(id, stream)?;
            run_log(&path, cli.json)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_hosts(service: &JobService, json_output: bool) -> Result<(), CliError> {
    let hosts: Vec<_> = service.hosts().collect();

    if json_output {
        let output: Vec<serde_json::Value> = hosts
            .iter()
            .map(|h| {
                json!({
                    "name": h.name,
                    "address": h.address.to_string(),
                    "path": h.working_directory,
                    "max_time": h.max_time_default,
                    "job_id_variable": h.job_id_variable,
                })
            })
            .collect();
        return print_json(&output);
    }

    if hosts.is_empty() {
        println!("No hosts configured.");
        return Ok(());
    }

    println!("Configured hosts ({} total):\n", hosts.len());
    for host in hosts {
        println!("  {} ({})", host.name, host.address);
        println!("    Path: {}", host.working_directory.display());
        println!("    Max time: {} min", host.max_time_default);
        if !host.scheduler_properties.is_empty() {
            let props: Vec<String> = host
                .scheduler_properties
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            println!("    Scheduler: {}", props.join(", "));
        }
        println!();
    }
    Ok(())
}

fn print_records(records: &[JobRecord], json_output: bool) -> Result<(), CliError> {
    if json_output {
        return print_json(&records);
    }

    if records.is_empty() {
        println!("No active jobs.");
        return Ok(());
    }

    for record in records {
        println!(
            "{:<38} {:<12} {:<12} {}",
            record.job.id,
            record.host,
            record.job.batch_id().unwrap_or("-"),
            record.job.state
        );
    }
    Ok(())
}

fn print_archived(archived: &ArchivedRecord) {
    println!(
        "Archived job {} on {} ({})",
        archived.archived.job.id, archived.host, archived.archived.reason
    );
}

/// Print a local output file, or its path when it is not readable here
/// (e.g. it lives on a remote host).
fn run_log(path: &Path, json_output: bool) -> Result<(), CliError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read log file");
            None
        }
    };

    if json_output {
        return print_json(&json!({ "path": path, "content": content }));
    }

    match content {
        Some(content) => print!("{}", content),
        None => {
            eprintln!("Log file is not available locally.");
            println!("{}", path.display());
        }
    }
    Ok(())
}
