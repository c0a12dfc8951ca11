use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use golem_lite::config::{MasterConfig, WorkerConfig};
use golem_lite::control::respawn_self;
use golem_lite::master::{BatchRequest, JobDetails, MasterRegistry, MasterServer, Submission};
use golem_lite::scheduler::TaskSpec;
use golem_lite::shutdown::install_shutdown_handler;
use golem_lite::worker::{Worker, WorkerExit};

#[derive(Parser, Debug)]
#[command(name = "golem-lite")]
#[command(version)]
#[command(about = "Run batches of shell commands across a fleet of workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Accept worker connections and dispatch batches to them
    Master(MasterArgs),

    /// Connect to a master and execute the jobs it sends
    Worker(WorkerArgs),
}

// =============================================================================
// Master Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct MasterArgs {
    /// Address to accept worker connections on
    #[arg(long, default_value = "127.0.0.1:8083")]
    listen: SocketAddr,

    /// JSON file holding a list of {"Count": n, "Args": [...]} tasks, one
    /// batch per file. May be repeated.
    #[arg(long = "tasks")]
    tasks: Vec<PathBuf>,

    /// Owner recorded on batches submitted from --tasks
    #[arg(long, default_value = "")]
    owner: String,

    /// Also append batch output to <dir>/<batch>.out.txt and .err.txt
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Seconds a new connection may take to send its handshake
    #[arg(long, default_value = "10")]
    handshake_timeout_secs: u64,

    /// Exit once every batch from --tasks is complete
    #[arg(long)]
    exit_when_done: bool,

    /// Format of the batch summary printed with --exit-when-done
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Master address (host:port)
    #[arg(long, default_value = "127.0.0.1:8083")]
    master: String,

    /// Maximum number of jobs run at once
    #[arg(long, default_value = "3")]
    capacity: usize,

    /// Name reported to the master instead of the socket address
    #[arg(long)]
    identity: Option<String>,
}

// =============================================================================
// Master Implementation
// =============================================================================

fn load_tasks(path: &Path) -> Result<Vec<TaskSpec>, Box<dyn std::error::Error>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let tasks: Vec<TaskSpec> = serde_json::from_str(&data)
        .map_err(|e| format!("invalid task file {}: {}", path.display(), e))?;
    Ok(tasks)
}

fn print_summary(details: &[JobDetails], format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(details)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<34} {:<10} {:>6} {:>8} {:>7}",
                "BATCH", "STATE", "TOTAL", "FINISHED", "ERRORED"
            );
            for d in details {
                println!(
                    "{:<34} {:<10} {:>6} {:>8} {:>7}",
                    d.job_id,
                    d.state.to_string(),
                    d.progress.total,
                    d.progress.finished,
                    d.progress.errored
                );
            }
        }
    }
    Ok(())
}

async fn run_master(args: MasterArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;

    let mut config = MasterConfig::new(args.listen);
    config.handshake_timeout_ms = args.handshake_timeout_secs.saturating_mul(1000);
    if let Some(dir) = args.output_dir {
        config = config.with_output_dir(dir);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        output_dir = ?config.output_dir,
        batches = args.tasks.len(),
        "Starting golem-lite master"
    );

    let registry = MasterRegistry::new(config);
    let server = MasterServer::bind(registry.clone()).await?;

    let mut submitted: Vec<Arc<Submission>> = Vec::new();
    for path in &args.tasks {
        let tasks = load_tasks(path)?;
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let request = BatchRequest::new(tasks)
            .with_owner(args.owner.clone())
            .with_label(label);
        let submission = registry.submit(request)?;
        tracing::info!(batch_id = %submission.batch_id(), path = %path.display(), "Submitted batch");
        submitted.push(submission);
    }

    if args.exit_when_done && !submitted.is_empty() {
        let shutdown = shutdown.clone();
        let format = args.output.clone();
        tokio::spawn(async move {
            let mut details = Vec::with_capacity(submitted.len());
            for submission in &submitted {
                details.push(submission.wait_complete().await);
            }
            if let Err(e) = print_summary(&details, &format) {
                tracing::error!(error = %e, "Failed to print summary");
            }
            shutdown.cancel();
        });
    }

    server.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Worker Implementation
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;

    let mut config = WorkerConfig::new(args.master, args.capacity);
    if let Some(identity) = args.identity {
        config = config.with_identity_hint(identity);
    }

    match Worker::new(config).run(shutdown).await {
        WorkerExit::Restart => {
            respawn_self()?;
        }
        WorkerExit::Shutdown => {
            tracing::info!("Master requested shutdown");
        }
        WorkerExit::Cancelled => {
            tracing::info!("Worker stopped");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Master(args) => run_master(args).await,
        Commands::Worker(args) => run_worker(args).await,
    }
}
