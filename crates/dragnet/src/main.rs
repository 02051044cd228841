//! Dragnet CLI: the control surface over the durable store, plus the
//! worker launcher.
//!
//! Exit codes: 0 success, 1 operational failure, 2 usage error (clap).

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "dragnet", about = "Distributed network reconnaissance job engine", version)]
struct Cli {
    /// Mirror full log output to stderr.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new scan job.
    CreateJob(cli::jobs::CreateJobArgs),
    /// List scan jobs.
    ListJobs(cli::jobs::ListJobsArgs),
    /// Show one job's status.
    JobStatus {
        /// Job UUID.
        job_uuid: String,
    },
    /// Cancel a pending, queued or running job.
    Cancel {
        /// Job UUID.
        job_uuid: String,
    },
    /// Show queue statistics.
    Stats {
        /// Limit to one queue.
        #[arg(long)]
        queue: Option<String>,
    },
    /// Show registered workers.
    Workers,
    /// Remove terminal jobs older than N days.
    Cleanup {
        /// Age threshold in days.
        #[arg(long, default_value_t = 7)]
        days: i64,
        /// Only report what would be deleted.
        #[arg(long)]
        dry_run: bool,
    },
    /// Seed the standard queues.
    SetupQueues,
    /// Run a worker until interrupted.
    RunWorker(cli::worker::RunWorkerArgs),
    /// Print engine metrics in text exposition format.
    Metrics,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();

    let app_name = match &args.command {
        Command::RunWorker(_) => "dragnet-worker",
        _ => "dragnet",
    };
    // The guard flushes the background log writer on drop.
    let _log_guard = match dragnet_logging::init_logging(app_name, args.verbose) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Failed to initialize logging: {err:#}");
            return ExitCode::from(1);
        }
    };

    let result = match args.command {
        Command::CreateJob(create) => cli::jobs::create_job(create).await,
        Command::ListJobs(list) => cli::jobs::list_jobs(list).await,
        Command::JobStatus { job_uuid } => cli::jobs::job_status(&job_uuid).await,
        Command::Cancel { job_uuid } => cli::jobs::cancel(&job_uuid).await,
        Command::Stats { queue } => cli::stats::queue_stats(queue.as_deref()).await,
        Command::Workers => cli::stats::workers().await,
        Command::Cleanup { days, dry_run } => cli::jobs::cleanup(days, dry_run).await,
        Command::SetupQueues => cli::stats::setup_queues().await,
        Command::RunWorker(run) => cli::worker::run_worker(run).await,
        Command::Metrics => cli::metrics::print_metrics().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}
