//! The `run-worker` command.

use anyhow::Result;
use clap::Args;
use tracing::info;

use dragnet_worker::{ShutdownSignal, Worker, WorkerConfig};

#[derive(Args, Debug)]
pub struct RunWorkerArgs {
    /// Job types to lease (defaults to all).
    #[arg(long = "job-types", num_args = 1..)]
    job_types: Vec<String>,
    /// Concurrent handler slots.
    #[arg(long, default_value_t = 1)]
    max_concurrent: usize,
    /// Stable worker identity (defaults to `<hostname>-<random>`).
    #[arg(long)]
    worker_id: Option<String>,
}

pub async fn run_worker(args: RunWorkerArgs) -> Result<()> {
    let store = super::open_store().await?;
    let worker = Worker::register(
        store,
        WorkerConfig {
            worker_id: args.worker_id,
            job_types: args.job_types,
            max_concurrent: args.max_concurrent,
        },
    )
    .await?;

    println!("Worker {} running; ctrl-c to stop.", worker.worker_id());

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.trigger();
            }
        });
    }

    worker.run(shutdown).await
}
