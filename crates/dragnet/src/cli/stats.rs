//! Queue and worker inspection commands.

use anyhow::Result;
use comfy_table::Cell;

use super::output::table;

pub async fn queue_stats(queue: Option<&str>) -> Result<()> {
    let store = super::open_store().await?;
    let stats = store.queue_stats(queue).await?;

    if stats.is_empty() {
        println!("No queues found.");
        return Ok(());
    }

    let mut out = table(&[
        "QUEUE", "ENABLED", "MAX", "PENDING", "RUNNING", "COMPLETED", "FAILED",
    ]);
    for entry in &stats {
        out.add_row(vec![
            Cell::new(&entry.name),
            Cell::new(if entry.enabled { "yes" } else { "no" }),
            Cell::new(entry.max_concurrent),
            Cell::new(entry.pending),
            Cell::new(entry.running),
            Cell::new(entry.completed),
            Cell::new(entry.failed),
        ]);
    }
    println!("{out}");
    Ok(())
}

pub async fn workers() -> Result<()> {
    let store = super::open_store().await?;
    let workers = store.list_workers().await?;

    if workers.is_empty() {
        println!("No workers registered.");
        return Ok(());
    }

    let mut out = table(&[
        "WORKER", "STATUS", "HOST", "PID", "SLOTS", "TYPES", "LAST HEARTBEAT",
    ]);
    for worker in &workers {
        out.add_row(vec![
            Cell::new(&worker.worker_id),
            Cell::new(worker.status().as_str()),
            Cell::new(&worker.hostname),
            Cell::new(worker.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into())),
            Cell::new(format!(
                "{}/{}",
                worker.current_job_count, worker.max_concurrent
            )),
            Cell::new(worker.supported_types().join(",")),
            Cell::new(&worker.last_heartbeat),
        ]);
    }
    println!("{out}");
    Ok(())
}

pub async fn setup_queues() -> Result<()> {
    let store = super::open_store().await?;
    let queues = store.setup_default_queues().await?;
    for queue in queues {
        println!(
            "Queue '{}' ready (max {}, priority {})",
            queue.name, queue.max_concurrent, queue.priority
        );
    }
    Ok(())
}
