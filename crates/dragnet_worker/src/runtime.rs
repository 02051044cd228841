//! The worker runtime: registration, heartbeat loop, dispatcher loop,
//! shutdown drain.
//!
//! The dispatcher ticks once a second: reap finished handlers, run the
//! stale-lease sweeper on its own cadence, lease at most one primary job,
//! then fill the remaining slots with an ancillary batch. Heartbeats run
//! on an independent task and are never blocked by handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dragnet_db::{Store, WorkerRow};
use dragnet_protocol::defaults::{
    DISPATCH_INTERVAL_SECS, HEARTBEAT_INTERVAL_SECS, HEARTBEAT_RETRY_SECS, SHUTDOWN_DRAIN_SECS,
    SWEEP_INTERVAL_SECS, WORKER_STALE_SECS,
};
use dragnet_protocol::{AncillaryJobType, PrimaryJobType, WorkerStatus};

use crate::handlers::JobHandlers;
use crate::metrics::{Metrics, METRICS};
use crate::shutdown::ShutdownSignal;

/// Worker configuration (plain data).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identity; generated as `<hostname>-<8 hex>` when absent.
    pub worker_id: Option<String>,
    /// Job types this worker will lease. Empty means all known types.
    pub job_types: Vec<String>,
    /// Handler slots.
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            job_types: Vec::new(),
            max_concurrent: 1,
        }
    }
}

impl WorkerConfig {
    fn resolved_types(&self) -> Vec<String> {
        if !self.job_types.is_empty() {
            return self.job_types.clone();
        }
        PrimaryJobType::ALL
            .iter()
            .map(|t| t.as_str().to_string())
            .chain(AncillaryJobType::ALL.iter().map(|t| t.as_str().to_string()))
            .collect()
    }
}

/// A registered, running worker.
pub struct Worker {
    store: Store,
    row: WorkerRow,
    handlers: Arc<JobHandlers>,
    max_concurrent: usize,
}

impl Worker {
    /// Register this process in the store.
    pub async fn register(store: Store, config: WorkerConfig) -> Result<Self> {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", hostname(), &Uuid::new_v4().simple().to_string()[..8]));
        let types = config.resolved_types();

        let row = store
            .register_worker(
                &worker_id,
                &hostname(),
                std::process::id(),
                &types,
                config.max_concurrent as i64,
                env!("CARGO_PKG_VERSION"),
            )
            .await
            .context("Worker registration failed")?;

        let handlers = Arc::new(JobHandlers::new(store.clone()));
        Ok(Self {
            store,
            row,
            handlers,
            max_concurrent: config.max_concurrent.max(1),
        })
    }

    /// Test seam: swap the handler set (e.g. a faked discovery pipeline).
    pub fn with_handlers(mut self, handlers: JobHandlers) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.row.worker_id
    }

    /// Run until `shutdown` fires, then drain and deregister.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        info!(worker_id = %self.row.worker_id, slots = self.max_concurrent, "worker started");

        let heartbeat = {
            let store = self.store.clone();
            let worker_id = self.row.worker_id.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                heartbeat_loop(store, worker_id, shutdown).await;
            })
        };

        self.dispatch_loop(&shutdown).await;

        // The heartbeat loop exits on the same signal.
        let _ = heartbeat.await;

        // Whatever is still leased to us after the drain deadline is dead.
        self.store
            .fail_owned_in_flight(&self.row.worker_id, "Worker shutdown")
            .await?;
        self.store
            .set_worker_status(&self.row.worker_id, WorkerStatus::Offline)
            .await?;
        info!(worker_id = %self.row.worker_id, "worker stopped");
        Ok(())
    }

    async fn dispatch_loop(&self, shutdown: &ShutdownSignal) {
        let mut handles: JoinSet<()> = JoinSet::new();
        let mut last_sweep: Option<Instant> = None;

        loop {
            if shutdown.is_signalled() {
                break;
            }

            while handles.try_join_next().is_some() {}

            let sweep_due = last_sweep
                .map_or(true, |t| t.elapsed() >= Duration::from_secs(SWEEP_INTERVAL_SECS));
            if sweep_due {
                last_sweep = Some(Instant::now());
                match self.store.recover_stale_jobs(WORKER_STALE_SECS).await {
                    Ok(report) => {
                        Metrics::inc(&METRICS.sweeps);
                        if !report.is_empty() {
                            info!(worker_id = %self.row.worker_id, ?report, "sweeper recovered leases");
                        }
                    }
                    Err(err) => {
                        error!(%err, "sweeper failed");
                        Metrics::inc(&METRICS.store_errors);
                    }
                }
            }

            let mut free = self.max_concurrent.saturating_sub(handles.len());

            // One primary lease per tick keeps ancillary floods from
            // starving scan execution.
            if free > 0 {
                match self.store.claim_primary(&self.row).await {
                    Ok(Some(job)) => {
                        Metrics::inc(&METRICS.primary_claimed);
                        free -= 1;
                        let handlers = Arc::clone(&self.handlers);
                        let store = self.store.clone();
                        let worker_id = self.row.worker_id.clone();
                        let shutdown = shutdown.clone();
                        handles.spawn(async move {
                            if let Err(err) = store.increment_job_count(&worker_id).await {
                                warn!(%err, "failed to bump worker job count");
                            }
                            handlers.run_primary(&job, &shutdown).await;
                            if let Err(err) = store.decrement_job_count(&worker_id).await {
                                warn!(%err, "failed to drop worker job count");
                            }
                        });
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(%err, "primary claim failed");
                        Metrics::inc(&METRICS.store_errors);
                    }
                }
            }

            if free > 0 {
                match self.store.claim_ancillary_batch(&self.row, free).await {
                    Ok(batch) => {
                        Metrics::add(&METRICS.ancillary_claimed, batch.len() as u64);
                        for job in batch {
                            let handlers = Arc::clone(&self.handlers);
                            handles.spawn(async move {
                                handlers.run_ancillary(&job).await;
                            });
                        }
                    }
                    Err(err) => {
                        error!(%err, "ancillary claim failed");
                        Metrics::inc(&METRICS.store_errors);
                    }
                }
            }

            tokio::select! {
                _ = shutdown.signalled() => break,
                _ = sleep(Duration::from_secs(DISPATCH_INTERVAL_SECS)) => {}
            }
        }

        // Bounded drain of in-flight handlers.
        let deadline = Duration::from_secs(SHUTDOWN_DRAIN_SECS);
        debug!(in_flight = handles.len(), "draining handlers");
        if timeout(deadline, async {
            while handles.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!(
                remaining = handles.len(),
                "drain deadline exceeded, aborting handlers"
            );
            handles.abort_all();
            while handles.join_next().await.is_some() {}
        }
    }
}

async fn heartbeat_loop(store: Store, worker_id: String, shutdown: ShutdownSignal) {
    loop {
        let delay = match store.heartbeat(&worker_id).await {
            Ok(()) => {
                Metrics::inc(&METRICS.heartbeats);
                Duration::from_secs(HEARTBEAT_INTERVAL_SECS)
            }
            Err(err) => {
                error!(%err, "heartbeat failed");
                Metrics::inc(&METRICS.store_errors);
                Duration::from_secs(HEARTBEAT_RETRY_SECS)
            }
        };
        tokio::select! {
            _ = shutdown.signalled() => return,
            _ = sleep(delay) => {}
        }
    }
}

fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let ok = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ok == 0 {
            if let Some(end) = buf.iter().position(|b| *b == 0) {
                if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                    if !name.is_empty() {
                        return name.to_string();
                    }
                }
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}
