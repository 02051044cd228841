//! Worker registration, heartbeats and crash recovery.
//!
//! Liveness is inferred from `last_heartbeat` alone: any peer can run the
//! sweeper and roll a crashed worker's leases back to `pending`.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use dragnet_protocol::WorkerStatus;
use tracing::{info, warn};

use crate::models::WorkerRow;
use crate::{fmt_ts, now_ts, Store};

/// Result of one sweeper pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub requeued_primary: u64,
    pub failed_primary: u64,
    pub requeued_ancillary: u64,
    pub failed_ancillary: u64,
    pub offline_workers: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued_primary == 0
            && self.failed_primary == 0
            && self.requeued_ancillary == 0
            && self.failed_ancillary == 0
            && self.offline_workers == 0
    }
}

impl Store {
    /// Register (or refresh) a worker row and mark it active.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        hostname: &str,
        pid: u32,
        supported_types: &[String],
        max_concurrent: i64,
        version: &str,
    ) -> Result<WorkerRow> {
        let now = now_ts();
        let types_json = serde_json::to_string(supported_types)?;
        sqlx::query(
            r#"
            INSERT INTO workers
                (worker_id, status, hostname, pid, supported_types, max_concurrent,
                 current_job_count, last_heartbeat, created_at, version)
            VALUES (?, 'active', ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(worker_id) DO UPDATE SET
                status = 'active',
                hostname = excluded.hostname,
                pid = excluded.pid,
                supported_types = excluded.supported_types,
                max_concurrent = excluded.max_concurrent,
                last_heartbeat = excluded.last_heartbeat,
                version = excluded.version
            "#,
        )
        .bind(worker_id)
        .bind(hostname)
        .bind(pid as i64)
        .bind(&types_json)
        .bind(max_concurrent)
        .bind(&now)
        .bind(&now)
        .bind(version)
        .execute(self.pool())
        .await?;

        let worker = self
            .worker_by_id(worker_id)
            .await?
            .context("Worker vanished after registration")?;
        info!(worker_id, hostname, max_concurrent, "registered worker");
        Ok(worker)
    }

    pub async fn worker_by_id(&self, worker_id: &str) -> Result<Option<WorkerRow>> {
        Ok(
            sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE worker_id = ?")
                .bind(worker_id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        sqlx::query("UPDATE workers SET last_heartbeat = ? WHERE worker_id = ?")
            .bind(now_ts())
            .bind(worker_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Bump the in-flight count; the worker reads busy while any slot is
    /// occupied.
    pub async fn increment_job_count(&self, worker_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workers
            SET current_job_count = current_job_count + 1, status = 'busy'
            WHERE worker_id = ?
            "#,
        )
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn decrement_job_count(&self, worker_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workers
            SET current_job_count = MAX(0, current_job_count - 1),
                status = CASE WHEN current_job_count - 1 > 0 THEN 'busy' ELSE 'idle' END
            WHERE worker_id = ?
            "#,
        )
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_worker_status(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        sqlx::query("UPDATE workers SET status = ? WHERE worker_id = ?")
            .bind(status.as_str())
            .bind(worker_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRow>> {
        Ok(
            sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers ORDER BY last_heartbeat DESC")
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// Shutdown path: everything this worker still owns in flight is
    /// failed with the given reason.
    pub async fn fail_owned_in_flight(&self, worker_id: &str, reason: &str) -> Result<u64> {
        let now = now_ts();
        let mut failed = 0;
        for table in ["primary_jobs", "ancillary_jobs"] {
            failed += sqlx::query(&format!(
                r#"
                UPDATE {table}
                SET status = 'failed', error_message = ?, completed_at = ?
                WHERE assigned_worker = ? AND status IN ('queued', 'running')
                "#
            ))
            .bind(reason)
            .bind(&now)
            .bind(worker_id)
            .execute(self.pool())
            .await?
            .rows_affected();
        }
        if failed > 0 {
            warn!(worker_id, failed, reason, "failed in-flight jobs");
        }
        Ok(failed)
    }

    /// Roll leases held by crashed workers back to `pending`.
    ///
    /// A job that was `running` consumes one retry; one that would exceed
    /// its budget is failed with "exhausted retries" instead. `queued`
    /// rows revert free of charge. Stale workers flip to offline.
    pub async fn recover_stale_jobs(&self, stale_secs: i64) -> Result<SweepReport> {
        let cutoff = fmt_ts(Utc::now() - Duration::seconds(stale_secs));
        let now = now_ts();
        let mut report = SweepReport::default();
        let mut tx = self.pool().begin().await?;

        for (table, requeued, failed) in [
            (
                "primary_jobs",
                &mut report.requeued_primary,
                &mut report.failed_primary,
            ),
            (
                "ancillary_jobs",
                &mut report.requeued_ancillary,
                &mut report.failed_ancillary,
            ),
        ] {
            // Leases whose worker stopped heartbeating, or whose worker
            // row no longer exists at all.
            let orphans: Vec<(i64, String, i64, i64)> = sqlx::query_as(&format!(
                r#"
                SELECT j.id, j.status, j.retry_count, j.max_retries
                FROM {table} j
                LEFT JOIN workers w ON w.worker_id = j.assigned_worker
                WHERE j.status IN ('queued', 'running')
                  AND j.assigned_worker IS NOT NULL
                  AND (w.worker_id IS NULL OR w.last_heartbeat < ?)
                "#
            ))
            .bind(&cutoff)
            .fetch_all(&mut *tx)
            .await?;

            for (id, status, retry_count, max_retries) in orphans {
                let was_running = status == "running";
                if was_running && retry_count + 1 > max_retries {
                    sqlx::query(&format!(
                        r#"
                        UPDATE {table}
                        SET status = 'failed', error_message = 'exhausted retries',
                            completed_at = ?, assigned_worker = NULL,
                            retry_count = retry_count + 1
                        WHERE id = ?
                        "#
                    ))
                    .bind(&now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    *failed += 1;
                } else {
                    let bump = if was_running { 1 } else { 0 };
                    sqlx::query(&format!(
                        r#"
                        UPDATE {table}
                        SET status = 'pending', assigned_worker = NULL,
                            started_at = NULL, retry_count = retry_count + ?
                        WHERE id = ?
                        "#
                    ))
                    .bind(bump)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    *requeued += 1;
                }
            }
        }

        report.offline_workers = sqlx::query(
            r#"
            UPDATE workers
            SET status = 'offline', current_job_count = 0
            WHERE last_heartbeat < ? AND status != 'offline'
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if !report.is_empty() {
            info!(
                requeued = report.requeued_primary + report.requeued_ancillary,
                failed = report.failed_primary + report.failed_ancillary,
                offline = report.offline_workers,
                "swept stale leases"
            );
        }
        Ok(report)
    }
}
