//! Queue management and the atomic claim primitives.
//!
//! Claims run inside a transaction and re-check the row's status in the
//! `UPDATE` predicate; a zero rows-affected result means another worker
//! won the race and the candidate is skipped.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use dragnet_protocol::defaults::{ANCILLARY_BATCH_SIZE, MAX_RETRIES};
use dragnet_protocol::{AncillaryJobType, JobStatus, PrimaryJobType, ScanOptions};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{AncillaryJobRow, PrimaryJobRow, QueueRow, WorkerRow};
use crate::{fmt_ts, now_ts, Store};

/// Parameters for a new primary scan job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub job_type: PrimaryJobType,
    pub target: String,
    pub queue: String,
    pub ports: Vec<u16>,
    pub options: ScanOptions,
    pub priority: i64,
    pub scheduled_for: Option<chrono::DateTime<Utc>>,
    pub max_retries: i64,
}

impl CreateJobRequest {
    pub fn new(job_type: PrimaryJobType, target: impl Into<String>) -> Self {
        Self {
            job_type,
            target: target.into(),
            queue: "default".to_string(),
            ports: Vec::new(),
            options: ScanOptions::default(),
            priority: 0,
            scheduled_for: None,
            max_retries: MAX_RETRIES,
        }
    }
}

/// Per-queue job counts.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub name: String,
    pub enabled: bool,
    pub max_concurrent: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

/// What `cleanup` removed (or would remove with `dry_run`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    pub primary: u64,
    pub ancillary: u64,
}

/// Render enum values as a SQL IN-list. Inputs are `as_str()` values of
/// closed enums, never raw user text.
fn sql_in_list(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(",")
}

const NON_TERMINAL: &[&str] = &["pending", "queued", "running", "retrying"];

impl Store {
    /// Get or create a queue by name with engine defaults.
    pub async fn ensure_queue(&self, name: &str) -> Result<QueueRow> {
        if let Some(queue) = sqlx::query_as::<_, QueueRow>("SELECT * FROM queues WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?
        {
            return Ok(queue);
        }

        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO queues (name, description, max_concurrent, priority, enabled, created_at, updated_at)
            VALUES (?, ?, 5, 0, 1, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(format!("Default queue for {name}"))
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;

        sqlx::query_as::<_, QueueRow>("SELECT * FROM queues WHERE name = ?")
            .bind(name)
            .fetch_one(self.pool())
            .await
            .context("Queue vanished after insert")
    }

    /// Seed the standard queue set.
    pub async fn setup_default_queues(&self) -> Result<Vec<QueueRow>> {
        let seeds: &[(&str, &str, i64, i64)] = &[
            ("default", "Default queue for scanner jobs", 5, 0),
            ("high_priority", "High priority queue for urgent scanner jobs", 3, 10),
            ("low_priority", "Low priority queue for background scanner jobs", 2, 1),
        ];

        let mut queues = Vec::with_capacity(seeds.len());
        for (name, description, max_concurrent, priority) in seeds {
            let now = now_ts();
            sqlx::query(
                r#"
                INSERT INTO queues (name, description, max_concurrent, priority, enabled, created_at, updated_at)
                VALUES (?, ?, ?, ?, 1, ?, ?)
                ON CONFLICT(name) DO NOTHING
                "#,
            )
            .bind(name)
            .bind(description)
            .bind(max_concurrent)
            .bind(priority)
            .bind(&now)
            .bind(&now)
            .execute(self.pool())
            .await?;

            queues.push(
                sqlx::query_as::<_, QueueRow>("SELECT * FROM queues WHERE name = ?")
                    .bind(name)
                    .fetch_one(self.pool())
                    .await?,
            );
        }
        Ok(queues)
    }

    /// Insert a new pending primary job, auto-creating its queue.
    pub async fn create_primary_job(&self, req: CreateJobRequest) -> Result<PrimaryJobRow> {
        let queue = self.ensure_queue(&req.queue).await?;
        let job_uuid = Uuid::new_v4().to_string();
        let now = now_ts();

        sqlx::query(
            r#"
            INSERT INTO primary_jobs
                (job_uuid, job_type, status, priority, target, ports, options,
                 queue_id, created_at, scheduled_for, retry_count, max_retries, progress)
            VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, 0, ?, 0)
            "#,
        )
        .bind(&job_uuid)
        .bind(req.job_type.as_str())
        .bind(req.priority)
        .bind(&req.target)
        .bind(serde_json::to_string(&req.ports)?)
        .bind(serde_json::to_string(&req.options)?)
        .bind(queue.id)
        .bind(&now)
        .bind(req.scheduled_for.map(fmt_ts))
        .bind(req.max_retries)
        .execute(self.pool())
        .await?;

        let job = self
            .primary_by_uuid(&job_uuid)
            .await?
            .context("Job vanished after insert")?;
        info!(
            job_uuid = %job.job_uuid,
            job_type = %job.job_type,
            target = %job.target,
            "created job"
        );
        Ok(job)
    }

    pub async fn primary_by_uuid(&self, job_uuid: &str) -> Result<Option<PrimaryJobRow>> {
        Ok(
            sqlx::query_as::<_, PrimaryJobRow>("SELECT * FROM primary_jobs WHERE job_uuid = ?")
                .bind(job_uuid)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn primary_by_id(&self, id: i64) -> Result<Option<PrimaryJobRow>> {
        Ok(
            sqlx::query_as::<_, PrimaryJobRow>("SELECT * FROM primary_jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn ancillary_by_uuid(&self, job_uuid: &str) -> Result<Option<AncillaryJobRow>> {
        Ok(
            sqlx::query_as::<_, AncillaryJobRow>("SELECT * FROM ancillary_jobs WHERE job_uuid = ?")
                .bind(job_uuid)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn ancillary_by_id(&self, id: i64) -> Result<Option<AncillaryJobRow>> {
        Ok(
            sqlx::query_as::<_, AncillaryJobRow>("SELECT * FROM ancillary_jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Claim the next primary job for this worker, walking enabled queues
    /// in descending priority. Skips queues whose in-flight count for this
    /// worker has reached the queue cap.
    pub async fn claim_primary(&self, worker: &WorkerRow) -> Result<Option<PrimaryJobRow>> {
        let supported: Vec<&'static str> = worker
            .supported_types()
            .iter()
            .filter_map(|t| t.parse::<PrimaryJobType>().ok())
            .map(|t| t.as_str())
            .collect();
        if supported.is_empty() {
            return Ok(None);
        }
        let type_list = sql_in_list(&supported);

        let queues = sqlx::query_as::<_, QueueRow>(
            "SELECT * FROM queues WHERE enabled = 1 ORDER BY priority DESC, name ASC",
        )
        .fetch_all(self.pool())
        .await?;

        let now = now_ts();
        for queue in queues {
            let mut tx = self.pool().begin().await?;

            let in_flight: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM primary_jobs
                WHERE queue_id = ? AND status IN ('queued', 'running') AND assigned_worker = ?
                "#,
            )
            .bind(queue.id)
            .bind(&worker.worker_id)
            .fetch_one(&mut *tx)
            .await?;

            if in_flight >= queue.max_concurrent {
                tx.commit().await?;
                continue;
            }

            let candidate: Option<i64> = sqlx::query_scalar(&format!(
                r#"
                SELECT id FROM primary_jobs
                WHERE queue_id = ? AND status = 'pending' AND job_type IN ({type_list})
                  AND (scheduled_for IS NULL OR scheduled_for <= ?)
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                "#
            ))
            .bind(queue.id)
            .bind(&now)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(job_id) = candidate else {
                tx.commit().await?;
                continue;
            };

            let claimed = sqlx::query(
                r#"
                UPDATE primary_jobs
                SET status = 'queued', assigned_worker = ?
                WHERE id = ? AND status = 'pending'
                "#,
            )
            .bind(&worker.worker_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if claimed == 0 {
                // Another worker got there first.
                tx.commit().await?;
                continue;
            }

            let job = sqlx::query_as::<_, PrimaryJobRow>("SELECT * FROM primary_jobs WHERE id = ?")
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;

            debug!(job_uuid = %job.job_uuid, queue = %queue.name, "claimed primary job");
            return Ok(Some(job));
        }

        Ok(None)
    }

    /// Claim up to `max_jobs` ancillary jobs, honoring the fixed type
    /// priority first and backfilling from any supported type. Claimed
    /// rows transition straight to `running`.
    pub async fn claim_ancillary_batch(
        &self,
        worker: &WorkerRow,
        max_jobs: usize,
    ) -> Result<Vec<AncillaryJobRow>> {
        let supported: Vec<AncillaryJobType> = worker
            .supported_types()
            .iter()
            .filter_map(|t| t.parse::<AncillaryJobType>().ok())
            .collect();
        if supported.is_empty() || max_jobs == 0 {
            return Ok(Vec::new());
        }

        let batch_size = max_jobs.min(ANCILLARY_BATCH_SIZE);
        let mut selected = Vec::with_capacity(batch_size);
        let mut tx = self.pool().begin().await?;

        for job_type in AncillaryJobType::CLAIM_ORDER {
            if selected.len() >= batch_size {
                break;
            }
            if !supported.contains(job_type) {
                continue;
            }
            let needed = batch_size - selected.len();
            let claimed = claim_ancillary_of(
                &mut tx,
                &worker.worker_id,
                &format!("job_type = '{}'", job_type.as_str()),
                needed,
            )
            .await?;
            selected.extend(claimed);
        }

        if selected.len() < batch_size {
            let type_list = sql_in_list(
                &supported.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            );
            let needed = batch_size - selected.len();
            let claimed = claim_ancillary_of(
                &mut tx,
                &worker.worker_id,
                &format!("job_type IN ({type_list})"),
                needed,
            )
            .await?;
            selected.extend(claimed);
        }

        tx.commit().await?;

        if !selected.is_empty() {
            debug!(count = selected.len(), "claimed ancillary batch");
        }
        Ok(selected)
    }

    // ------------------------------------------------------------------
    // Lifecycle transitions
    // ------------------------------------------------------------------

    /// Transition a leased job to `running`. Returns false when the row
    /// was cancelled (or swept) in the meantime; the caller must not run
    /// it.
    pub async fn mark_primary_started(&self, id: i64) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE primary_jobs
            SET status = 'running', started_at = ?
            WHERE id = ? AND status IN ('queued', 'pending')
            "#,
        )
        .bind(now_ts())
        .bind(id)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn mark_primary_completed(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE primary_jobs SET status = 'completed', completed_at = ?, progress = 100 WHERE id = ?",
        )
        .bind(now_ts())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_primary_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE primary_jobs SET status = 'failed', completed_at = ?, error_message = ? WHERE id = ?",
        )
        .bind(now_ts())
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_primary_progress(&self, id: i64, progress: i64) -> Result<()> {
        sqlx::query("UPDATE primary_jobs SET progress = ? WHERE id = ?")
            .bind(progress.clamp(0, 100))
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn attach_scan(&self, job_id: i64, scan_id: i64) -> Result<()> {
        sqlx::query("UPDATE primary_jobs SET scan_id = ? WHERE id = ?")
            .bind(scan_id)
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_ancillary_completed(
        &self,
        id: i64,
        result: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE ancillary_jobs SET status = 'completed', completed_at = ?, result_data = ? WHERE id = ?",
        )
        .bind(now_ts())
        .bind(serde_json::to_string(result)?)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_ancillary_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE ancillary_jobs SET status = 'failed', completed_at = ?, error_message = ? WHERE id = ?",
        )
        .bind(now_ts())
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Cancel a job by uuid. Primary jobs are tried first, then ancillary.
    /// Only `pending|queued|running` rows can be cancelled.
    pub async fn cancel_job(&self, job_uuid: &str) -> Result<bool> {
        let now = now_ts();
        let cancelled = sqlx::query(
            r#"
            UPDATE primary_jobs
            SET status = 'cancelled', completed_at = ?
            WHERE job_uuid = ? AND status IN ('pending', 'queued', 'running')
            "#,
        )
        .bind(&now)
        .bind(job_uuid)
        .execute(self.pool())
        .await?
        .rows_affected();

        if cancelled > 0 {
            info!(job_uuid, "cancelled primary job");
            return Ok(true);
        }

        let cancelled = sqlx::query(
            r#"
            UPDATE ancillary_jobs
            SET status = 'cancelled', completed_at = ?
            WHERE job_uuid = ? AND status IN ('pending', 'queued', 'running')
            "#,
        )
        .bind(&now)
        .bind(job_uuid)
        .execute(self.pool())
        .await?
        .rows_affected();

        if cancelled > 0 {
            info!(job_uuid, "cancelled ancillary job");
        }
        Ok(cancelled > 0)
    }

    /// Latest status of a job row, for cancellation checkpoints.
    pub async fn primary_status(&self, id: i64) -> Result<Option<JobStatus>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT status FROM primary_jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    pub async fn ancillary_status(&self, id: i64) -> Result<Option<JobStatus>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT status FROM ancillary_jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    // ------------------------------------------------------------------
    // Listings and maintenance
    // ------------------------------------------------------------------

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        queue: Option<&str>,
        limit: i64,
    ) -> Result<Vec<PrimaryJobRow>> {
        let mut sql = String::from(
            r#"
            SELECT j.* FROM primary_jobs j
            JOIN queues q ON q.id = j.queue_id
            WHERE 1 = 1
            "#,
        );
        if status.is_some() {
            sql.push_str(" AND j.status = ?");
        }
        if queue.is_some() {
            sql.push_str(" AND q.name = ?");
        }
        sql.push_str(" ORDER BY j.created_at DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, PrimaryJobRow>(&sql);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        if let Some(queue) = queue {
            query = query.bind(queue);
        }
        query = query.bind(limit);

        Ok(query.fetch_all(self.pool()).await?)
    }

    pub async fn queue_stats(&self, name: Option<&str>) -> Result<Vec<QueueStats>> {
        let queues = match name {
            Some(name) => {
                sqlx::query_as::<_, QueueRow>("SELECT * FROM queues WHERE name = ?")
                    .bind(name)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query_as::<_, QueueRow>("SELECT * FROM queues ORDER BY priority DESC, name")
                    .fetch_all(self.pool())
                    .await?
            }
        };

        let mut stats = Vec::with_capacity(queues.len());
        for queue in queues {
            stats.push(QueueStats {
                name: queue.name.clone(),
                enabled: queue.is_enabled(),
                max_concurrent: queue.max_concurrent,
                pending: self.count_in_queue(queue.id, "pending").await?,
                running: self.count_in_queue(queue.id, "running").await?,
                completed: self.count_in_queue(queue.id, "completed").await?,
                failed: self.count_in_queue(queue.id, "failed").await?,
            });
        }
        Ok(stats)
    }

    async fn count_in_queue(&self, queue_id: i64, status: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM primary_jobs WHERE queue_id = ? AND status = ?",
        )
        .bind(queue_id)
        .bind(status)
        .fetch_one(self.pool())
        .await?)
    }

    /// Remove terminal jobs older than `days`. With `dry_run` only counts.
    pub async fn cleanup(&self, days: i64, dry_run: bool) -> Result<CleanupReport> {
        let cutoff = fmt_ts(Utc::now() - Duration::days(days));
        let terminal = sql_in_list(&["completed", "failed", "cancelled"]);

        let primary: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM primary_jobs WHERE status IN ({terminal}) AND completed_at < ?"
        ))
        .bind(&cutoff)
        .fetch_one(self.pool())
        .await?;
        let ancillary: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM ancillary_jobs WHERE status IN ({terminal}) AND completed_at < ?"
        ))
        .bind(&cutoff)
        .fetch_one(self.pool())
        .await?;

        if !dry_run {
            sqlx::query(&format!(
                "DELETE FROM ancillary_jobs WHERE status IN ({terminal}) AND completed_at < ?"
            ))
            .bind(&cutoff)
            .execute(self.pool())
            .await?;
            sqlx::query(&format!(
                "DELETE FROM primary_jobs WHERE status IN ({terminal}) AND completed_at < ?"
            ))
            .bind(&cutoff)
            .execute(self.pool())
            .await?;
            info!(primary, ancillary, days, "cleaned up old jobs");
        }

        Ok(CleanupReport {
            primary: primary as u64,
            ancillary: ancillary as u64,
        })
    }
}

/// Claim up to `needed` pending ancillary jobs matching `predicate`,
/// transitioning each to `running` inside the caller's transaction.
async fn claim_ancillary_of(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    worker_id: &str,
    predicate: &str,
    needed: usize,
) -> Result<Vec<AncillaryJobRow>> {
    let ids: Vec<i64> = sqlx::query_scalar(&format!(
        r#"
        SELECT id FROM ancillary_jobs
        WHERE status = 'pending' AND {predicate}
        ORDER BY priority DESC, created_at ASC
        LIMIT ?
        "#
    ))
    .bind(needed as i64)
    .fetch_all(&mut **tx)
    .await?;

    let now = now_ts();
    let mut claimed = Vec::with_capacity(ids.len());
    for id in ids {
        let updated = sqlx::query(
            r#"
            UPDATE ancillary_jobs
            SET status = 'running', assigned_worker = ?, started_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(worker_id)
        .bind(&now)
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if updated == 0 {
            continue;
        }
        claimed.push(
            sqlx::query_as::<_, AncillaryJobRow>("SELECT * FROM ancillary_jobs WHERE id = ?")
                .bind(id)
                .fetch_one(&mut **tx)
                .await?,
        );
    }
    Ok(claimed)
}

/// SQL predicate fragment matching non-terminal statuses.
pub(crate) fn non_terminal_predicate() -> String {
    format!("status IN ({})", sql_in_list(NON_TERMINAL))
}
