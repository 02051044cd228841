//! Aggregate queries backing the metrics exposition text.

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::{fmt_ts, Store};

/// Point-in-time aggregate of engine state.
#[derive(Debug, Clone, Default)]
pub struct MetricsReport {
    /// (status, count) for primary jobs.
    pub primary_by_status: Vec<(String, i64)>,
    /// (job_type, status, count) for ancillary jobs.
    pub ancillary_by_status: Vec<(String, String, i64)>,
    /// (status, count) for workers.
    pub workers_by_status: Vec<(String, i64)>,
    /// (queue, pending depth).
    pub queue_depth: Vec<(String, i64)>,
    pub hosts_total: i64,
    pub hosts_last_hour: i64,
    pub ports_total: i64,
    pub ports_last_hour: i64,
    pub domains_total: i64,
    pub certificates_total: i64,
    pub primary_errors: i64,
    pub primary_cancelled: i64,
    /// (job_uuid, progress) for running primary jobs.
    pub running_progress: Vec<(String, i64)>,
}

impl Store {
    pub async fn metrics_snapshot(&self) -> Result<MetricsReport> {
        let hour_ago = fmt_ts(Utc::now() - Duration::hours(1));

        let primary_by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM primary_jobs GROUP BY status ORDER BY status",
        )
        .fetch_all(self.pool())
        .await?;

        let ancillary_by_status: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT job_type, status, COUNT(*) FROM ancillary_jobs GROUP BY job_type, status ORDER BY job_type, status",
        )
        .fetch_all(self.pool())
        .await?;

        let workers_by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM workers GROUP BY status ORDER BY status")
                .fetch_all(self.pool())
                .await?;

        let queue_depth: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT q.name, COUNT(j.id)
            FROM queues q
            LEFT JOIN primary_jobs j ON j.queue_id = q.id AND j.status = 'pending'
            GROUP BY q.name ORDER BY q.name
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let scalar = |sql: &'static str| async move {
            sqlx::query_scalar::<_, i64>(sql).fetch_one(self.pool()).await
        };

        let hosts_total = scalar("SELECT COUNT(*) FROM hosts").await?;
        let ports_total = scalar("SELECT COUNT(*) FROM ports").await?;
        let domains_total = scalar("SELECT COUNT(*) FROM domains").await?;
        let certificates_total = scalar("SELECT COUNT(*) FROM ssl_certificates").await?;
        let primary_errors =
            scalar("SELECT COUNT(*) FROM primary_jobs WHERE status = 'failed'").await?;
        let primary_cancelled =
            scalar("SELECT COUNT(*) FROM primary_jobs WHERE status = 'cancelled'").await?;

        let hosts_last_hour: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM hosts WHERE last_seen >= ?")
                .bind(&hour_ago)
                .fetch_one(self.pool())
                .await?;
        let ports_last_hour: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ports WHERE last_seen >= ?")
                .bind(&hour_ago)
                .fetch_one(self.pool())
                .await?;

        let running_progress: Vec<(String, i64)> = sqlx::query_as(
            "SELECT job_uuid, progress FROM primary_jobs WHERE status = 'running' ORDER BY job_uuid",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(MetricsReport {
            primary_by_status,
            ancillary_by_status,
            workers_by_status,
            queue_depth,
            hosts_total,
            hosts_last_hour,
            ports_total,
            ports_last_hour,
            domains_total,
            certificates_total,
            primary_errors,
            primary_cancelled,
            running_progress,
        })
    }
}
