//! Durable store for the Dragnet reconnaissance engine.
//!
//! SQLite via sqlx. The store is the only state shared between workers:
//! queues, jobs, worker registrations, scans and everything the discovery
//! pipeline produces. All multi-row transitions (claims, discovery
//! upserts + fan-out) run inside a single transaction, and claims use the
//! `UPDATE ... WHERE id = ? AND status = ?` / rows-affected pattern so a
//! row is never leased twice.

pub mod discovery;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod schema;
pub mod workers;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

pub use discovery::{CertificateRecord, DiscoveryOutcome, GeoRecord};
pub use metrics::MetricsReport;
pub use models::*;
pub use queue::{CleanupReport, CreateJobRequest, QueueStats};
pub use workers::SweepReport;

/// Outcome of an upsert-style write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

impl UpsertOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, UpsertOutcome::Created)
    }
}

/// Handle to the durable store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (and migrate) the store at the given sqlx SQLite URL.
    pub async fn open(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .with_context(|| format!("Failed to open database: {url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory store. A single connection keeps the database
    /// alive for the pool's lifetime.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        schema::ensure_schema(&self.pool).await
    }
}

/// Canonical timestamp encoding for every column in the store.
///
/// Fixed microsecond precision keeps lexicographic ordering consistent
/// with chronological ordering, which the scheduler's string comparisons
/// rely on.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in the store's canonical encoding.
pub fn now_ts() -> String {
    fmt_ts(Utc::now())
}

/// Parse a stored timestamp back into a `DateTime<Utc>`.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid stored timestamp: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn timestamp_ordering_is_lexicographic() {
        let base = Utc::now();
        let earlier = fmt_ts(base - Duration::seconds(1));
        let later = fmt_ts(base + Duration::milliseconds(1));
        assert!(earlier < later);
        assert!(parse_ts(&earlier).unwrap() < parse_ts(&later).unwrap());
    }
}
