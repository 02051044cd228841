//! Schema bootstrap.
//!
//! `CREATE TABLE IF NOT EXISTS` statements applied at open time. SQLite
//! enforces the uniqueness constraints the engine's idempotency rests on:
//! `queues.name`, job uuids, `workers.worker_id`, `hosts.ip`,
//! `ports(host_id, port_number, proto)`, `domains(name, host_id)` and
//! `ssl_certificates.fingerprint`.

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queues (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        max_concurrent INTEGER NOT NULL DEFAULT 5,
        priority INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_uuid TEXT NOT NULL UNIQUE,
        command TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        status TEXT NOT NULL DEFAULT 'running',
        scan_type TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hosts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ip TEXT NOT NULL UNIQUE,
        last_seen TEXT,
        country TEXT,
        country_code TEXT,
        region TEXT,
        city TEXT,
        latitude REAL,
        longitude REAL,
        timezone TEXT,
        isp TEXT,
        organization TEXT,
        asn TEXT,
        geolocation_updated TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        host_id INTEGER NOT NULL REFERENCES hosts(id),
        port_number INTEGER NOT NULL,
        proto TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        last_seen TEXT,
        banner TEXT,
        scan_id INTEGER REFERENCES scans(id),
        UNIQUE(host_id, port_number, proto)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS primary_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_uuid TEXT NOT NULL UNIQUE,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        priority INTEGER NOT NULL DEFAULT 0,
        target TEXT NOT NULL,
        ports TEXT NOT NULL DEFAULT '[]',
        options TEXT NOT NULL DEFAULT '{}',
        queue_id INTEGER NOT NULL REFERENCES queues(id),
        assigned_worker TEXT,
        scan_id INTEGER REFERENCES scans(id),
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        scheduled_for TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        error_message TEXT,
        progress INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ancillary_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_uuid TEXT NOT NULL UNIQUE,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        priority INTEGER NOT NULL DEFAULT 0,
        host_ip TEXT NOT NULL,
        port_number INTEGER,
        protocol TEXT NOT NULL DEFAULT 'tcp',
        port_id INTEGER REFERENCES ports(id),
        host_id INTEGER REFERENCES hosts(id),
        primary_job_id INTEGER REFERENCES primary_jobs(id),
        assigned_worker TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        result_data TEXT,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        metadata TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        worker_id TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL DEFAULT 'idle',
        hostname TEXT NOT NULL,
        pid INTEGER,
        supported_types TEXT NOT NULL DEFAULT '[]',
        max_concurrent INTEGER NOT NULL DEFAULT 1,
        current_job_count INTEGER NOT NULL DEFAULT 0,
        last_heartbeat TEXT NOT NULL,
        created_at TEXT NOT NULL,
        version TEXT NOT NULL DEFAULT '',
        metadata TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS domains (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        source TEXT,
        host_id INTEGER NOT NULL REFERENCES hosts(id),
        UNIQUE(name, host_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ssl_certificates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint TEXT NOT NULL UNIQUE,
        pem_data TEXT NOT NULL DEFAULT '',
        subject_cn TEXT,
        issuer_cn TEXT,
        valid_from TEXT NOT NULL DEFAULT '',
        valid_until TEXT NOT NULL DEFAULT '',
        host_id INTEGER NOT NULL REFERENCES hosts(id),
        port_id INTEGER NOT NULL REFERENCES ports(id),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_primary_jobs_status ON primary_jobs(status)",
    "CREATE INDEX IF NOT EXISTS idx_primary_jobs_queue_status ON primary_jobs(queue_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_primary_jobs_worker ON primary_jobs(assigned_worker)",
    "CREATE INDEX IF NOT EXISTS idx_primary_jobs_scheduled ON primary_jobs(scheduled_for)",
    "CREATE INDEX IF NOT EXISTS idx_ancillary_jobs_status ON ancillary_jobs(status)",
    "CREATE INDEX IF NOT EXISTS idx_ancillary_jobs_type_status ON ancillary_jobs(job_type, status)",
    "CREATE INDEX IF NOT EXISTS idx_ancillary_jobs_host_port ON ancillary_jobs(host_ip, port_number)",
    "CREATE INDEX IF NOT EXISTS idx_ancillary_jobs_worker ON ancillary_jobs(assigned_worker)",
    "CREATE INDEX IF NOT EXISTS idx_workers_heartbeat ON workers(last_heartbeat)",
    "CREATE INDEX IF NOT EXISTS idx_hosts_geo_updated ON hosts(geolocation_updated)",
    "CREATE INDEX IF NOT EXISTS idx_ports_host ON ports(host_id)",
    "CREATE INDEX IF NOT EXISTS idx_domains_host ON domains(host_id)",
    "CREATE INDEX IF NOT EXISTS idx_ssl_certificates_host ON ssl_certificates(host_id)",
];

/// Apply the schema to a freshly opened pool. Idempotent.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA.iter().chain(INDEXES) {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("Schema statement failed: {}", stmt.trim().lines().next().unwrap_or("")))?;
    }
    Ok(())
}
