//! Row models mapped with sqlx `FromRow`.
//!
//! Timestamps are RFC 3339 `TEXT` in the canonical store encoding; JSON
//! columns are `TEXT` decoded on demand through the typed accessors.

use dragnet_protocol::{AncillaryJobType, JobStatus, PrimaryJobType, ScanOptions, WorkerStatus};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct QueueRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub max_concurrent: i64,
    pub priority: i64,
    pub enabled: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl QueueRow {
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PrimaryJobRow {
    pub id: i64,
    pub job_uuid: String,
    pub job_type: String,
    pub status: String,
    pub priority: i64,
    pub target: String,
    pub ports: String,
    pub options: String,
    pub queue_id: i64,
    pub assigned_worker: Option<String>,
    pub scan_id: Option<i64>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub scheduled_for: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_message: Option<String>,
    pub progress: i64,
}

impl PrimaryJobRow {
    pub fn status(&self) -> JobStatus {
        self.status.parse().unwrap_or(JobStatus::Pending)
    }

    pub fn job_type(&self) -> Option<PrimaryJobType> {
        self.job_type.parse().ok()
    }

    pub fn ports(&self) -> Vec<u16> {
        serde_json::from_str(&self.ports).unwrap_or_default()
    }

    pub fn options(&self) -> ScanOptions {
        serde_json::from_str(&self.options).unwrap_or_default()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
            && matches!(self.status(), JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AncillaryJobRow {
    pub id: i64,
    pub job_uuid: String,
    pub job_type: String,
    pub status: String,
    pub priority: i64,
    pub host_ip: String,
    pub port_number: Option<i64>,
    pub protocol: String,
    pub port_id: Option<i64>,
    pub host_id: Option<i64>,
    pub primary_job_id: Option<i64>,
    pub assigned_worker: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub result_data: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub metadata: Option<String>,
}

impl AncillaryJobRow {
    pub fn status(&self) -> JobStatus {
        self.status.parse().unwrap_or(JobStatus::Pending)
    }

    pub fn job_type(&self) -> Option<AncillaryJobType> {
        self.job_type.parse().ok()
    }

    pub fn result(&self) -> serde_json::Value {
        self.result_data
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkerRow {
    pub id: i64,
    pub worker_id: String,
    pub status: String,
    pub hostname: String,
    pub pid: Option<i64>,
    pub supported_types: String,
    pub max_concurrent: i64,
    pub current_job_count: i64,
    pub last_heartbeat: String,
    pub created_at: String,
    pub version: String,
    pub metadata: Option<String>,
}

impl WorkerRow {
    pub fn status(&self) -> WorkerStatus {
        self.status.parse().unwrap_or(WorkerStatus::Offline)
    }

    pub fn supported_types(&self) -> Vec<String> {
        serde_json::from_str(&self.supported_types).unwrap_or_default()
    }

    pub fn is_available(&self) -> bool {
        matches!(self.status(), WorkerStatus::Active | WorkerStatus::Idle)
            && self.current_job_count < self.max_concurrent
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ScanRow {
    pub id: i64,
    pub scan_uuid: String,
    pub command: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: String,
    pub scan_type: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct HostRow {
    pub id: i64,
    pub ip: String,
    pub last_seen: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
    pub isp: Option<String>,
    pub organization: Option<String>,
    pub asn: Option<String>,
    pub geolocation_updated: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PortRow {
    pub id: i64,
    pub host_id: i64,
    pub port_number: i64,
    pub proto: String,
    pub status: String,
    pub last_seen: Option<String>,
    pub banner: Option<String>,
    pub scan_id: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DomainRow {
    pub id: i64,
    pub name: String,
    pub source: Option<String>,
    pub host_id: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SslCertificateRow {
    pub id: i64,
    pub fingerprint: String,
    pub pem_data: String,
    pub subject_cn: Option<String>,
    pub issuer_cn: Option<String>,
    pub valid_from: String,
    pub valid_until: String,
    pub host_id: i64,
    pub port_id: i64,
    pub created_at: String,
    pub updated_at: String,
}
