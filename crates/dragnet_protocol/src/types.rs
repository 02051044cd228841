//! Canonical enums and option structs used across all crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown job status: {0}")]
    UnknownStatus(String),
    #[error("unknown job type: {0}")]
    UnknownJobType(String),
    #[error("unknown worker status: {0}")]
    UnknownWorkerStatus(String),
}

/// Lifecycle status shared by primary and ancillary jobs.
///
/// `pending -> queued -> running -> (completed | failed | cancelled)`,
/// with `retrying` as the transient state the sweeper moves a job through
/// on its way back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
        }
    }

    /// Terminal states never transition again (except via explicit retry).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States that count against a queue's concurrency cap.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "retrying" => Ok(JobStatus::Retrying),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

/// Top-level scan job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryJobType {
    Masscan,
    Nmap,
    Custom,
}

impl PrimaryJobType {
    pub const ALL: &'static [PrimaryJobType] = &[
        PrimaryJobType::Masscan,
        PrimaryJobType::Nmap,
        PrimaryJobType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrimaryJobType::Masscan => "masscan",
            PrimaryJobType::Nmap => "nmap",
            PrimaryJobType::Custom => "custom",
        }
    }
}

impl fmt::Display for PrimaryJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PrimaryJobType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "masscan" => Ok(PrimaryJobType::Masscan),
            "nmap" => Ok(PrimaryJobType::Nmap),
            "custom" => Ok(PrimaryJobType::Custom),
            other => Err(ProtocolError::UnknownJobType(other.to_string())),
        }
    }
}

/// Post-discovery follow-up job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AncillaryJobType {
    BannerGrab,
    DomainEnum,
    SslCert,
    Geolocation,
    ServiceDetection,
    VulnerabilityScan,
}

impl AncillaryJobType {
    pub const ALL: &'static [AncillaryJobType] = &[
        AncillaryJobType::BannerGrab,
        AncillaryJobType::DomainEnum,
        AncillaryJobType::SslCert,
        AncillaryJobType::Geolocation,
        AncillaryJobType::ServiceDetection,
        AncillaryJobType::VulnerabilityScan,
    ];

    /// Claim order within an ancillary batch. SSL work is highest value,
    /// banner grabs are the bulk, domain enumeration drains last.
    pub const CLAIM_ORDER: &'static [AncillaryJobType] = &[
        AncillaryJobType::SslCert,
        AncillaryJobType::BannerGrab,
        AncillaryJobType::DomainEnum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AncillaryJobType::BannerGrab => "banner_grab",
            AncillaryJobType::DomainEnum => "domain_enum",
            AncillaryJobType::SslCert => "ssl_cert",
            AncillaryJobType::Geolocation => "geolocation",
            AncillaryJobType::ServiceDetection => "service_detection",
            AncillaryJobType::VulnerabilityScan => "vulnerability_scan",
        }
    }

    /// Whether jobs of this type target a specific port (as opposed to
    /// being host-level).
    pub fn is_port_scoped(&self) -> bool {
        matches!(
            self,
            AncillaryJobType::BannerGrab
                | AncillaryJobType::SslCert
                | AncillaryJobType::ServiceDetection
                | AncillaryJobType::VulnerabilityScan
        )
    }
}

impl fmt::Display for AncillaryJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AncillaryJobType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "banner_grab" => Ok(AncillaryJobType::BannerGrab),
            "domain_enum" => Ok(AncillaryJobType::DomainEnum),
            "ssl_cert" => Ok(AncillaryJobType::SslCert),
            "geolocation" => Ok(AncillaryJobType::Geolocation),
            "service_detection" => Ok(AncillaryJobType::ServiceDetection),
            "vulnerability_scan" => Ok(AncillaryJobType::VulnerabilityScan),
            other => Err(ProtocolError::UnknownJobType(other.to_string())),
        }
    }
}

/// Worker registration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Idle,
    Busy,
    Offline,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            "offline" => Ok(WorkerStatus::Offline),
            "error" => Ok(WorkerStatus::Error),
            other => Err(ProtocolError::UnknownWorkerStatus(other.to_string())),
        }
    }
}

/// Options attached to a primary scan job.
///
/// Serialized into the job row's `options` column; unknown keys are
/// preserved by serde_json round-trips on the storage side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// SYN scan (`-sS`). On unless explicitly disabled.
    pub syn: bool,
    /// TCP connect scan (`-sT`).
    pub tcp: bool,
    /// UDP scan (`-sU`).
    pub udp: bool,
    /// Both TCP and UDP in one pass.
    pub tcp_udp: bool,
    /// Prefix the command with proxychains.
    pub use_proxychains: bool,
    /// Packets per second. None means the engine default.
    pub rate: Option<u64>,
    /// Resume a previously interrupted scan.
    pub resume: bool,
    /// Scan the full 1-65535 range instead of the curated list.
    pub all_ports: bool,
    /// Wall-clock budget for the subprocess, seconds.
    pub timeout: Option<u64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            syn: true,
            tcp: false,
            udp: false,
            tcp_udp: false,
            use_proxychains: false,
            rate: None,
            resume: false,
            all_ports: false,
            timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), *status);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn ancillary_type_strings() {
        assert_eq!(
            "ssl_cert".parse::<AncillaryJobType>().unwrap(),
            AncillaryJobType::SslCert
        );
        assert!(AncillaryJobType::SslCert.is_port_scoped());
        assert!(!AncillaryJobType::DomainEnum.is_port_scoped());
        assert!(!AncillaryJobType::Geolocation.is_port_scoped());
    }

    #[test]
    fn scan_options_default_is_syn() {
        let opts = ScanOptions::default();
        assert!(opts.syn);
        assert!(!opts.udp);
        assert!(opts.rate.is_none());
    }

    #[test]
    fn scan_options_tolerates_partial_json() {
        let opts: ScanOptions = serde_json::from_str(r#"{"rate": 100, "timeout": 60}"#).unwrap();
        assert_eq!(opts.rate, Some(100));
        assert_eq!(opts.timeout, Some(60));
        assert!(opts.syn);
    }
}
