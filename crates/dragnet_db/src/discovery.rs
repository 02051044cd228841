//! Discovery writes: host/port upserts, follow-up fan-out, and the
//! analyzer result paths (banners, domains, certificates, geolocation).
//!
//! `record_discovery` is the hot path: one transaction per masscan output
//! line covering the host upsert, the port upsert and every follow-up job
//! insert, so a crash can never leave a discovered port without its
//! banner job.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use dragnet_protocol::defaults::{GEO_MAX_AGE_DAYS, SSL_PORTS};
use dragnet_protocol::AncillaryJobType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{AncillaryJobRow, HostRow, ScanRow};
use crate::queue::non_terminal_predicate;
use crate::{fmt_ts, now_ts, Store, UpsertOutcome};

/// What a single discovery line produced.
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub host_id: i64,
    pub port_id: i64,
    pub host_created: bool,
    pub port_created: bool,
    pub enqueued: Vec<AncillaryJobType>,
}

/// Certificate data as captured by the SSL grabber.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub host_ip: String,
    pub port: u16,
    pub subject: BTreeMap<String, String>,
    pub issuer: BTreeMap<String, String>,
    pub version: Option<String>,
    pub serial_number: Option<String>,
    pub not_before: Option<String>,
    pub not_after: Option<String>,
    pub fingerprint_sha1: String,
    pub fingerprint_sha256: String,
    pub signature_algorithm: Option<String>,
    pub extensions: BTreeMap<String, String>,
    pub domains: Vec<String>,
    pub raw_certificate: String,
}

impl CertificateRecord {
    /// SHA-256 preferred, SHA-1 fallback.
    pub fn fingerprint(&self) -> Option<&str> {
        if !self.fingerprint_sha256.is_empty() {
            Some(&self.fingerprint_sha256)
        } else if !self.fingerprint_sha1.is_empty() {
            Some(&self.fingerprint_sha1)
        } else {
            None
        }
    }
}

/// Uniform geolocation provider output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub ip: Option<String>,
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
    pub provider: Option<String>,
}

impl Store {
    // ------------------------------------------------------------------
    // Scans
    // ------------------------------------------------------------------

    pub async fn create_scan(&self, command: &str, scan_type: &str) -> Result<ScanRow> {
        let scan_uuid = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO scans (scan_uuid, command, start_time, status, scan_type)
            VALUES (?, ?, ?, 'running', ?)
            "#,
        )
        .bind(&scan_uuid)
        .bind(command)
        .bind(now_ts())
        .bind(scan_type)
        .execute(self.pool())
        .await?;

        sqlx::query_as::<_, ScanRow>("SELECT * FROM scans WHERE scan_uuid = ?")
            .bind(&scan_uuid)
            .fetch_one(self.pool())
            .await
            .context("Scan vanished after insert")
    }

    pub async fn finish_scan(&self, scan_id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE scans SET status = ?, end_time = ? WHERE id = ?")
            .bind(status)
            .bind(now_ts())
            .bind(scan_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn scan_by_id(&self, scan_id: i64) -> Result<Option<ScanRow>> {
        Ok(sqlx::query_as::<_, ScanRow>("SELECT * FROM scans WHERE id = ?")
            .bind(scan_id)
            .fetch_optional(self.pool())
            .await?)
    }

    // ------------------------------------------------------------------
    // The discovery transaction
    // ------------------------------------------------------------------

    /// Record one `Discovered open port P/proto on IP` line: upsert host
    /// and port, then fan out the follow-up jobs, all atomically.
    pub async fn record_discovery(
        &self,
        scan_id: i64,
        primary_job_id: i64,
        host_ip: &str,
        port_number: u16,
        proto: &str,
    ) -> Result<DiscoveryOutcome> {
        let now = now_ts();
        let mut tx = self.pool().begin().await?;

        // Host get-or-create. Concurrent inserts serialize on the unique
        // constraint and retry as an update.
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM hosts WHERE ip = ?")
            .bind(host_ip)
            .fetch_optional(&mut *tx)
            .await?;
        let (host_id, host_created) = match existing {
            Some(id) => {
                sqlx::query("UPDATE hosts SET last_seen = ? WHERE id = ?")
                    .bind(&now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                (id, false)
            }
            None => {
                let inserted = sqlx::query("INSERT INTO hosts (ip, last_seen) VALUES (?, ?)")
                    .bind(host_ip)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await;
                match inserted {
                    Ok(done) => (done.last_insert_rowid(), true),
                    Err(_) => {
                        let id: i64 = sqlx::query_scalar("SELECT id FROM hosts WHERE ip = ?")
                            .bind(host_ip)
                            .fetch_one(&mut *tx)
                            .await?;
                        sqlx::query("UPDATE hosts SET last_seen = ? WHERE id = ?")
                            .bind(&now)
                            .bind(id)
                            .execute(&mut *tx)
                            .await?;
                        (id, false)
                    }
                }
            }
        };

        // Port upsert by (host, port, proto).
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM ports WHERE host_id = ? AND port_number = ? AND proto = ?",
        )
        .bind(host_id)
        .bind(port_number as i64)
        .bind(proto)
        .fetch_optional(&mut *tx)
        .await?;
        let (port_id, port_created) = match existing {
            Some(id) => {
                sqlx::query("UPDATE ports SET status = 'open', last_seen = ? WHERE id = ?")
                    .bind(&now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                (id, false)
            }
            None => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO ports (host_id, port_number, proto, status, last_seen, scan_id)
                    VALUES (?, ?, ?, 'open', ?, ?)
                    "#,
                )
                .bind(host_id)
                .bind(port_number as i64)
                .bind(proto)
                .bind(&now)
                .bind(scan_id)
                .execute(&mut *tx)
                .await;
                match inserted {
                    Ok(done) => (done.last_insert_rowid(), true),
                    Err(_) => {
                        let id: i64 = sqlx::query_scalar(
                            "SELECT id FROM ports WHERE host_id = ? AND port_number = ? AND proto = ?",
                        )
                        .bind(host_id)
                        .bind(port_number as i64)
                        .bind(proto)
                        .fetch_one(&mut *tx)
                        .await?;
                        sqlx::query("UPDATE ports SET status = 'open', last_seen = ? WHERE id = ?")
                            .bind(&now)
                            .bind(id)
                            .execute(&mut *tx)
                            .await?;
                        (id, false)
                    }
                }
            }
        };

        // Follow-up fan-out.
        let mut enqueued = Vec::new();

        insert_followup(
            &mut tx,
            FollowupInsert {
                job_type: AncillaryJobType::BannerGrab,
                host_ip,
                port_number: Some(port_number),
                protocol: proto,
                port_id: Some(port_id),
                host_id: Some(host_id),
                primary_job_id: Some(primary_job_id),
                priority: 0,
                metadata: None,
            },
        )
        .await?;
        enqueued.push(AncillaryJobType::BannerGrab);

        let has_domain_enum = exists_for_host(&mut tx, host_id, "domain_enum", false).await?;
        if host_created || !has_domain_enum {
            insert_followup(
                &mut tx,
                FollowupInsert {
                    job_type: AncillaryJobType::DomainEnum,
                    host_ip,
                    port_number: None,
                    protocol: "tcp",
                    port_id: None,
                    host_id: Some(host_id),
                    primary_job_id: Some(primary_job_id),
                    priority: 1,
                    metadata: None,
                },
            )
            .await?;
            enqueued.push(AncillaryJobType::DomainEnum);
        }

        if SSL_PORTS.contains(&port_number) {
            insert_followup(
                &mut tx,
                FollowupInsert {
                    job_type: AncillaryJobType::SslCert,
                    host_ip,
                    port_number: Some(port_number),
                    protocol: proto,
                    port_id: Some(port_id),
                    host_id: Some(host_id),
                    primary_job_id: Some(primary_job_id),
                    priority: 2,
                    metadata: None,
                },
            )
            .await?;
            enqueued.push(AncillaryJobType::SslCert);
        }

        let needs_geo = host_created || host_geo_stale(&mut tx, host_id).await?;
        let has_geo_job = exists_for_host(&mut tx, host_id, "geolocation", true).await?;
        if needs_geo && !has_geo_job {
            insert_followup(
                &mut tx,
                FollowupInsert {
                    job_type: AncillaryJobType::Geolocation,
                    host_ip,
                    port_number: None,
                    protocol: "tcp",
                    port_id: None,
                    host_id: Some(host_id),
                    primary_job_id: Some(primary_job_id),
                    priority: 2,
                    metadata: None,
                },
            )
            .await?;
            enqueued.push(AncillaryJobType::Geolocation);
        }

        tx.commit().await?;

        if host_created {
            info!(ip = host_ip, "new host discovered");
        }
        debug!(
            ip = host_ip,
            port = port_number,
            proto,
            followups = enqueued.len(),
            "recorded discovery"
        );

        Ok(DiscoveryOutcome {
            host_id,
            port_id,
            host_created,
            port_created,
            enqueued,
        })
    }

    // ------------------------------------------------------------------
    // Analyzer-driven follow-ups
    // ------------------------------------------------------------------

    /// Queue an SSL or domain follow-up out of banner analysis, suppressing
    /// duplicates against non-terminal jobs for the same target.
    pub async fn enqueue_analysis_followup(
        &self,
        job_type: AncillaryJobType,
        banner_job: &AncillaryJobRow,
        priority: i64,
    ) -> Result<Option<AncillaryJobRow>> {
        let duplicate = match job_type {
            AncillaryJobType::SslCert => {
                self.exists_non_terminal(job_type, &banner_job.host_ip, banner_job.port_number)
                    .await?
            }
            AncillaryJobType::DomainEnum => {
                self.exists_non_terminal(job_type, &banner_job.host_ip, None)
                    .await?
            }
            _ => false,
        };
        if duplicate {
            return Ok(None);
        }

        let port_scoped = job_type.is_port_scoped();
        let mut tx = self.pool().begin().await?;
        let job_uuid = insert_followup(
            &mut tx,
            FollowupInsert {
                job_type,
                host_ip: &banner_job.host_ip,
                port_number: if port_scoped {
                    banner_job.port_number.map(|p| p as u16)
                } else {
                    None
                },
                protocol: &banner_job.protocol,
                port_id: if port_scoped { banner_job.port_id } else { None },
                host_id: banner_job.host_id,
                primary_job_id: banner_job.primary_job_id,
                priority,
                metadata: Some(r#"{"triggered_by":"banner_analysis"}"#),
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            job_type = %job_type,
            host_ip = %banner_job.host_ip,
            priority,
            "queued follow-up from banner analysis"
        );
        self.ancillary_by_uuid(&job_uuid).await
    }

    /// Is there a non-terminal job of this type for the target already?
    pub async fn exists_non_terminal(
        &self,
        job_type: AncillaryJobType,
        host_ip: &str,
        port_number: Option<i64>,
    ) -> Result<bool> {
        let predicate = non_terminal_predicate();
        let count: i64 = match port_number {
            Some(port) => {
                sqlx::query_scalar(&format!(
                    "SELECT COUNT(*) FROM ancillary_jobs WHERE job_type = ? AND host_ip = ? AND port_number = ? AND {predicate}"
                ))
                .bind(job_type.as_str())
                .bind(host_ip)
                .bind(port)
                .fetch_one(self.pool())
                .await?
            }
            None => {
                sqlx::query_scalar(&format!(
                    "SELECT COUNT(*) FROM ancillary_jobs WHERE job_type = ? AND host_ip = ? AND {predicate}"
                ))
                .bind(job_type.as_str())
                .bind(host_ip)
                .fetch_one(self.pool())
                .await?
            }
        };
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Analyzer result writes
    // ------------------------------------------------------------------

    pub async fn update_port_banner(&self, port_id: i64, banner: &str) -> Result<()> {
        sqlx::query("UPDATE ports SET banner = ? WHERE id = ?")
            .bind(banner)
            .bind(port_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Store enumerated domains. A name already attached to another host
    /// is re-pointed at this one.
    pub async fn insert_domains(&self, host_id: i64, domains: &[(String, String)]) -> Result<u64> {
        let mut inserted = 0;
        for (name, source) in domains {
            let existing: Option<(i64, i64)> =
                sqlx::query_as("SELECT id, host_id FROM domains WHERE name = ? LIMIT 1")
                    .bind(name)
                    .fetch_optional(self.pool())
                    .await?;
            match existing {
                Some((id, owner)) if owner != host_id => {
                    sqlx::query("UPDATE domains SET host_id = ? WHERE id = ?")
                        .bind(host_id)
                        .bind(id)
                        .execute(self.pool())
                        .await?;
                }
                Some(_) => {}
                None => {
                    let done = sqlx::query(
                        r#"
                        INSERT INTO domains (name, source, host_id) VALUES (?, ?, ?)
                        ON CONFLICT(name, host_id) DO NOTHING
                        "#,
                    )
                    .bind(name)
                    .bind(source)
                    .bind(host_id)
                    .execute(self.pool())
                    .await?;
                    inserted += done.rows_affected();
                }
            }
        }
        Ok(inserted)
    }

    /// Upsert a certificate by fingerprint; on conflict the host/port
    /// pointers and validity window follow the latest observation.
    pub async fn upsert_certificate(
        &self,
        record: &CertificateRecord,
        host_id: i64,
        port_id: i64,
    ) -> Result<UpsertOutcome> {
        let Some(fingerprint) = record.fingerprint() else {
            bail!("certificate has no fingerprint");
        };
        let subject_cn = record.subject.get("CN").cloned();
        let issuer_cn = record.issuer.get("CN").cloned();
        let now = now_ts();

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM ssl_certificates WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(self.pool())
                .await?;

        match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE ssl_certificates
                    SET pem_data = ?, subject_cn = COALESCE(?, subject_cn),
                        issuer_cn = COALESCE(?, issuer_cn),
                        valid_from = ?, valid_until = ?,
                        host_id = ?, port_id = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&record.raw_certificate)
                .bind(subject_cn)
                .bind(issuer_cn)
                .bind(record.not_before.as_deref().unwrap_or(""))
                .bind(record.not_after.as_deref().unwrap_or(""))
                .bind(host_id)
                .bind(port_id)
                .bind(&now)
                .bind(id)
                .execute(self.pool())
                .await?;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO ssl_certificates
                        (fingerprint, pem_data, subject_cn, issuer_cn, valid_from, valid_until,
                         host_id, port_id, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(fingerprint)
                .bind(&record.raw_certificate)
                .bind(subject_cn)
                .bind(issuer_cn)
                .bind(record.not_before.as_deref().unwrap_or(""))
                .bind(record.not_after.as_deref().unwrap_or(""))
                .bind(host_id)
                .bind(port_id)
                .bind(&now)
                .bind(&now)
                .execute(self.pool())
                .await;
                match inserted {
                    Ok(_) => Ok(UpsertOutcome::Created),
                    // Lost a race on the fingerprint; retry as update.
                    Err(_) => {
                        Box::pin(self.upsert_certificate(record, host_id, port_id)).await
                    }
                }
            }
        }
    }

    pub async fn apply_geolocation(&self, host_id: i64, geo: &GeoRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE hosts
            SET country = ?, country_code = ?, region = ?, city = ?,
                latitude = ?, longitude = ?, timezone = ?, isp = ?,
                organization = ?, asn = ?, geolocation_updated = ?
            WHERE id = ?
            "#,
        )
        .bind(&geo.country)
        .bind(&geo.country_code)
        .bind(&geo.region)
        .bind(&geo.city)
        .bind(geo.latitude)
        .bind(geo.longitude)
        .bind(&geo.timezone)
        .bind(&geo.isp)
        .bind(&geo.organization)
        .bind(&geo.asn)
        .bind(now_ts())
        .bind(host_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Bump the geolocation timestamp without data, so failed lookups are
    /// not retried immediately.
    pub async fn touch_geolocation(&self, host_id: i64) -> Result<()> {
        sqlx::query("UPDATE hosts SET geolocation_updated = ? WHERE id = ?")
            .bind(now_ts())
            .bind(host_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn host_by_ip(&self, ip: &str) -> Result<Option<HostRow>> {
        Ok(sqlx::query_as::<_, HostRow>("SELECT * FROM hosts WHERE ip = ?")
            .bind(ip)
            .fetch_optional(self.pool())
            .await?)
    }

    pub async fn host_by_id(&self, id: i64) -> Result<Option<HostRow>> {
        Ok(sqlx::query_as::<_, HostRow>("SELECT * FROM hosts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?)
    }
}

struct FollowupInsert<'a> {
    job_type: AncillaryJobType,
    host_ip: &'a str,
    port_number: Option<u16>,
    protocol: &'a str,
    port_id: Option<i64>,
    host_id: Option<i64>,
    primary_job_id: Option<i64>,
    priority: i64,
    metadata: Option<&'a str>,
}

async fn insert_followup(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    params: FollowupInsert<'_>,
) -> Result<String> {
    let job_uuid = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO ancillary_jobs
            (job_uuid, job_type, status, priority, host_ip, port_number, protocol,
             port_id, host_id, primary_job_id, created_at, retry_count, max_retries, metadata)
        VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, 0, 3, ?)
        "#,
    )
    .bind(&job_uuid)
    .bind(params.job_type.as_str())
    .bind(params.priority)
    .bind(params.host_ip)
    .bind(params.port_number.map(|p| p as i64))
    .bind(params.protocol)
    .bind(params.port_id)
    .bind(params.host_id)
    .bind(params.primary_job_id)
    .bind(now_ts())
    .bind(params.metadata)
    .execute(&mut **tx)
    .await?;
    Ok(job_uuid)
}

/// Does a job of `job_type` exist for this host? `include_completed`
/// widens the check for geolocation, which should not rerun after success.
async fn exists_for_host(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    host_id: i64,
    job_type: &str,
    include_completed: bool,
) -> Result<bool> {
    let mut predicate = non_terminal_predicate();
    if include_completed {
        predicate = format!("({predicate} OR status = 'completed')");
    }
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM ancillary_jobs WHERE host_id = ? AND job_type = ? AND {predicate}"
    ))
    .bind(host_id)
    .bind(job_type)
    .fetch_one(&mut **tx)
    .await?;
    Ok(count > 0)
}

/// True when the host's geolocation is missing or older than the refresh
/// window.
async fn host_geo_stale(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    host_id: i64,
) -> Result<bool> {
    let cutoff = fmt_ts(Utc::now() - Duration::days(GEO_MAX_AGE_DAYS));
    let updated: Option<Option<String>> =
        sqlx::query_scalar("SELECT geolocation_updated FROM hosts WHERE id = ?")
            .bind(host_id)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(match updated.flatten() {
        None => true,
        Some(ts) => ts < cutoff,
    })
}
