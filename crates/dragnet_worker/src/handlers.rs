//! Job execution: dispatch by type, analyzer orchestration, result
//! persistence.
//!
//! Handlers are best-effort on target I/O (a dead port still completes
//! its banner job with an empty result) and strict on store I/O. Each
//! handler re-reads the job's status right before the final write, so a
//! cancellation lands at the latest at that checkpoint.

use anyhow::{anyhow, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use dragnet_db::{AncillaryJobRow, PrimaryJobRow, Store};
use dragnet_protocol::{AncillaryJobType, JobStatus, PrimaryJobType};

use crate::banner_analyzer::{BannerAnalyzer, ServiceType};
use crate::banner_grabber::BannerGrabber;
use crate::domain_enum::DomainEnumerator;
use crate::geolocation::{GeoOutcome, GeolocationClient};
use crate::masscan::DiscoveryPipeline;
use crate::metrics::{Metrics, METRICS};
use crate::shutdown::ShutdownSignal;
use crate::ssl_cert::SslCertGrabber;

/// All per-worker analyzer instances, constructed once.
pub struct JobHandlers {
    store: Store,
    pipeline: DiscoveryPipeline,
    banner_grabber: BannerGrabber,
    banner_analyzer: BannerAnalyzer,
    ssl_grabber: SslCertGrabber,
    domain_enumerator: DomainEnumerator,
    geolocation: GeolocationClient,
}

impl JobHandlers {
    pub fn new(store: Store) -> Self {
        let pipeline = DiscoveryPipeline::new(store.clone());
        Self {
            store,
            pipeline,
            banner_grabber: BannerGrabber::default(),
            banner_analyzer: BannerAnalyzer::new(),
            ssl_grabber: SslCertGrabber::default(),
            domain_enumerator: DomainEnumerator::default(),
            geolocation: GeolocationClient::new(),
        }
    }

    /// Test seam: run the discovery pipeline with a fake scanner command.
    pub fn with_pipeline(mut self, pipeline: DiscoveryPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Execute a primary job through to a terminal status.
    pub async fn run_primary(&self, job: &PrimaryJobRow, shutdown: &ShutdownSignal) {
        info!(job_uuid = %job.job_uuid, job_type = %job.job_type, target = %job.target, "processing job");
        match self.store.mark_primary_started(job.id).await {
            Ok(true) => {}
            Ok(false) => {
                // Cancelled or swept between claim and start.
                info!(job_uuid = %job.job_uuid, "job no longer startable, skipping");
                return;
            }
            Err(err) => {
                warn!(job_uuid = %job.job_uuid, %err, "failed to mark job started");
                Metrics::inc(&METRICS.store_errors);
                return;
            }
        }

        let result = match job.job_type() {
            Some(PrimaryJobType::Masscan) => self.pipeline.run(job, shutdown).await,
            Some(other) => Err(anyhow!("unsupported job type: {other}")),
            None => Err(anyhow!("unsupported job type: {}", job.job_type)),
        };

        // Cancellation checkpoint: a row already cancelled stays as-is.
        match self.store.primary_status(job.id).await {
            Ok(Some(JobStatus::Cancelled)) => {
                info!(job_uuid = %job.job_uuid, "job was cancelled during execution");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(job_uuid = %job.job_uuid, %err, "status check failed");
                Metrics::inc(&METRICS.store_errors);
            }
        }

        match result {
            Ok(()) => {
                if let Err(err) = self.store.mark_primary_completed(job.id).await {
                    warn!(job_uuid = %job.job_uuid, %err, "failed to mark job completed");
                    Metrics::inc(&METRICS.store_errors);
                    return;
                }
                Metrics::inc(&METRICS.primary_completed);
                info!(job_uuid = %job.job_uuid, "completed job");
            }
            Err(err) => {
                if let Err(mark_err) = self.store.mark_primary_failed(job.id, &err.to_string()).await {
                    warn!(job_uuid = %job.job_uuid, %mark_err, "failed to mark job failed");
                    Metrics::inc(&METRICS.store_errors);
                    return;
                }
                Metrics::inc(&METRICS.primary_failed);
                warn!(job_uuid = %job.job_uuid, %err, "job failed");
            }
        }
    }

    /// Execute an ancillary job through to a terminal status.
    pub async fn run_ancillary(&self, job: &AncillaryJobRow) {
        debug!(
            job_uuid = %job.job_uuid,
            job_type = %job.job_type,
            host_ip = %job.host_ip,
            port = job.port_number,
            "processing ancillary job"
        );

        let result = match job.job_type() {
            Some(AncillaryJobType::BannerGrab) => self.banner_grab(job).await,
            Some(AncillaryJobType::DomainEnum) => self.domain_enum(job).await,
            Some(AncillaryJobType::SslCert) => self.ssl_cert(job).await,
            Some(AncillaryJobType::Geolocation) => self.geolocate(job).await,
            Some(other) => {
                warn!(job_uuid = %job.job_uuid, job_type = %other, "unknown ancillary job type");
                Ok(json!({ "error": format!("unknown job type: {other}") }))
            }
            None => Ok(json!({ "error": format!("unknown job type: {}", job.job_type) })),
        };

        match self.store.ancillary_status(job.id).await {
            Ok(Some(JobStatus::Cancelled)) => {
                info!(job_uuid = %job.job_uuid, "ancillary job was cancelled during execution");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(job_uuid = %job.job_uuid, %err, "status check failed");
                Metrics::inc(&METRICS.store_errors);
            }
        }

        match result {
            Ok(result_data) => {
                if let Err(err) = self.store.mark_ancillary_completed(job.id, &result_data).await {
                    warn!(job_uuid = %job.job_uuid, %err, "failed to mark ancillary completed");
                    Metrics::inc(&METRICS.store_errors);
                    return;
                }
                Metrics::inc(&METRICS.ancillary_completed);
                debug!(job_uuid = %job.job_uuid, "completed ancillary job");
            }
            Err(err) => {
                if let Err(mark_err) = self.store.mark_ancillary_failed(job.id, &err.to_string()).await {
                    warn!(job_uuid = %job.job_uuid, %mark_err, "failed to mark ancillary failed");
                    Metrics::inc(&METRICS.store_errors);
                    return;
                }
                Metrics::inc(&METRICS.ancillary_failed);
                warn!(job_uuid = %job.job_uuid, %err, "ancillary job failed");
            }
        }
    }

    /// Banner grab plus classification-driven follow-up queueing.
    async fn banner_grab(&self, job: &AncillaryJobRow) -> Result<serde_json::Value> {
        let port = job
            .port_number
            .ok_or_else(|| anyhow!("banner_grab job without port"))? as u16;

        let banner = self
            .banner_grabber
            .grab(&job.host_ip, port, &job.protocol)
            .await;

        let mut result = json!({ "banner": banner.clone().unwrap_or_default() });

        let Some(banner) = banner else {
            return Ok(result);
        };

        if let Some(port_id) = job.port_id {
            self.store.update_port_banner(port_id, &banner).await?;
        }

        let detections = self.banner_analyzer.analyze(&banner, port);

        if self.banner_analyzer.should_queue_ssl_cert(&detections) {
            let priority = self
                .banner_analyzer
                .followup_priority(&detections, &[ServiceType::Https]);
            if self
                .store
                .enqueue_analysis_followup(AncillaryJobType::SslCert, job, priority)
                .await?
                .is_some()
            {
                Metrics::inc(&METRICS.followups_enqueued);
            }
        }

        if self.banner_analyzer.should_queue_domain_enum(&detections) {
            let priority = self
                .banner_analyzer
                .followup_priority(&detections, &[ServiceType::Http, ServiceType::Https]);
            if self
                .store
                .enqueue_analysis_followup(AncillaryJobType::DomainEnum, job, priority)
                .await?
                .is_some()
            {
                Metrics::inc(&METRICS.followups_enqueued);
            }
        }

        result["detections"] = serde_json::to_value(&detections)?;
        Ok(result)
    }

    async fn domain_enum(&self, job: &AncillaryJobRow) -> Result<serde_json::Value> {
        let domains = self.domain_enumerator.enumerate(&job.host_ip).await;

        if let Some(host_id) = job.host_id {
            if !domains.is_empty() {
                self.store.insert_domains(host_id, &domains).await?;
            }
        }

        let names: Vec<&str> = domains.iter().map(|(name, _)| name.as_str()).collect();
        Ok(json!({ "domains": names }))
    }

    async fn ssl_cert(&self, job: &AncillaryJobRow) -> Result<serde_json::Value> {
        let port = job.port_number.unwrap_or(443) as u16;
        let record = self.ssl_grabber.grab(&job.host_ip, port).await;

        let Some(record) = record else {
            return Ok(json!({ "certificate": null }));
        };

        if let (Some(host_id), Some(port_id)) = (job.host_id, job.port_id) {
            self.store.upsert_certificate(&record, host_id, port_id).await?;
        }

        Ok(json!({ "certificate": record }))
    }

    async fn geolocate(&self, job: &AncillaryJobRow) -> Result<serde_json::Value> {
        match self.geolocation.lookup(&job.host_ip).await {
            GeoOutcome::PrivateIp => Ok(json!({ "geolocation": null, "reason": "private_ip" })),
            GeoOutcome::InvalidIp => Ok(json!({ "geolocation": null, "reason": "invalid_ip" })),
            GeoOutcome::NotFound => {
                // Still bump the timestamp so the host is not retried on
                // every rediscovery.
                if let Some(host_id) = job.host_id {
                    self.store.touch_geolocation(host_id).await?;
                }
                Ok(json!({ "geolocation": null, "reason": "no_data" }))
            }
            GeoOutcome::Found(record) => {
                let updated = match job.host_id {
                    Some(host_id) => {
                        self.store.apply_geolocation(host_id, &record).await?;
                        true
                    }
                    None => false,
                };
                info!(
                    host_ip = %job.host_ip,
                    city = record.city.as_deref().unwrap_or("Unknown"),
                    country = record.country.as_deref().unwrap_or("Unknown"),
                    provider = record.provider.as_deref().unwrap_or("Unknown"),
                    "geolocated host"
                );
                Ok(json!({ "geolocation": record, "updated": updated }))
            }
        }
    }
}
