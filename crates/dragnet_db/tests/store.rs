//! Store-level behavior: claims, fan-out, idempotency, de-dup, cleanup.

use dragnet_db::{CreateJobRequest, Store};
use dragnet_protocol::{AncillaryJobType, JobStatus, PrimaryJobType, ScanOptions};

async fn store_with_worker(worker_id: &str) -> (Store, dragnet_db::WorkerRow) {
    let store = Store::open_in_memory().await.unwrap();
    let worker = store
        .register_worker(
            worker_id,
            "testhost",
            1234,
            &[
                "masscan".to_string(),
                "banner_grab".to_string(),
                "ssl_cert".to_string(),
                "domain_enum".to_string(),
                "geolocation".to_string(),
            ],
            1,
            "0.1.0",
        )
        .await
        .unwrap();
    (store, worker)
}

#[tokio::test]
async fn create_job_auto_creates_queue() {
    let store = Store::open_in_memory().await.unwrap();
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "10.0.0.0/30"))
        .await
        .unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.progress, 0);

    let stats = store.queue_stats(Some("default")).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].pending, 1);
    assert_eq!(stats[0].max_concurrent, 5);
}

#[tokio::test]
async fn claim_primary_orders_by_priority_then_age() {
    let (store, worker) = store_with_worker("w1").await;

    let low = store
        .create_primary_job(CreateJobRequest {
            priority: 0,
            ..CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.1")
        })
        .await
        .unwrap();
    let high = store
        .create_primary_job(CreateJobRequest {
            priority: 10,
            ..CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.2")
        })
        .await
        .unwrap();

    let claimed = store.claim_primary(&worker).await.unwrap().unwrap();
    assert_eq!(claimed.id, high.id);
    assert_eq!(claimed.status(), JobStatus::Queued);
    assert_eq!(claimed.assigned_worker.as_deref(), Some("w1"));

    let next = store.claim_primary(&worker).await.unwrap().unwrap();
    assert_eq!(next.id, low.id);
}

#[tokio::test]
async fn claim_primary_skips_future_scheduled_jobs() {
    let (store, worker) = store_with_worker("w1").await;
    store
        .create_primary_job(CreateJobRequest {
            scheduled_for: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            ..CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.1")
        })
        .await
        .unwrap();

    assert!(store.claim_primary(&worker).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_primary_honors_queue_capacity() {
    let (store, worker) = store_with_worker("w1").await;
    // Shrink the default queue to one in-flight job.
    store.ensure_queue("default").await.unwrap();
    sqlx::query("UPDATE queues SET max_concurrent = 1 WHERE name = 'default'")
        .execute(store.pool())
        .await
        .unwrap();

    for i in 0..3 {
        store
            .create_primary_job(CreateJobRequest::new(
                PrimaryJobType::Masscan,
                format!("192.0.2.{i}"),
            ))
            .await
            .unwrap();
    }

    let first = store.claim_primary(&worker).await.unwrap();
    assert!(first.is_some());
    // The queue is at capacity until the first job finishes.
    assert!(store.claim_primary(&worker).await.unwrap().is_none());

    store
        .mark_primary_completed(first.unwrap().id)
        .await
        .unwrap();
    assert!(store.claim_primary(&worker).await.unwrap().is_some());
}

#[tokio::test]
async fn two_workers_never_claim_the_same_job() {
    let store = Store::open_in_memory().await.unwrap();
    let types = vec!["masscan".to_string()];
    let w1 = store
        .register_worker("w1", "host-a", 1, &types, 4, "0.1.0")
        .await
        .unwrap();
    let w2 = store
        .register_worker("w2", "host-b", 2, &types, 4, "0.1.0")
        .await
        .unwrap();

    for i in 0..4 {
        store
            .create_primary_job(CreateJobRequest::new(
                PrimaryJobType::Masscan,
                format!("198.51.100.{i}"),
            ))
            .await
            .unwrap();
    }

    let mut seen = std::collections::HashSet::new();
    for worker in [&w1, &w2, &w1, &w2] {
        let job = store.claim_primary(worker).await.unwrap().unwrap();
        assert!(seen.insert(job.id), "job {} leased twice", job.id);
    }
}

#[tokio::test]
async fn ancillary_batch_follows_type_priority() {
    let (store, worker) = store_with_worker("w1").await;
    let scan = store.create_scan("masscan ...", "masscan").await.unwrap();
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "203.0.113.9"))
        .await
        .unwrap();

    // One discovery on an HTTPS port: banner + domain + ssl + geo.
    store
        .record_discovery(scan.id, job.id, "203.0.113.9", 443, "tcp")
        .await
        .unwrap();

    let batch = store.claim_ancillary_batch(&worker, 5).await.unwrap();
    let types: Vec<_> = batch.iter().map(|j| j.job_type.clone()).collect();
    // ssl_cert first, then banner_grab, then domain_enum, geolocation last
    // via the fallback fill.
    assert_eq!(
        types,
        vec!["ssl_cert", "banner_grab", "domain_enum", "geolocation"]
    );
    for job in &batch {
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.assigned_worker.as_deref(), Some("w1"));
        assert!(job.started_at.is_some());
    }

    // Everything is claimed; a second batch is empty.
    assert!(store.claim_ancillary_batch(&worker, 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn discovery_is_idempotent() {
    let (store, _worker) = store_with_worker("w1").await;
    let scan = store.create_scan("masscan ...", "masscan").await.unwrap();
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "10.0.0.0/30"))
        .await
        .unwrap();

    let first = store
        .record_discovery(scan.id, job.id, "10.0.0.1", 22, "tcp")
        .await
        .unwrap();
    assert!(first.host_created);
    assert!(first.port_created);

    let second = store
        .record_discovery(scan.id, job.id, "10.0.0.1", 22, "tcp")
        .await
        .unwrap();
    assert!(!second.host_created);
    assert!(!second.port_created);
    assert_eq!(first.host_id, second.host_id);
    assert_eq!(first.port_id, second.port_id);

    let hosts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hosts")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let ports: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ports")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(hosts, 1);
    assert_eq!(ports, 1);
}

#[tokio::test]
async fn subnet_scan_fan_out_matches_policy() {
    // Two hosts on non-SSL ports: banner per port, domain per host, no ssl.
    let (store, _worker) = store_with_worker("w1").await;
    let scan = store.create_scan("masscan ...", "masscan").await.unwrap();
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "10.0.0.0/30"))
        .await
        .unwrap();

    store
        .record_discovery(scan.id, job.id, "10.0.0.1", 22, "tcp")
        .await
        .unwrap();
    store
        .record_discovery(scan.id, job.id, "10.0.0.2", 80, "tcp")
        .await
        .unwrap();

    let count_type = |ty: &'static str| {
        let store = store.clone();
        async move {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM ancillary_jobs WHERE job_type = ?",
            )
            .bind(ty)
            .fetch_one(store.pool())
            .await
            .unwrap()
        }
    };

    assert_eq!(count_type("banner_grab").await, 2);
    assert_eq!(count_type("domain_enum").await, 2);
    assert_eq!(count_type("ssl_cert").await, 0);
    assert_eq!(count_type("geolocation").await, 2);
}

#[tokio::test]
async fn repeated_discovery_does_not_duplicate_host_level_jobs() {
    let (store, _worker) = store_with_worker("w1").await;
    let scan = store.create_scan("masscan ...", "masscan").await.unwrap();
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "10.0.0.1"))
        .await
        .unwrap();

    // Same host seen on three ports: one domain_enum, one geolocation.
    for port in [22u16, 80, 8080] {
        store
            .record_discovery(scan.id, job.id, "10.0.0.1", port, "tcp")
            .await
            .unwrap();
    }

    let domain_jobs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ancillary_jobs WHERE job_type = 'domain_enum'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    let geo_jobs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ancillary_jobs WHERE job_type = 'geolocation'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(domain_jobs, 1);
    assert_eq!(geo_jobs, 1);
}

#[tokio::test]
async fn analysis_followup_suppresses_duplicates_and_carries_priority() {
    let (store, worker) = store_with_worker("w1").await;
    let scan = store.create_scan("masscan ...", "masscan").await.unwrap();
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "203.0.113.5"))
        .await
        .unwrap();

    store
        .record_discovery(scan.id, job.id, "203.0.113.5", 443, "tcp")
        .await
        .unwrap();

    let batch = store.claim_ancillary_batch(&worker, 5).await.unwrap();
    let banner = batch
        .iter()
        .find(|j| j.job_type == "banner_grab")
        .unwrap()
        .clone();

    // The discovery already queued an ssl_cert for 203.0.113.5:443, so the
    // analyzer's request is a duplicate.
    let dup = store
        .enqueue_analysis_followup(AncillaryJobType::SslCert, &banner, 9)
        .await
        .unwrap();
    assert!(dup.is_none());

    // The discovery-time domain_enum is claimed (running), which still
    // counts as non-terminal.
    let dup = store
        .enqueue_analysis_followup(AncillaryJobType::DomainEnum, &banner, 9)
        .await
        .unwrap();
    assert!(dup.is_none());

    // Finish the domain job; a new one may now be justified.
    let domain_job = batch.iter().find(|j| j.job_type == "domain_enum").unwrap();
    store
        .mark_ancillary_completed(domain_job.id, &serde_json::json!({"domains": []}))
        .await
        .unwrap();
    let requeued = store
        .enqueue_analysis_followup(AncillaryJobType::DomainEnum, &banner, 9)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(requeued.priority, 9);
    assert_eq!(requeued.port_number, None);
    assert!(requeued
        .metadata
        .as_deref()
        .unwrap()
        .contains("banner_analysis"));
}

#[tokio::test]
async fn progress_is_clamped_and_completion_pins_it() {
    let (store, _worker) = store_with_worker("w1").await;
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.9"))
        .await
        .unwrap();

    store.update_primary_progress(job.id, 250).await.unwrap();
    let job = store.primary_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(job.progress, 100);

    store.update_primary_progress(job.id, -5).await.unwrap();
    let job = store.primary_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(job.progress, 0);

    store.mark_primary_completed(job.id).await.unwrap();
    let job = store.primary_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(job.progress, 100);
}

#[tokio::test]
async fn cancel_only_touches_live_jobs() {
    let (store, worker) = store_with_worker("w1").await;
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.7"))
        .await
        .unwrap();

    assert!(store.cancel_job(&job.job_uuid).await.unwrap());
    let job = store.primary_by_uuid(&job.job_uuid).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Cancelled);
    assert!(job.completed_at.is_some());

    // Terminal jobs cannot be cancelled again.
    assert!(!store.cancel_job(&job.job_uuid).await.unwrap());
    // Nothing is claimable.
    assert!(store.claim_primary(&worker).await.unwrap().is_none());
}

#[tokio::test]
async fn cleanup_removes_only_old_terminal_jobs() {
    let (store, _worker) = store_with_worker("w1").await;
    let old = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.1"))
        .await
        .unwrap();
    let fresh = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.2"))
        .await
        .unwrap();

    store.mark_primary_completed(old.id).await.unwrap();
    store.mark_primary_completed(fresh.id).await.unwrap();
    // Backdate the first completion.
    sqlx::query("UPDATE primary_jobs SET completed_at = '2020-01-01T00:00:00.000000+00:00' WHERE id = ?")
        .bind(old.id)
        .execute(store.pool())
        .await
        .unwrap();

    let dry = store.cleanup(7, true).await.unwrap();
    assert_eq!(dry.primary, 1);
    assert!(store.primary_by_id(old.id).await.unwrap().is_some());

    let report = store.cleanup(7, false).await.unwrap();
    assert_eq!(report.primary, 1);
    assert!(store.primary_by_id(old.id).await.unwrap().is_none());
    assert!(store.primary_by_id(fresh.id).await.unwrap().is_some());
}

#[tokio::test]
async fn certificate_upsert_is_keyed_by_fingerprint() {
    let (store, _worker) = store_with_worker("w1").await;
    let scan = store.create_scan("masscan ...", "masscan").await.unwrap();
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "203.0.113.5"))
        .await
        .unwrap();
    let d1 = store
        .record_discovery(scan.id, job.id, "203.0.113.5", 443, "tcp")
        .await
        .unwrap();
    let d2 = store
        .record_discovery(scan.id, job.id, "203.0.113.6", 8443, "tcp")
        .await
        .unwrap();

    let mut record = dragnet_db::CertificateRecord {
        host_ip: "203.0.113.5".to_string(),
        port: 443,
        fingerprint_sha256: "AB".repeat(32),
        ..Default::default()
    };
    record
        .subject
        .insert("CN".to_string(), "example.com".to_string());

    let outcome = store
        .upsert_certificate(&record, d1.host_id, d1.port_id)
        .await
        .unwrap();
    assert!(outcome.is_created());

    // Same certificate observed on another host/port re-points the row.
    record.host_ip = "203.0.113.6".to_string();
    record.port = 8443;
    let outcome = store
        .upsert_certificate(&record, d2.host_id, d2.port_id)
        .await
        .unwrap();
    assert!(!outcome.is_created());

    let (count, host_id): (i64, i64) =
        sqlx::query_as("SELECT COUNT(*), MAX(host_id) FROM ssl_certificates")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(count, 1);
    assert_eq!(host_id, d2.host_id);
}

#[tokio::test]
async fn domains_are_unique_and_re_pointed() {
    let (store, _worker) = store_with_worker("w1").await;
    let scan = store.create_scan("masscan ...", "masscan").await.unwrap();
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "x"))
        .await
        .unwrap();
    let d1 = store
        .record_discovery(scan.id, job.id, "203.0.113.5", 80, "tcp")
        .await
        .unwrap();
    let d2 = store
        .record_discovery(scan.id, job.id, "203.0.113.6", 80, "tcp")
        .await
        .unwrap();

    let names = vec![
        ("example.com".to_string(), "reverse_dns".to_string()),
        ("www.example.com".to_string(), "ssl_san".to_string()),
    ];
    assert_eq!(store.insert_domains(d1.host_id, &names).await.unwrap(), 2);
    // Inserting again is a no-op.
    assert_eq!(store.insert_domains(d1.host_id, &names).await.unwrap(), 0);

    // The same name observed from another host re-points.
    store
        .insert_domains(
            d2.host_id,
            &[("example.com".to_string(), "http_header".to_string())],
        )
        .await
        .unwrap();
    let owner: i64 = sqlx::query_scalar("SELECT host_id FROM domains WHERE name = 'example.com'")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(owner, d2.host_id);

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM domains")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn list_jobs_filters_by_status_and_queue() {
    let (store, _worker) = store_with_worker("w1").await;
    let a = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.1"))
        .await
        .unwrap();
    store
        .create_primary_job(CreateJobRequest {
            queue: "high_priority".to_string(),
            ..CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.2")
        })
        .await
        .unwrap();
    store.mark_primary_failed(a.id, "boom").await.unwrap();

    let failed = store
        .list_jobs(Some(JobStatus::Failed), None, 10)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error_message.as_deref(), Some("boom"));

    let in_queue = store
        .list_jobs(None, Some("high_priority"), 10)
        .await
        .unwrap();
    assert_eq!(in_queue.len(), 1);

    let opts: ScanOptions = serde_json::from_str(&in_queue[0].options).unwrap();
    assert!(opts.syn);
}
