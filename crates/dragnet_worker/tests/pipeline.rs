//! Discovery pipeline scenarios with a faked scanner subprocess.
//!
//! The pipeline consumes any shell command's stdout, so these tests
//! substitute `printf`/`sleep` for masscan and drive real jobs through a
//! real in-memory store.

use dragnet_db::{CreateJobRequest, Store};
use dragnet_protocol::{JobStatus, PrimaryJobType, ScanOptions};
use dragnet_worker::handlers::JobHandlers;
use dragnet_worker::masscan::DiscoveryPipeline;
use dragnet_worker::ShutdownSignal;

async fn setup() -> (Store, dragnet_db::WorkerRow) {
    let store = Store::open_in_memory().await.unwrap();
    let worker = store
        .register_worker(
            "pipeline-test",
            "testhost",
            1,
            &["masscan".to_string(), "banner_grab".to_string()],
            1,
            "0.1.0",
        )
        .await
        .unwrap();
    (store, worker)
}

async fn claim_and_run(store: &Store, worker: &dragnet_db::WorkerRow, fake_cmd: &str) {
    let claimed = store.claim_primary(worker).await.unwrap().unwrap();
    let handlers = JobHandlers::new(store.clone())
        .with_pipeline(DiscoveryPipeline::new(store.clone()).with_command_override(fake_cmd));
    handlers.run_primary(&claimed, &ShutdownSignal::new()).await;
}

#[tokio::test]
async fn small_subnet_scan_end_to_end() {
    let (store, worker) = setup().await;
    let job = store
        .create_primary_job(CreateJobRequest {
            ports: vec![22, 80],
            options: ScanOptions {
                rate: Some(100),
                timeout: Some(60),
                ..Default::default()
            },
            ..CreateJobRequest::new(PrimaryJobType::Masscan, "10.0.0.0/30")
        })
        .await
        .unwrap();

    let fake = "printf 'Discovered open port 22/tcp on 10.0.0.1\\nDiscovered open port 80/tcp on 10.0.0.2\\n'";
    claim_and_run(&store, &worker, fake).await;

    let job = store.primary_by_uuid(&job.job_uuid).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(job.scan_id.is_some());

    let scan = store.scan_by_id(job.scan_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(scan.status, "completed");
    assert!(scan.end_time.is_some());

    let hosts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hosts")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(hosts, 2);

    let ports: Vec<(i64, String)> =
        sqlx::query_as("SELECT port_number, proto FROM ports ORDER BY port_number")
            .fetch_all(store.pool())
            .await
            .unwrap();
    assert_eq!(ports, vec![(22, "tcp".to_string()), (80, "tcp".to_string())]);

    let counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT job_type, COUNT(*) FROM ancillary_jobs GROUP BY job_type ORDER BY job_type",
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    let get = |ty: &str| counts.iter().find(|(t, _)| t == ty).map(|(_, n)| *n).unwrap_or(0);
    assert_eq!(get("banner_grab"), 2);
    assert_eq!(get("domain_enum"), 2);
    assert_eq!(get("ssl_cert"), 0);
}

#[tokio::test]
async fn https_discovery_triggers_ssl_cascade() {
    let (store, worker) = setup().await;
    store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "203.0.113.5"))
        .await
        .unwrap();

    claim_and_run(
        &store,
        &worker,
        "printf 'Discovered open port 443/tcp on 203.0.113.5\\n'",
    )
    .await;

    let jobs: Vec<(String, i64)> = sqlx::query_as(
        "SELECT job_type, priority FROM ancillary_jobs ORDER BY job_type",
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(
        jobs,
        vec![
            ("banner_grab".to_string(), 0),
            ("domain_enum".to_string(), 1),
            ("geolocation".to_string(), 2),
            ("ssl_cert".to_string(), 2),
        ]
    );
}

#[tokio::test]
async fn scan_timeout_kills_the_subprocess_and_fails_the_job() {
    let (store, worker) = setup().await;
    let job = store
        .create_primary_job(CreateJobRequest {
            options: ScanOptions {
                timeout: Some(1),
                ..Default::default()
            },
            ..CreateJobRequest::new(PrimaryJobType::Masscan, "198.51.100.0/24")
        })
        .await
        .unwrap();

    let started = std::time::Instant::now();
    claim_and_run(&store, &worker, "sleep 60").await;
    assert!(started.elapsed() < std::time::Duration::from_secs(30));

    let job = store.primary_by_uuid(&job.job_uuid).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("timed out after 1 seconds"));

    let scan = store.scan_by_id(job.scan_id.unwrap()).await.unwrap().unwrap();
    assert_ne!(scan.status, "running");
}

#[tokio::test]
async fn failing_subprocess_fails_the_job() {
    let (store, worker) = setup().await;
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.1"))
        .await
        .unwrap();

    claim_and_run(&store, &worker, "exit 3").await;

    let job = store.primary_by_uuid(&job.job_uuid).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.error_message.as_deref().unwrap().contains("exit code 3"));
}

#[tokio::test]
async fn unsupported_primary_types_fail_cleanly() {
    let (store, _) = setup().await;
    let worker = store
        .register_worker(
            "nmap-test",
            "testhost",
            2,
            &["nmap".to_string()],
            1,
            "0.1.0",
        )
        .await
        .unwrap();
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Nmap, "192.0.2.1"))
        .await
        .unwrap();

    let claimed = store.claim_primary(&worker).await.unwrap().unwrap();
    let handlers = JobHandlers::new(store.clone());
    handlers.run_primary(&claimed, &ShutdownSignal::new()).await;

    let job = store.primary_by_uuid(&job.job_uuid).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("unsupported job type"));
}

#[tokio::test]
async fn cancelled_job_is_not_resurrected() {
    let (store, worker) = setup().await;
    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "192.0.2.1"))
        .await
        .unwrap();

    let claimed = store.claim_primary(&worker).await.unwrap().unwrap();
    // Cancellation lands while the job is still queued.
    assert!(store.cancel_job(&job.job_uuid).await.unwrap());

    let handlers = JobHandlers::new(store.clone())
        .with_pipeline(DiscoveryPipeline::new(store.clone()).with_command_override("true"));
    handlers.run_primary(&claimed, &ShutdownSignal::new()).await;

    let job = store.primary_by_uuid(&job.job_uuid).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Cancelled);
    // The handler never ran, so no scan row was attached.
    assert!(job.scan_id.is_none());
}

#[tokio::test]
async fn repeated_run_is_idempotent() {
    let (store, worker) = setup().await;
    store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "10.0.0.1"))
        .await
        .unwrap();
    store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "10.0.0.1"))
        .await
        .unwrap();

    let fake = "printf 'Discovered open port 22/tcp on 10.0.0.1\\n'";
    claim_and_run(&store, &worker, fake).await;
    claim_and_run(&store, &worker, fake).await;

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
    // One banner job per discovery line is expected (at-least-once), but
    // host-level jobs stay deduplicated.
    let domain_jobs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ancillary_jobs WHERE job_type = 'domain_enum'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(domain_jobs, 1);
}
