//! Worker loop integration: lease, execute, drain, deregister.

use std::time::Duration;

use dragnet_db::{CreateJobRequest, Store};
use dragnet_protocol::{JobStatus, PrimaryJobType};
use dragnet_worker::handlers::JobHandlers;
use dragnet_worker::masscan::DiscoveryPipeline;
use dragnet_worker::{ShutdownSignal, Worker, WorkerConfig};

#[tokio::test]
async fn worker_drains_the_queue_and_goes_offline() {
    let store = Store::open_in_memory().await.unwrap();

    let job = store
        .create_primary_job(CreateJobRequest::new(PrimaryJobType::Masscan, "10.0.0.0/30"))
        .await
        .unwrap();

    let worker = Worker::register(
        store.clone(),
        WorkerConfig {
            worker_id: Some("runtime-test".to_string()),
            job_types: vec!["masscan".to_string(), "banner_grab".to_string()],
            max_concurrent: 2,
        },
    )
    .await
    .unwrap()
    .with_handlers(JobHandlers::new(store.clone()).with_pipeline(
        DiscoveryPipeline::new(store.clone())
            .with_command_override("printf 'Discovered open port 80/tcp on 10.0.0.1\\n'"),
    ));

    let shutdown = ShutdownSignal::new();
    let stopper = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            shutdown.trigger();
        })
    };

    worker.run(shutdown).await.unwrap();
    stopper.await.unwrap();

    // The scan job ran to completion and fanned out a banner job.
    let job = store.primary_by_uuid(&job.job_uuid).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.assigned_worker.as_deref(), Some("runtime-test"));

    let banner_jobs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ancillary_jobs WHERE job_type = 'banner_grab'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(banner_jobs, 1);

    // Worker deregistered cleanly.
    let row = store.worker_by_id("runtime-test").await.unwrap().unwrap();
    assert_eq!(row.status.as_str(), "offline");
    assert!(row.supported_types().contains(&"masscan".to_string()));
}

#[tokio::test]
async fn worker_registration_is_idempotent() {
    let store = Store::open_in_memory().await.unwrap();

    let first = Worker::register(
        store.clone(),
        WorkerConfig {
            worker_id: Some("re-register".to_string()),
            job_types: vec!["masscan".to_string()],
            max_concurrent: 1,
        },
    )
    .await
    .unwrap();
    assert_eq!(first.worker_id(), "re-register");

    // Same identity, new capabilities: the row is refreshed, not duplicated.
    let second = Worker::register(
        store.clone(),
        WorkerConfig {
            worker_id: Some("re-register".to_string()),
            job_types: vec!["banner_grab".to_string()],
            max_concurrent: 3,
        },
    )
    .await
    .unwrap();
    assert_eq!(second.worker_id(), "re-register");

    let workers = store.list_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].max_concurrent, 3);
    assert_eq!(
        workers[0].supported_types(),
        vec!["banner_grab".to_string()]
    );
}
