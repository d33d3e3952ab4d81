//! End-to-end scheduling scenarios.
//!
//! Each test wires a real pool, queue and scheduler to an in-memory scripted
//! fetcher, so no network access is needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use quotaflow::config::AppConfig;
use quotaflow::credentials::{CredentialPool, MemoryCredentialStore, PoolConfig};
use quotaflow::fetcher::{FetchError, Fetcher};
use quotaflow::scheduler::{
    ErrorKind, JobConfig, JobDetails, JobPriority, JobQueue, JobStatus, ProcessorConfig,
    Scheduler, SchedulerConfig, WorkProcessor,
};
use quotaflow::service::Service;

/// Answers every item, failing the ones listed with a fixed status.
struct ScriptedFetcher {
    failures: HashMap<String, u16>,
    fail_all: Option<u16>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    fn ok() -> Self {
        Self {
            failures: HashMap::new(),
            fail_all: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing(item: &str, status: u16) -> Self {
        let mut fetcher = Self::ok();
        fetcher.failures.insert(item.to_string(), status);
        fetcher
    }

    fn always(status: u16) -> Self {
        Self {
            fail_all: Some(status),
            ..Self::ok()
        }
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, item: &str, _secret: &str) -> Result<serde_json::Value, FetchError> {
        self.calls.lock().await.push(item.to_string());

        if let Some(status) = self.fail_all.or_else(|| self.failures.get(item).copied()) {
            return Err(FetchError::status(status, format!("scripted {}", status)));
        }
        Ok(serde_json::json!({ "item": item, "found": true }))
    }
}

fn fast_scheduler_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_polling_interval(Duration::from_millis(20))
        .with_delay_between_items(Duration::ZERO)
        .with_long_break(0, Duration::ZERO)
        .with_shutdown_timeout(Duration::from_secs(5))
}

async fn service_with(credentials: usize, fetcher: Arc<ScriptedFetcher>) -> Service {
    let pool = Arc::new(CredentialPool::new(PoolConfig::default()));
    for i in 0..credentials {
        let id = format!("cred-{}", i);
        pool.add(&format!("secret-{}", i), Some(id.as_str()))
            .await
            .unwrap();
    }
    let queue = Arc::new(JobQueue::new());
    let scheduler = Arc::new(Scheduler::new(
        fast_scheduler_config(),
        Arc::clone(&pool),
        Arc::clone(&queue),
        fetcher,
    ));
    Service::new(pool, queue, scheduler)
}

fn items(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("item-{}", i)).collect()
}

async fn wait_done(service: &Service, id: uuid::Uuid) -> JobDetails {
    tokio::time::timeout(
        Duration::from_secs(10),
        service.wait_for_job(id, Duration::from_millis(10)),
    )
    .await
    .expect("job should finish")
    .expect("job should exist")
}

#[tokio::test]
async fn test_happy_path_rotates_in_runs() {
    let fetcher = Arc::new(ScriptedFetcher::ok());
    let service = service_with(2, Arc::clone(&fetcher)).await;
    service.start_scheduler().await.unwrap();

    let config = JobConfig::default().with_requests_per_credential(2);
    let id = service
        .submit(&items(5), JobPriority::Normal, config)
        .await
        .unwrap()
        .job_id;

    let details = wait_done(&service, id).await;
    service.stop_scheduler().await.unwrap();

    assert_eq!(details.status, JobStatus::Completed);
    assert_eq!(details.processed_count, 5);
    assert_eq!(details.failed_count, 0);
    assert_eq!(details.progress_percentage, 100.0);

    let results = service.job_results(id, None).await.unwrap();
    let used: Vec<&str> = results
        .results
        .iter()
        .map(|r| r.credential_id.as_str())
        .collect();
    assert_eq!(used[0], used[1]);
    assert_eq!(used[2], used[3]);
    assert_ne!(used[1], used[2]);
    assert_ne!(used[3], used[4]);

    let status = service.credential_status().await;
    assert_eq!(status.total_daily_usage, 5);
    assert_eq!(fetcher.calls().await, items(5));
}

#[tokio::test]
async fn test_zero_capacity_blocks_admission() {
    let service = service_with(0, Arc::new(ScriptedFetcher::ok())).await;
    service.start_scheduler().await.unwrap();

    let id = service
        .submit(&items(3), JobPriority::Normal, JobConfig::default())
        .await
        .unwrap()
        .job_id;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        service.job_details(id).await.unwrap().status,
        JobStatus::Pending
    );
    let health = service.health().await;
    assert!(!health.healthy);
    assert!(health.issues.iter().any(|i| i.contains("No available credentials")));

    service.stop_scheduler().await.unwrap();
}

#[tokio::test]
async fn test_exhaustion_records_every_item() {
    let pool = Arc::new(CredentialPool::new(PoolConfig::default()));
    let queue = Arc::new(JobQueue::new());
    let id = queue
        .create_job(items(3), JobPriority::Normal, JobConfig::default())
        .await
        .unwrap();
    let job = queue.dequeue_next().await.unwrap();

    let config = ProcessorConfig::merged(&fast_scheduler_config(), &job.config);
    WorkProcessor::new(
        job,
        config,
        Arc::clone(&pool),
        Arc::clone(&queue),
        Arc::new(ScriptedFetcher::ok()),
    )
    .run()
    .await;

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_count, 0);
    assert_eq!(job.failed_count, 3);
    assert!(job
        .errors
        .iter()
        .all(|e| e.kind == ErrorKind::CredentialExhausted && e.credential_id.is_none()));
}

#[tokio::test]
async fn test_stop_on_error_leaves_credential_untouched() {
    let fetcher = Arc::new(ScriptedFetcher::failing("item-2", 403));
    let service = service_with(1, Arc::clone(&fetcher)).await;
    service.start_scheduler().await.unwrap();

    let config = JobConfig::default().with_stop_on_error(true);
    let id = service
        .submit(&items(4), JobPriority::High, config)
        .await
        .unwrap()
        .job_id;

    let details = wait_done(&service, id).await;
    service.stop_scheduler().await.unwrap();

    assert_eq!(details.status, JobStatus::Completed);
    assert_eq!(details.processed_count, 1);
    assert_eq!(details.failed_count, 1);
    assert_eq!(details.recent_errors[0].kind, ErrorKind::TargetRejected);
    assert_eq!(fetcher.calls().await, vec!["item-1", "item-2"]);

    let credential = service.pool().get("cred-0").await.unwrap();
    assert_eq!(credential.error_count, 0);
    assert!(credential.is_active);
}

#[tokio::test]
async fn test_repeated_faults_deactivate_credential() {
    let service = service_with(1, Arc::new(ScriptedFetcher::always(401))).await;
    service.start_scheduler().await.unwrap();

    let id = service
        .submit(&items(6), JobPriority::Normal, JobConfig::default())
        .await
        .unwrap()
        .job_id;

    let details = wait_done(&service, id).await;
    service.stop_scheduler().await.unwrap();

    assert_eq!(details.status, JobStatus::Completed);
    assert_eq!(details.failed_count, 6);

    let results = service.job_results(id, None).await.unwrap();
    let kinds: Vec<ErrorKind> = results.errors.iter().map(|e| e.kind).collect();
    assert!(kinds[..5].iter().all(|k| *k == ErrorKind::CredentialFault));
    assert_eq!(kinds[5], ErrorKind::CredentialExhausted);

    let credential = service.pool().get("cred-0").await.unwrap();
    assert!(!credential.is_active);
    assert_eq!(credential.error_count, 5);

    service.reactivate_credential("cred-0").await.unwrap();
    assert_eq!(service.credential_status().await.available_credentials, 1);
}

#[tokio::test]
async fn test_priority_order() {
    let queue = JobQueue::new();
    let low = queue
        .create_job(items(1), JobPriority::Low, JobConfig::default())
        .await
        .unwrap();
    let urgent = queue
        .create_job(items(1), JobPriority::Urgent, JobConfig::default())
        .await
        .unwrap();
    let normal = queue
        .create_job(items(1), JobPriority::Normal, JobConfig::default())
        .await
        .unwrap();

    let order: Vec<uuid::Uuid> = vec![
        queue.dequeue_next().await.unwrap().id,
        queue.dequeue_next().await.unwrap().id,
        queue.dequeue_next().await.unwrap().id,
    ];
    assert_eq!(order, vec![urgent, normal, low]);
    assert!(queue.dequeue_next().await.is_none());
}

#[tokio::test]
async fn test_shutdown_then_requeue_remaining() {
    let service = service_with(1, Arc::new(ScriptedFetcher::ok())).await;
    service.start_scheduler().await.unwrap();

    let config = JobConfig::default().with_delay_seconds(30.0);
    let id = service
        .submit(&items(3), JobPriority::Normal, config)
        .await
        .unwrap()
        .job_id;

    let started = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let details = service.job_details(id).await.unwrap();
            if details.processed_count >= 1 {
                return details;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first item should be processed");
    assert_eq!(started.status, JobStatus::Processing);

    service.stop_scheduler().await.unwrap();
    let stopped = service.job_details(id).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Processing);
    assert_eq!(stopped.processed_count, 1);

    let new_id = service.requeue_remaining(id).await.unwrap();
    let requeued = service.queue().get_job(new_id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.items, vec!["item-2", "item-3"]);

    let original = service.job_details(id).await.unwrap();
    assert_eq!(original.status, JobStatus::Failed);
    assert!(original
        .recent_errors
        .iter()
        .any(|e| e.message.contains("Stopped before completion")));
}

#[tokio::test]
async fn test_cancelled_job_is_never_processed() {
    let fetcher = Arc::new(ScriptedFetcher::ok());
    let service = service_with(1, Arc::clone(&fetcher)).await;

    let id = service
        .submit(&items(2), JobPriority::Normal, JobConfig::default())
        .await
        .unwrap()
        .job_id;
    assert!(service.cancel_job(id).await);

    service.start_scheduler().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.stop_scheduler().await.unwrap();

    assert_eq!(
        service.job_details(id).await.unwrap().status,
        JobStatus::Cancelled
    );
    assert!(fetcher.calls().await.is_empty());
}

#[tokio::test]
async fn test_memory_store_write_through() {
    let store = Arc::new(MemoryCredentialStore::new());
    let pool = CredentialPool::with_store(PoolConfig::default(), store.clone());
    pool.add("secret-a", Some("a")).await.unwrap();
    pool.acquire().await;
    pool.report_error("a", "401 Unauthorized", true).await;

    let stored = store.get("a").await.unwrap();
    assert_eq!(stored.daily_usage, 1);
    assert_eq!(stored.error_count, 1);

    let restored = CredentialPool::with_store(PoolConfig::default(), store.clone());
    assert_eq!(restored.load_from_store().await.unwrap(), 1);
    assert_eq!(restored.get("a").await.unwrap().total_usage, 1);
}

#[tokio::test]
async fn test_sqlite_service_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        scheduler: fast_scheduler_config(),
        database_url: Some(format!(
            "sqlite://{}",
            dir.path().join("quotaflow.db").display()
        )),
        ..AppConfig::default()
    };

    let service = Service::from_config(&config, Arc::new(ScriptedFetcher::ok()))
        .await
        .unwrap();
    service.add_credential("secret-a", Some("a")).await.unwrap();
    service.start_scheduler().await.unwrap();

    let id = service
        .submit(&items(3), JobPriority::Normal, JobConfig::default())
        .await
        .unwrap()
        .job_id;
    let details = wait_done(&service, id).await;
    service.stop_scheduler().await.unwrap();
    assert_eq!(details.status, JobStatus::Completed);

    let stored = service.stored_results(id).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[0].item, "item-1");

    let restarted = Service::from_config(&config, Arc::new(ScriptedFetcher::ok()))
        .await
        .unwrap();
    let credential = restarted.pool().get("a").await.unwrap();
    assert_eq!(credential.daily_usage, 3);
    assert_eq!(credential.total_usage, 3);
}
