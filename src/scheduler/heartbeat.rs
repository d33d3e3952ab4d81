//! Heartbeat scheduler: admission, health and cleanup loops.
//!
//! The [`Scheduler`] turns pending jobs into running processors within two
//! limits: `max_concurrent_jobs` and the pool's remaining daily capacity.
//! Zero capacity is ordinary back-pressure; admission simply waits for the
//! next tick.
//!
//! The three loops share one broadcast shutdown signal. Shutdown stops every
//! processor cooperatively, waits for each with a bound, then joins the loops.
//! Jobs whose processors were stopped stay `processing`; see
//! [`Scheduler::requeue_remaining`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::credentials::CredentialPool;
use crate::fetcher::Fetcher;
use crate::metrics::MetricsCollector;
use crate::storage::JobPersister;

use super::config::{ProcessorConfig, SchedulerConfig, SchedulerConfigPatch};
use super::processor::{ProcessorHandle, ProcessorReport, ProcessorStats, WorkProcessor};
use super::queue::{JobQueue, QueueError};

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Scheduler is already running.
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Scheduler is not running.
    #[error("Scheduler is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The job still has a live processor.
    #[error("Job {0} is still being processed")]
    JobActive(Uuid),

    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Rejected configuration update.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Runtime status of the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<f64>,
    pub active_processors: usize,
    pub processors: Vec<ProcessorStats>,
    /// Jobs whose processors have finished since start-up.
    pub jobs_processed: u64,
    /// Items with an outcome across those jobs.
    pub items_processed: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub config: SchedulerConfig,
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    /// Degraded conditions, empty when healthy.
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
    pub running: bool,
    pub available_credentials: usize,
    pub available_capacity: u64,
    pub pending_jobs: usize,
    pub active_processors: usize,
}

/// Counters updated as processors are reaped.
struct SharedSchedulerStats {
    jobs_processed: AtomicU64,
    items_processed: AtomicU64,
}

impl SharedSchedulerStats {
    fn new() -> Self {
        Self {
            jobs_processed: AtomicU64::new(0),
            items_processed: AtomicU64::new(0),
        }
    }

    fn record(&self, report: &ProcessorReport) {
        self.jobs_processed.fetch_add(1, Ordering::SeqCst);
        self.items_processed
            .fetch_add(report.attempted() as u64, Ordering::SeqCst);
    }
}

/// The heartbeat orchestrator.
pub struct Scheduler {
    config: RwLock<SchedulerConfig>,
    pool: Arc<CredentialPool>,
    queue: Arc<JobQueue>,
    fetcher: Arc<dyn Fetcher>,
    persister: Option<Arc<dyn JobPersister>>,
    processors: Mutex<HashMap<Uuid, ProcessorHandle>>,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    is_running: AtomicBool,
    started_at: RwLock<Option<DateTime<Utc>>>,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    stats: SharedSchedulerStats,
    metrics: MetricsCollector,
}

impl Scheduler {
    /// Creates a stopped scheduler over a shared pool and queue.
    pub fn new(
        config: SchedulerConfig,
        pool: Arc<CredentialPool>,
        queue: Arc<JobQueue>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config: RwLock::new(config),
            pool,
            queue,
            fetcher,
            persister: None,
            processors: Mutex::new(HashMap::new()),
            loop_handles: Mutex::new(Vec::new()),
            shutdown_tx,
            is_running: AtomicBool::new(false),
            started_at: RwLock::new(None),
            last_health_check: RwLock::new(None),
            stats: SharedSchedulerStats::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Hands every admitted processor a result sink.
    pub fn with_persister(mut self, persister: Arc<dyn JobPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub async fn config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Starts the three loops.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` if the loops are already up.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        *self.started_at.write().await = Some(Utc::now());

        let handles = vec![
            tokio::spawn(Arc::clone(self).admission_loop(self.shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(self).health_loop(self.shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(self).cleanup_loop(self.shutdown_tx.subscribe())),
        ];
        self.loop_handles.lock().await.extend(handles);

        let config = self.config.read().await;
        info!(
            polling_interval_secs = config.polling_interval_secs,
            max_concurrent_jobs = config.max_concurrent_jobs,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stops all processors, then the loops.
    ///
    /// Every join is bounded by `shutdown_timeout`. Jobs whose processors were
    /// interrupted remain `processing`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotRunning` if the scheduler was not started,
    /// or `SchedulerError::ShutdownTimeout` if a processor or loop did not
    /// exit in time.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        info!("Initiating scheduler shutdown");
        let timeout = self.config.read().await.shutdown_timeout();

        // Ignore send error - loops may have already stopped
        let _ = self.shutdown_tx.send(());

        let processors: Vec<ProcessorHandle> =
            self.processors.lock().await.drain().map(|(_, h)| h).collect();
        for handle in &processors {
            handle.stop();
        }

        let joins = processors.into_iter().map(|handle| async move {
            let job_id = handle.job_id();
            (job_id, tokio::time::timeout(timeout, handle.join()).await)
        });

        let mut timed_out = false;
        for (job_id, outcome) in futures::future::join_all(joins).await {
            match outcome {
                Ok(report) => {
                    self.stats.record(&report);
                    info!(
                        job_id = %job_id,
                        state = ?report.state,
                        attempted = report.attempted(),
                        "Processor stopped"
                    );
                }
                Err(_) => {
                    warn!(job_id = %job_id, "Processor did not stop in time");
                    timed_out = true;
                }
            }
        }
        self.metrics.set_active_processors(0);

        let loops: Vec<JoinHandle<()>> = self.loop_handles.lock().await.drain(..).collect();
        let join_loops = async {
            for handle in loops {
                if let Err(e) = handle.await {
                    error!(error = %e, "Scheduler loop panicked during shutdown");
                }
            }
        };
        if tokio::time::timeout(timeout, join_loops).await.is_err() {
            timed_out = true;
        }

        if timed_out {
            return Err(SchedulerError::ShutdownTimeout(timeout));
        }
        info!("Scheduler shutdown complete");
        Ok(())
    }

    async fn admission_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!("Admission loop started");
        loop {
            self.admission_tick().await;

            let interval = self.config.read().await.polling_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("Admission loop stopped");
    }

    async fn health_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!("Health loop started");
        loop {
            let interval = self.config.read().await.health_check_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.recv() => break,
            }
            self.health_check().await;
        }
        debug!("Health loop stopped");
    }

    async fn cleanup_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!("Cleanup loop started");
        loop {
            let interval = self.config.read().await.cleanup_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.recv() => break,
            }
            self.cleanup().await;
        }
        debug!("Cleanup loop stopped");
    }

    /// One admission pass: reap finished processors, then admit at most one
    /// job if a slot and credential capacity are available.
    ///
    /// Returns the admitted job id.
    pub(crate) async fn admission_tick(&self) -> Option<Uuid> {
        self.reap_finished().await;

        let config = self.config.read().await.clone();
        let active = self.processors.lock().await.len();
        if active >= config.max_concurrent_jobs {
            debug!(active = active, "All processor slots busy");
            return None;
        }

        let capacity = self.pool.available_capacity().await;
        self.metrics.set_available_capacity(capacity);
        if capacity == 0 {
            debug!("No credential capacity, skipping admission");
            return None;
        }

        let job = self.queue.dequeue_next().await?;
        let job_id = job.id;
        let processor_config = ProcessorConfig::merged(&config, &job.config);

        let mut processor = WorkProcessor::new(
            job,
            processor_config,
            Arc::clone(&self.pool),
            Arc::clone(&self.queue),
            Arc::clone(&self.fetcher),
        );
        if let Some(persister) = &self.persister {
            processor = processor.with_persister(Arc::clone(persister));
        }

        let handle = processor.spawn();
        let mut processors = self.processors.lock().await;
        processors.insert(job_id, handle);
        let active = processors.len();
        drop(processors);

        self.metrics.set_active_processors(active);
        info!(job_id = %job_id, active = active, "Admitted job");
        Some(job_id)
    }

    /// Removes finished processors and folds their reports into the stats.
    async fn reap_finished(&self) {
        let finished: Vec<ProcessorHandle> = {
            let mut processors = self.processors.lock().await;
            let done: Vec<Uuid> = processors
                .iter()
                .filter(|(_, h)| h.is_finished())
                .map(|(id, _)| *id)
                .collect();
            done.iter().filter_map(|id| processors.remove(id)).collect()
        };

        if finished.is_empty() {
            return;
        }

        for handle in finished {
            let report = handle.join().await;
            self.stats.record(&report);
            debug!(
                job_id = %report.job_id,
                state = ?report.state,
                processed = report.processed,
                failed = report.failed,
                "Reaped processor"
            );
        }

        let active = self.processors.lock().await.len();
        self.metrics.set_active_processors(active);
    }

    /// Snapshots pool and queue health and logs degraded conditions.
    pub async fn health_check(&self) -> HealthReport {
        let report = self.health_report().await;
        *self.last_health_check.write().await = Some(report.checked_at);

        self.metrics.set_available_capacity(report.available_capacity);
        self.metrics.set_pending_jobs(report.pending_jobs);

        for issue in &report.issues {
            warn!(issue = %issue, "Health check degraded");
        }
        debug!(
            available_credentials = report.available_credentials,
            pending_jobs = report.pending_jobs,
            active_processors = report.active_processors,
            "Health check complete"
        );
        report
    }

    /// Current health without touching the last-check timestamp.
    pub async fn health_report(&self) -> HealthReport {
        let pool_status = self.pool.status().await;
        let queue_status = self.queue.status().await;
        let threshold = self.config.read().await.pending_backlog_warning;
        let active_processors = self.processors.lock().await.len();
        let pending_jobs = queue_status.count(super::job::JobStatus::Pending);
        let running = self.is_running();

        let mut issues = Vec::new();
        if !running {
            issues.push("Scheduler is not running".to_string());
        }
        if pool_status.available_credentials == 0 {
            issues.push("No available credentials".to_string());
        }
        if pending_jobs > threshold {
            issues.push(format!(
                "Pending backlog of {} jobs exceeds {}",
                pending_jobs, threshold
            ));
        }

        HealthReport {
            healthy: issues.is_empty(),
            issues,
            checked_at: Utc::now(),
            running,
            available_credentials: pool_status.available_credentials,
            available_capacity: pool_status.available_capacity,
            pending_jobs,
            active_processors,
        }
    }

    /// Purges old terminal jobs. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let max_age = self.config.read().await.max_job_age_hours;
        self.queue.cleanup(max_age).await
    }

    /// Runtime status and per-processor statistics.
    pub async fn service_status(&self) -> ServiceStatus {
        let started_at = *self.started_at.read().await;
        let running = self.is_running();

        let mut processors = Vec::new();
        {
            let handles = self.processors.lock().await;
            for handle in handles.values() {
                processors.push(handle.stats().await);
            }
        }
        processors.sort_by_key(|s| s.job_id);

        ServiceStatus {
            running,
            started_at,
            uptime_seconds: started_at
                .filter(|_| running)
                .map(|at| (Utc::now() - at).num_milliseconds() as f64 / 1000.0),
            active_processors: processors.len(),
            processors,
            jobs_processed: self.stats.jobs_processed.load(Ordering::SeqCst),
            items_processed: self.stats.items_processed.load(Ordering::SeqCst),
            last_health_check: *self.last_health_check.read().await,
            config: self.config.read().await.clone(),
        }
    }

    /// Applies a partial configuration update. Loops pick it up on their next
    /// tick; running processors keep the settings they were admitted with.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Config` if the patched configuration is invalid.
    pub async fn update_config(
        &self,
        patch: &SchedulerConfigPatch,
    ) -> Result<SchedulerConfig, SchedulerError> {
        let mut config = self.config.write().await;
        let updated = patch.apply_to(&config);
        updated.validate()?;
        *config = updated.clone();
        drop(config);

        info!(config = ?updated, "Scheduler configuration updated");
        Ok(updated)
    }

    /// Requests a cooperative stop of the processor working on `job_id`.
    ///
    /// Returns `false` if no processor is running that job.
    pub async fn stop_processor(&self, job_id: Uuid) -> bool {
        match self.processors.lock().await.get(&job_id) {
            Some(handle) => {
                handle.stop();
                info!(job_id = %job_id, "Stop requested for processor");
                true
            }
            None => false,
        }
    }

    /// Fails a job left `processing` by a stopped processor and resubmits its
    /// unattempted items as a new pending job.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::JobActive` while a processor still runs the
    /// job, or the underlying queue error.
    pub async fn requeue_remaining(&self, job_id: Uuid) -> Result<Uuid, SchedulerError> {
        self.reap_finished().await;
        if self.processors.lock().await.contains_key(&job_id) {
            return Err(SchedulerError::JobActive(job_id));
        }
        Ok(self.queue.requeue_remaining(job_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::PoolConfig;
    use crate::fetcher::FetchError;
    use crate::scheduler::job::{JobConfig, JobPriority, JobStatus};
    use async_trait::async_trait;

    struct EchoFetcher;

    #[async_trait]
    impl Fetcher for EchoFetcher {
        async fn fetch(&self, item: &str, _secret: &str) -> Result<serde_json::Value, FetchError> {
            Ok(serde_json::json!({ "item": item }))
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_polling_interval(Duration::from_millis(20))
            .with_delay_between_items(Duration::ZERO)
            .with_long_break(0, Duration::ZERO)
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    async fn scheduler(credentials: usize, config: SchedulerConfig) -> Arc<Scheduler> {
        let pool = Arc::new(CredentialPool::new(PoolConfig::default()));
        for i in 0..credentials {
            pool.add(&format!("secret-{}", i), None).await.unwrap();
        }
        Arc::new(Scheduler::new(
            config,
            pool,
            Arc::new(JobQueue::new()),
            Arc::new(EchoFetcher),
        ))
    }

    async fn wait_terminal(queue: &JobQueue, id: Uuid) -> JobStatus {
        for _ in 0..200 {
            let status = queue.get_job(id).await.map(|j| j.status);
            if let Some(status) = status.filter(|s| s.is_terminal()) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn test_admission_respects_capacity() {
        let sched = scheduler(0, fast_config()).await;
        let id = sched
            .queue
            .create_job(vec!["a".into()], JobPriority::Normal, JobConfig::default())
            .await
            .unwrap();

        assert!(sched.admission_tick().await.is_none());
        assert_eq!(sched.queue.get_job(id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_admission_respects_max_concurrent() {
        let config = fast_config()
            .with_max_concurrent_jobs(1)
            .with_delay_between_items(Duration::from_secs(30));
        let sched = scheduler(1, config).await;
        for _ in 0..2 {
            sched
                .queue
                .create_job(
                    vec!["a".into(), "b".into()],
                    JobPriority::Normal,
                    JobConfig::default(),
                )
                .await
                .unwrap();
        }

        assert!(sched.admission_tick().await.is_some());
        assert!(sched.admission_tick().await.is_none());
        assert_eq!(sched.service_status().await.active_processors, 1);

        sched.is_running.store(true, Ordering::SeqCst);
        sched.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_admission_survives_oversized_job_delay() {
        let sched = scheduler(1, fast_config()).await;
        let job = JobConfig::new().with_delay_seconds(1e20);
        let id = sched
            .queue
            .create_job(vec!["a".into(), "b".into()], JobPriority::Normal, job)
            .await
            .unwrap();

        assert_eq!(sched.admission_tick().await, Some(id));
        assert_eq!(sched.service_status().await.active_processors, 1);

        sched.is_running.store(true, Ordering::SeqCst);
        sched.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_config_rejects_oversized_interval() {
        let sched = scheduler(0, fast_config()).await;
        let patch = SchedulerConfigPatch {
            cleanup_interval_secs: Some(1e20),
            ..Default::default()
        };

        assert!(matches!(
            sched.update_config(&patch).await,
            Err(SchedulerError::Config(_))
        ));
        assert_eq!(sched.config().await.cleanup_interval_secs, 1800.0);
    }

    #[tokio::test]
    async fn test_runs_job_to_completion() {
        let sched = scheduler(2, fast_config()).await;
        sched.start().await.unwrap();

        let id = sched
            .queue
            .create_job(
                vec!["a".into(), "b".into(), "c".into()],
                JobPriority::High,
                JobConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(wait_terminal(&sched.queue, id).await, JobStatus::Completed);
        sched.shutdown().await.unwrap();

        let status = sched.service_status().await;
        assert!(!status.running);
        assert_eq!(status.jobs_processed, 1);
        assert_eq!(status.items_processed, 3);
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_twice() {
        let sched = scheduler(1, fast_config()).await;
        sched.start().await.unwrap();
        assert!(matches!(
            sched.start().await,
            Err(SchedulerError::AlreadyRunning)
        ));

        sched.shutdown().await.unwrap();
        assert!(matches!(
            sched.shutdown().await,
            Err(SchedulerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_health_report_flags_issues() {
        let sched = scheduler(0, fast_config().with_pending_backlog_warning(0)).await;
        sched
            .queue
            .create_job(vec!["a".into()], JobPriority::Low, JobConfig::default())
            .await
            .unwrap();

        let report = sched.health_check().await;
        assert!(!report.healthy);
        assert_eq!(report.issues.len(), 3);
        assert!(sched.service_status().await.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_update_config_validates() {
        let sched = scheduler(1, fast_config()).await;

        let patch = SchedulerConfigPatch {
            max_concurrent_jobs: Some(9),
            ..Default::default()
        };
        let updated = sched.update_config(&patch).await.unwrap();
        assert_eq!(updated.max_concurrent_jobs, 9);

        let bad = SchedulerConfigPatch {
            requests_per_credential: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            sched.update_config(&bad).await,
            Err(SchedulerError::Config(_))
        ));
        assert_eq!(sched.config().await.max_concurrent_jobs, 9);
    }

    #[tokio::test]
    async fn test_requeue_rejects_active_job() {
        let config = fast_config().with_delay_between_items(Duration::from_secs(30));
        let sched = scheduler(1, config).await;
        let id = sched
            .queue
            .create_job(
                vec!["a".into(), "b".into(), "c".into()],
                JobPriority::Normal,
                JobConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(sched.admission_tick().await, Some(id));

        assert!(matches!(
            sched.requeue_remaining(id).await,
            Err(SchedulerError::JobActive(_))
        ));

        sched.is_running.store(true, Ordering::SeqCst);
        sched.shutdown().await.unwrap();
        assert_eq!(sched.queue.get_job(id).await.unwrap().status, JobStatus::Processing);

        let new_id = sched.requeue_remaining(id).await.unwrap();
        let requeued = sched.queue.get_job(new_id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert!(requeued.total_items() >= 1);
        assert_eq!(sched.queue.get_job(id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_stop_processor_unknown_job() {
        let sched = scheduler(1, fast_config()).await;
        assert!(!sched.stop_processor(Uuid::new_v4()).await);
    }
}
