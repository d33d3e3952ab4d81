//! Drives one job through its items.
//!
//! A [`WorkProcessor`] walks the items of a single job in order: validate,
//! acquire a credential, fetch, classify, report progress, throttle. It never
//! mutates the job directly; every change goes through the [`JobQueue`].
//!
//! Stopping is cooperative. [`ProcessorHandle::stop`] raises a flag that the
//! loop checks between items and wakes any throttle sleep; an in-flight fetch
//! is allowed to finish. A stopped processor leaves its job in `processing`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::credentials::{Acquisition, CredentialPool};
use crate::fetcher::{classify, Fetcher};
use crate::metrics::MetricsCollector;
use crate::storage::JobPersister;
use crate::validation::{validate_item, ItemFormat};

use super::config::ProcessorConfig;
use super::job::{ErrorKind, Job, WorkError, WorkResult};
use super::queue::{JobQueue, ProgressUpdate};

/// Characters of the credential id exposed in stats.
const CREDENTIAL_PREFIX_CHARS: usize = 12;

/// Errors that end a processing loop and fail its job.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The queue refused a progress update, so the job is gone or no longer
    /// processing.
    #[error("Job {0} is no longer tracked as processing")]
    JobLost(Uuid),

    /// The processing task panicked or was aborted.
    #[error("Processor task crashed: {0}")]
    Crashed(String),
}

/// Lifecycle of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorState {
    Idle = 0,
    Running = 1,
    Completed = 2,
    Stopped = 3,
    Failed = 4,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessorState::Idle,
            1 => ProcessorState::Running,
            2 => ProcessorState::Completed,
            3 => ProcessorState::Stopped,
            _ => ProcessorState::Failed,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ProcessorState::Completed | ProcessorState::Stopped | ProcessorState::Failed
        )
    }
}

/// Live statistics of a processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub job_id: Uuid,
    pub total_items: usize,
    pub processed: usize,
    pub failed: usize,
    /// Index of the next item to handle.
    pub current_index: usize,
    pub progress_percentage: f64,
    pub state: ProcessorState,
    /// Truncated id of the credential in use.
    pub current_credential: Option<String>,
    /// Consecutive requests made on the current credential.
    pub session_requests: u32,
    pub requests_per_credential: u32,
}

/// Final outcome of a processor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorReport {
    pub job_id: Uuid,
    pub state: ProcessorState,
    pub processed: usize,
    pub failed: usize,
}

impl ProcessorReport {
    /// Items that received an outcome.
    pub fn attempted(&self) -> usize {
        self.processed + self.failed
    }
}

/// State shared between a running loop and its handle.
struct ProcessorShared {
    job_id: Uuid,
    total_items: usize,
    requests_per_credential: u32,
    state: AtomicU8,
    stop_requested: AtomicBool,
    wake: Notify,
    processed: AtomicUsize,
    failed: AtomicUsize,
    current_index: AtomicUsize,
    session_requests: AtomicU32,
    current_credential: Mutex<Option<String>>,
}

impl ProcessorShared {
    fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        // stores a permit if the loop is not sleeping yet
        self.wake.notify_one();
    }

    fn report(&self) -> ProcessorReport {
        ProcessorReport {
            job_id: self.job_id,
            state: self.state(),
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    async fn stats(&self) -> ProcessorStats {
        let processed = self.processed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let progress_percentage = if self.total_items == 0 {
            100.0
        } else {
            ((processed + failed) as f64 / self.total_items as f64 * 10000.0).round() / 100.0
        };

        ProcessorStats {
            job_id: self.job_id,
            total_items: self.total_items,
            processed,
            failed,
            current_index: self.current_index.load(Ordering::SeqCst),
            progress_percentage,
            state: self.state(),
            current_credential: self
                .current_credential
                .lock()
                .await
                .as_deref()
                .map(|id| id.chars().take(CREDENTIAL_PREFIX_CHARS).collect()),
            session_requests: self.session_requests.load(Ordering::SeqCst),
            requests_per_credential: self.requests_per_credential,
        }
    }
}

/// How the item loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// Every item has an outcome.
    Finished,
    /// An item failed with stop-on-error set.
    StoppedOnError,
    /// A stop was requested.
    Cancelled,
}

/// Processes the items of one job.
pub struct WorkProcessor {
    job: Job,
    config: ProcessorConfig,
    pool: Arc<CredentialPool>,
    queue: Arc<JobQueue>,
    fetcher: Arc<dyn Fetcher>,
    persister: Option<Arc<dyn JobPersister>>,
    shared: Arc<ProcessorShared>,
    metrics: MetricsCollector,
}

impl WorkProcessor {
    /// Creates an idle processor for a job already marked processing.
    pub fn new(
        job: Job,
        config: ProcessorConfig,
        pool: Arc<CredentialPool>,
        queue: Arc<JobQueue>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let shared = Arc::new(ProcessorShared {
            job_id: job.id,
            total_items: job.total_items(),
            requests_per_credential: config.requests_per_credential,
            state: AtomicU8::new(ProcessorState::Idle as u8),
            stop_requested: AtomicBool::new(false),
            wake: Notify::new(),
            processed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            current_index: AtomicUsize::new(0),
            session_requests: AtomicU32::new(0),
            current_credential: Mutex::new(None),
        });

        Self {
            job,
            config,
            pool,
            queue,
            fetcher,
            persister: None,
            shared,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets a sink for successful results.
    pub fn with_persister(mut self, persister: Arc<dyn JobPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.state()
    }

    /// Starts the processor on its own task.
    ///
    /// A panic inside the loop fails the job instead of leaving it processing.
    pub fn spawn(self) -> ProcessorHandle {
        let shared = Arc::clone(&self.shared);
        let queue = Arc::clone(&self.queue);
        let job_id = self.job.id;
        shared.set_state(ProcessorState::Running);

        let inner = tokio::spawn(self.run());
        let guard = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            match inner.await {
                Ok(report) => report,
                Err(e) => {
                    let err = ProcessorError::Crashed(e.to_string());
                    error!(job_id = %job_id, error = %err, "Processor crashed");
                    queue.fail(job_id, &err.to_string()).await;
                    guard.set_state(ProcessorState::Failed);
                    guard.report()
                }
            }
        });

        ProcessorHandle {
            job_id,
            shared,
            task,
        }
    }

    /// Runs the job to the end on the current task.
    pub async fn run(mut self) -> ProcessorReport {
        let job_id = self.job.id;
        self.shared.set_state(ProcessorState::Running);
        info!(
            job_id = %job_id,
            items = self.job.total_items(),
            requests_per_credential = self.config.requests_per_credential,
            "Processor started"
        );

        let state = match self.process_items().await {
            Ok(LoopExit::Cancelled) => {
                info!(job_id = %job_id, "Processor stopped, job left processing");
                ProcessorState::Stopped
            }
            Ok(exit) => {
                if exit == LoopExit::StoppedOnError {
                    info!(job_id = %job_id, "Stopping job after failed item");
                }
                self.queue.complete(job_id, None, None).await;
                ProcessorState::Completed
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Processor failed");
                self.queue.fail(job_id, &e.to_string()).await;
                ProcessorState::Failed
            }
        };

        self.shared.set_state(state);
        let report = self.shared.report();
        debug!(
            job_id = %job_id,
            state = ?report.state,
            processed = report.processed,
            failed = report.failed,
            "Processor finished"
        );
        report
    }

    async fn process_items(&mut self) -> Result<LoopExit, ProcessorError> {
        let items = std::mem::take(&mut self.job.items);
        let total = items.len();
        let mut current_credential: Option<String> = None;
        let mut processed = 0usize;
        let mut failed = 0usize;

        for (index, raw_item) in items.iter().enumerate() {
            if self.shared.is_stop_requested() {
                return Ok(LoopExit::Cancelled);
            }

            let item_number = index + 1;
            self.shared.current_index.store(index, Ordering::SeqCst);

            let outcome = self
                .process_item(raw_item, item_number, &mut current_credential)
                .await;

            let mut update = ProgressUpdate {
                current_item: Some(raw_item.clone()),
                ..Default::default()
            };
            let item_failed = match outcome {
                Ok(result) => {
                    processed += 1;
                    self.metrics.record_item(None);
                    update.new_results.push(result);
                    false
                }
                Err(work_error) => {
                    failed += 1;
                    self.metrics.record_item(Some(work_error.kind));
                    update.new_errors.push(work_error);
                    true
                }
            };
            update.processed_count = processed;
            update.failed_count = failed;

            self.shared.processed.store(processed, Ordering::SeqCst);
            self.shared.failed.store(failed, Ordering::SeqCst);
            self.shared.current_index.store(item_number, Ordering::SeqCst);

            if !self.queue.update_progress(self.job.id, update).await {
                return Err(ProcessorError::JobLost(self.job.id));
            }

            if item_failed && self.config.stop_on_error {
                return Ok(LoopExit::StoppedOnError);
            }

            if item_number < total {
                self.throttle(item_number).await;
            }
        }

        Ok(LoopExit::Finished)
    }

    /// Handles one item and returns its outcome entry.
    async fn process_item(
        &self,
        raw_item: &str,
        item_number: usize,
        current_credential: &mut Option<String>,
    ) -> Result<WorkResult, WorkError> {
        let job_id = self.job.id;

        let item = validate_item(raw_item, ItemFormat::Any).map_err(|e| {
            debug!(job_id = %job_id, item_number = item_number, error = %e, "Invalid item");
            WorkError::for_item(raw_item, item_number, ErrorKind::DataValidation, e.to_string(), None)
        })?;

        let acquisition = self
            .pool
            .acquire_rotating(
                current_credential.as_deref(),
                self.config.requests_per_credential,
            )
            .await;
        let (credential_id, secret) = match acquisition {
            Acquisition::Granted { id, secret } => (id, secret),
            Acquisition::Exhausted => {
                warn!(job_id = %job_id, item_number = item_number, "No available credential");
                return Err(WorkError::for_item(
                    item,
                    item_number,
                    ErrorKind::CredentialExhausted,
                    "No available credential",
                    None,
                ));
            }
        };
        self.track_credential(current_credential, &credential_id)
            .await;

        match self.fetcher.fetch(&item, &secret).await {
            Ok(payload) => {
                self.pool.report_success(&credential_id).await;

                let mut result = WorkResult {
                    job_id,
                    item,
                    item_number,
                    credential_id,
                    payload,
                    timestamp: chrono::Utc::now(),
                    persisted: None,
                };
                if let Some(persister) = &self.persister {
                    let saved = persister.save(&result).await;
                    if !saved {
                        warn!(job_id = %job_id, item_number = item_number, "Result not persisted");
                    }
                    result.persisted = Some(saved);
                }
                debug!(job_id = %job_id, item_number = item_number, "Item fetched");
                Ok(result)
            }
            Err(fetch_error) => {
                let kind = classify(&fetch_error);
                let message = fetch_error.to_string();

                if kind.penalizes_credential() {
                    warn!(
                        job_id = %job_id,
                        credential_id = %credential_id,
                        error = %message,
                        "Credential fault"
                    );
                    self.pool.report_error(&credential_id, &message, true).await;
                } else {
                    debug!(
                        job_id = %job_id,
                        item_number = item_number,
                        kind = %kind,
                        error = %message,
                        "Item failed"
                    );
                }

                Err(WorkError::for_item(
                    item,
                    item_number,
                    kind,
                    message,
                    Some(credential_id),
                ))
            }
        }
    }

    /// Updates the rotation session after a grant.
    async fn track_credential(&self, current: &mut Option<String>, granted: &str) {
        if current.as_deref() == Some(granted) {
            self.shared.session_requests.fetch_add(1, Ordering::SeqCst);
        } else {
            self.shared.session_requests.store(1, Ordering::SeqCst);
            *current = Some(granted.to_string());
            *self.shared.current_credential.lock().await = Some(granted.to_string());
        }
    }

    /// Sleeps between items; returns early when a stop is requested.
    async fn throttle(&self, item_number: usize) {
        self.pause(self.config.delay).await;

        let every = self.config.long_break_interval as usize;
        if every > 0 && item_number % every == 0 {
            debug!(
                job_id = %self.job.id,
                item_number = item_number,
                secs = self.config.long_break.as_secs_f64(),
                "Taking long break"
            );
            self.pause(self.config.long_break).await;
        }
    }

    async fn pause(&self, duration: Duration) {
        if duration.is_zero() || self.shared.is_stop_requested() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shared.wake.notified() => {}
        }
    }
}

/// Handle to a spawned processor.
pub struct ProcessorHandle {
    job_id: Uuid,
    shared: Arc<ProcessorShared>,
    task: JoinHandle<ProcessorReport>,
}

impl ProcessorHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Requests a cooperative stop.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.state()
    }

    /// Returns whether the processor task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn stats(&self) -> ProcessorStats {
        self.shared.stats().await
    }

    /// Waits for the processor to exit.
    pub async fn join(self) -> ProcessorReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "Processor task aborted");
                self.shared.set_state(ProcessorState::Failed);
                self.shared.report()
            }
        }
    }
}
