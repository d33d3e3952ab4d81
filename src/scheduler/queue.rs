//! In-memory priority job queue with lifecycle tracking.
//!
//! Pending jobs are ordered by a binary heap keyed on `(-priority, sequence)`,
//! so higher priorities dequeue first and equal priorities dequeue in
//! submission order. Cancelled jobs are never removed from the heap; their
//! entries become tombstones that are skipped on pop.
//!
//! All mutations go through one lock scoped to the queue. Lookups for unknown
//! ids return `false` / `None` rather than an error.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;

use super::job::{
    Job, JobConfig, JobDetails, JobPriority, JobResults, JobStatus, WorkError, WorkResult,
};

/// Default number of terminal jobs retained.
pub const DEFAULT_MAX_COMPLETED_JOBS: usize = 1000;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A job must contain at least one item.
    #[error("Job has no items")]
    EmptyJob,

    /// Job not found in the queue.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    /// The job is not in a state that allows the operation.
    #[error("Job {id} is {status}, expected {expected}")]
    InvalidState {
        id: Uuid,
        status: JobStatus,
        expected: JobStatus,
    },

    /// Every item of the job already has an outcome.
    #[error("Job {0} has no remaining items")]
    NothingRemaining(Uuid),
}

/// Incremental progress reported by a processor.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub processed_count: usize,
    pub failed_count: usize,
    pub current_item: Option<String>,
    pub new_results: Vec<WorkResult>,
    pub new_errors: Vec<WorkError>,
}

/// Lifetime counters of the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub total_jobs_created: u64,
    pub total_jobs_completed: u64,
    pub total_jobs_failed: u64,
    pub total_items_processed: u64,
    pub total_items_failed: u64,
    /// Completed jobs over created jobs, in percent.
    pub success_rate: f64,
    /// Processed items over items with an outcome, in percent.
    pub item_success_rate: f64,
    pub average_processing_time_seconds: f64,
}

/// Aggregate queue status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Heap entries, including tombstones not yet popped.
    pub queue_size: usize,
    pub total_jobs: usize,
    pub status_breakdown: HashMap<JobStatus, usize>,
    pub priority_breakdown: HashMap<JobPriority, usize>,
    pub statistics: QueueStatistics,
}

impl QueueStatus {
    /// Number of jobs in the given status.
    pub fn count(&self, status: JobStatus) -> usize {
        self.status_breakdown.get(&status).copied().unwrap_or(0)
    }
}

type HeapKey = Reverse<(i8, u64, Uuid)>;

#[derive(Default)]
struct Counters {
    created: u64,
    completed: u64,
    failed: u64,
    items_processed: u64,
    items_failed: u64,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, Job>,
    /// Submission sequence of each job, for stable ordering.
    sequence: HashMap<Uuid, u64>,
    pending: BinaryHeap<HeapKey>,
    next_seq: u64,
    counters: Counters,
}

impl QueueState {
    fn pending_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }

    fn remove(&mut self, id: &Uuid) {
        self.jobs.remove(id);
        self.sequence.remove(id);
    }

    /// Registers a new pending job behind every earlier submission.
    fn enqueue(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending
            .push(Reverse((-(job.priority.weight() as i8), seq, job.id)));
        self.sequence.insert(job.id, seq);
        self.jobs.insert(job.id, job);
        self.counters.created += 1;
    }

    /// Moves a processing job to failed. Returns its processing time, or
    /// `None` for unknown or non-processing jobs.
    fn mark_failed(&mut self, id: Uuid, message: &str) -> Option<f64> {
        let job = self.jobs.get_mut(&id)?;
        if job.status != JobStatus::Processing {
            return None;
        }

        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.current_item = None;
        job.errors.push(WorkError::for_job(message));

        let (processed, failed) = (job.processed_count, job.failed_count);
        let duration = job.processing_time(Utc::now()).unwrap_or(0.0);

        self.counters.failed += 1;
        self.counters.items_processed += processed as u64;
        self.counters.items_failed += failed as u64;
        Some(duration)
    }

    /// Drops the oldest terminal jobs beyond `max`. Returns how many went.
    fn enforce_retention(&mut self, max: usize) -> usize {
        let mut terminal: Vec<(Uuid, chrono::DateTime<Utc>)> = self
            .jobs
            .values()
            .filter(|j| j.is_terminal())
            .map(|j| (j.id, j.completed_at.unwrap_or(j.created_at)))
            .collect();

        if terminal.len() <= max {
            return 0;
        }

        terminal.sort_by_key(|(_, at)| *at);
        let excess = terminal.len() - max;
        for (id, _) in terminal.iter().take(excess) {
            self.remove(id);
        }
        excess
    }
}

/// Thread-safe job queue.
pub struct JobQueue {
    state: RwLock<QueueState>,
    max_completed_jobs: usize,
    metrics: MetricsCollector,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    /// Creates an empty queue retaining up to 1000 terminal jobs.
    pub fn new() -> Self {
        Self::with_max_completed_jobs(DEFAULT_MAX_COMPLETED_JOBS)
    }

    /// Creates an empty queue with a custom retention cap.
    pub fn with_max_completed_jobs(max_completed_jobs: usize) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            max_completed_jobs,
            metrics: MetricsCollector::new(),
        }
    }

    /// Submits a new pending job.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::EmptyJob` if `items` is empty.
    pub async fn create_job(
        &self,
        items: Vec<String>,
        priority: JobPriority,
        config: JobConfig,
    ) -> Result<Uuid, QueueError> {
        if items.is_empty() {
            return Err(QueueError::EmptyJob);
        }

        let job = Job::new(items, priority, config);
        let id = job.id;
        let total = job.total_items();

        let mut state = self.state.write().await;
        state.enqueue(job);
        let pending = state.pending_count();
        drop(state);

        self.metrics.set_pending_jobs(pending);
        info!(job_id = %id, items = total, priority = %priority, "Created job");
        Ok(id)
    }

    /// Pops the next pending job and marks it processing.
    ///
    /// Heap entries whose job is no longer pending are discarded.
    pub async fn dequeue_next(&self) -> Option<Job> {
        let mut state = self.state.write().await;

        while let Some(Reverse((_, _, id))) = state.pending.pop() {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Pending {
                debug!(job_id = %id, status = %job.status, "Skipping stale queue entry");
                continue;
            }

            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            let snapshot = job.clone();
            let pending = state.pending_count();
            drop(state);

            self.metrics.set_pending_jobs(pending);
            info!(job_id = %id, priority = %snapshot.priority, "Dequeued job");
            return Some(snapshot);
        }

        None
    }

    /// Applies incremental progress to a processing job.
    ///
    /// Returns `false` if the job is unknown or not processing, or if the
    /// counts would exceed the number of items.
    pub async fn update_progress(&self, id: Uuid, update: ProgressUpdate) -> bool {
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return false;
        };

        if job.status != JobStatus::Processing {
            return false;
        }
        if update.processed_count + update.failed_count > job.total_items() {
            warn!(
                job_id = %id,
                processed = update.processed_count,
                failed = update.failed_count,
                total = job.total_items(),
                "Rejected progress beyond item count"
            );
            return false;
        }

        job.processed_count = update.processed_count;
        job.failed_count = update.failed_count;
        job.current_item = update.current_item;
        job.results.extend(update.new_results);
        job.errors.extend(update.new_errors);
        true
    }

    /// Marks a processing job completed.
    ///
    /// When given, `final_results` and `final_errors` replace the accumulated
    /// entries. Returns `false` for unknown or non-processing jobs.
    pub async fn complete(
        &self,
        id: Uuid,
        final_results: Option<Vec<WorkResult>>,
        final_errors: Option<Vec<WorkError>>,
    ) -> bool {
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return false;
        };
        if job.status != JobStatus::Processing {
            return false;
        }

        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.current_item = None;
        if let Some(results) = final_results {
            job.results = results;
        }
        if let Some(errors) = final_errors {
            job.errors = errors;
        }

        let (processed, failed) = (job.processed_count, job.failed_count);
        let duration = job.processing_time(Utc::now()).unwrap_or(0.0);

        state.counters.completed += 1;
        state.counters.items_processed += processed as u64;
        state.counters.items_failed += failed as u64;
        let purged = state.enforce_retention(self.max_completed_jobs);
        drop(state);

        self.metrics.record_job_finished(JobStatus::Completed, duration);
        if purged > 0 {
            debug!(purged = purged, "Purged oldest completed jobs");
        }
        info!(
            job_id = %id,
            processed = processed,
            failed = failed,
            duration_secs = duration,
            "Job completed"
        );
        true
    }

    /// Marks a processing job failed, appending a job-level error entry.
    ///
    /// Returns `false` for unknown or non-processing jobs.
    pub async fn fail(&self, id: Uuid, message: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(duration) = state.mark_failed(id, message) else {
            return false;
        };
        state.enforce_retention(self.max_completed_jobs);
        drop(state);

        self.metrics.record_job_finished(JobStatus::Failed, duration);
        warn!(job_id = %id, error = %message, "Job failed");
        true
    }

    /// Cancels a job that has not been dequeued yet.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return false;
        };
        if job.status != JobStatus::Pending {
            return false;
        }

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        state.enforce_retention(self.max_completed_jobs);
        let pending = state.pending_count();
        drop(state);

        self.metrics.set_pending_jobs(pending);
        self.metrics.record_job_finished(JobStatus::Cancelled, 0.0);
        info!(job_id = %id, "Job cancelled");
        true
    }

    /// Fails a job left processing by a stopped processor and submits its
    /// unattempted items as a new pending job.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::JobNotFound`, `QueueError::InvalidState` if the job
    /// is not processing, or `QueueError::NothingRemaining`.
    pub async fn requeue_remaining(&self, id: Uuid) -> Result<Uuid, QueueError> {
        let mut state = self.state.write().await;
        let job = state.jobs.get(&id).ok_or(QueueError::JobNotFound(id))?;
        if job.status != JobStatus::Processing {
            return Err(QueueError::InvalidState {
                id,
                status: job.status,
                expected: JobStatus::Processing,
            });
        }
        let remaining: Vec<String> = job.items.iter().skip(job.attempted()).cloned().collect();
        if remaining.is_empty() {
            return Err(QueueError::NothingRemaining(id));
        }

        let count = remaining.len();
        let replacement = Job::new(remaining, job.priority, job.config.clone());
        let new_id = replacement.id;
        let message = format!(
            "Stopped before completion; {} remaining items requeued as {}",
            count, new_id
        );

        // Checked above under the same lock, so the original is still processing.
        let duration = state.mark_failed(id, &message).unwrap_or(0.0);
        state.enqueue(replacement);
        state.enforce_retention(self.max_completed_jobs);
        let pending = state.pending_count();
        drop(state);

        self.metrics.set_pending_jobs(pending);
        self.metrics.record_job_finished(JobStatus::Failed, duration);
        warn!(job_id = %id, error = %message, "Job failed");
        info!(job_id = %id, new_job_id = %new_id, items = count, "Requeued remaining items");
        Ok(new_id)
    }

    /// Returns a copy of a job.
    pub async fn get_job(&self, id: Uuid) -> Option<Job> {
        self.state.read().await.jobs.get(&id).cloned()
    }

    /// Returns a job's details with derived fields.
    pub async fn job_details(&self, id: Uuid) -> Option<JobDetails> {
        let state = self.state.read().await;
        state.jobs.get(&id).map(|job| job.details(Utc::now()))
    }

    /// Returns a job's results and errors, the most recent `limit` of each.
    pub async fn job_results(&self, id: Uuid, limit: Option<usize>) -> Option<JobResults> {
        let state = self.state.read().await;
        state.jobs.get(&id).map(|job| job.results_page(limit))
    }

    /// Pending jobs in dequeue order.
    pub async fn list_pending(&self) -> Vec<JobDetails> {
        let state = self.state.read().await;
        let now = Utc::now();
        let mut pending: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|j| {
            (
                Reverse(j.priority),
                state.sequence.get(&j.id).copied().unwrap_or(u64::MAX),
            )
        });
        pending.into_iter().map(|j| j.details(now)).collect()
    }

    /// Processing jobs, earliest start first.
    pub async fn list_active(&self) -> Vec<JobDetails> {
        let state = self.state.read().await;
        let now = Utc::now();
        let mut active: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .collect();
        active.sort_by_key(|j| j.started_at);
        active.into_iter().map(|j| j.details(now)).collect()
    }

    /// Terminal jobs, most recently finished first.
    pub async fn list_recent_completed(&self, limit: usize) -> Vec<JobDetails> {
        let state = self.state.read().await;
        let now = Utc::now();
        let mut done: Vec<&Job> = state.jobs.values().filter(|j| j.is_terminal()).collect();
        done.sort_by_key(|j| Reverse(j.completed_at));
        done.into_iter()
            .take(limit)
            .map(|j| j.details(now))
            .collect()
    }

    /// Aggregate status and lifetime statistics.
    pub async fn status(&self) -> QueueStatus {
        let state = self.state.read().await;
        let now = Utc::now();

        let mut status_breakdown: HashMap<JobStatus, usize> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut priority_breakdown: HashMap<JobPriority, usize> =
            JobPriority::ALL.iter().map(|p| (*p, 0)).collect();
        for job in state.jobs.values() {
            *status_breakdown.entry(job.status).or_insert(0) += 1;
            *priority_breakdown.entry(job.priority).or_insert(0) += 1;
        }

        let durations: Vec<f64> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Completed)
            .filter_map(|j| j.processing_time(now))
            .collect();
        let average_processing_time_seconds = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        let c = &state.counters;
        let items_total = c.items_processed + c.items_failed;

        QueueStatus {
            queue_size: state.pending.len(),
            total_jobs: state.jobs.len(),
            status_breakdown,
            priority_breakdown,
            statistics: QueueStatistics {
                total_jobs_created: c.created,
                total_jobs_completed: c.completed,
                total_jobs_failed: c.failed,
                total_items_processed: c.items_processed,
                total_items_failed: c.items_failed,
                success_rate: c.completed as f64 / c.created.max(1) as f64 * 100.0,
                item_success_rate: c.items_processed as f64 / items_total.max(1) as f64 * 100.0,
                average_processing_time_seconds,
            },
        }
    }

    /// Purges terminal jobs finished more than `max_age_hours` ago, then
    /// enforces the retention cap. Returns the number of purged jobs.
    ///
    /// An age too large to represent purges nothing by age.
    pub async fn cleanup(&self, max_age_hours: u64) -> usize {
        let cutoff = i64::try_from(max_age_hours)
            .ok()
            .and_then(Duration::try_hours)
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let mut state = self.state.write().await;

        let expired: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.is_terminal())
            .filter(|j| {
                cutoff.is_some_and(|cutoff| j.completed_at.is_some_and(|at| at < cutoff))
            })
            .map(|j| j.id)
            .collect();
        for id in &expired {
            state.remove(id);
        }

        let purged = expired.len() + state.enforce_retention(self.max_completed_jobs);
        drop(state);

        if purged > 0 {
            info!(purged = purged, max_age_hours = max_age_hours, "Cleaned up old jobs");
        }
        purged
    }

    #[cfg(test)]
    pub(crate) async fn backdate_completion(&self, id: Uuid, by: Duration) {
        let mut state = self.state.write().await;
        if let Some(job) = state.jobs.get_mut(&id) {
            job.completed_at = job.completed_at.map(|at| at - by);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::ErrorKind;

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item{}", i)).collect()
    }

    async fn processing_job(queue: &JobQueue, n: usize) -> Uuid {
        let id = queue
            .create_job(items(n), JobPriority::Normal, JobConfig::default())
            .await
            .unwrap();
        let job = queue.dequeue_next().await.unwrap();
        assert_eq!(job.id, id);
        id
    }

    #[tokio::test]
    async fn test_create_rejects_empty() {
        let queue = JobQueue::new();
        let result = queue
            .create_job(Vec::new(), JobPriority::Normal, JobConfig::default())
            .await;
        assert!(matches!(result, Err(QueueError::EmptyJob)));
    }

    #[tokio::test]
    async fn test_priority_ordering() {
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

        assert_eq!(queue.dequeue_next().await.unwrap().id, urgent);
        assert_eq!(queue.dequeue_next().await.unwrap().id, normal);
        assert_eq!(queue.dequeue_next().await.unwrap().id, low);
        assert!(queue.dequeue_next().await.is_none());
    }

    #[tokio::test]
    async fn test_equal_priority_is_fifo() {
        let queue = JobQueue::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                queue
                    .create_job(items(1), JobPriority::High, JobConfig::default())
                    .await
                    .unwrap(),
            );
        }

        for id in ids {
            assert_eq!(queue.dequeue_next().await.unwrap().id, id);
        }
    }

    #[tokio::test]
    async fn test_dequeue_sets_started_at() {
        let queue = JobQueue::new();
        let id = processing_job(&queue, 2).await;
        let job = queue.get_job(id).await.unwrap();

        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_cancel_only_pending_and_skip_tombstone() {
        let queue = JobQueue::new();
        let first = queue
            .create_job(items(1), JobPriority::Urgent, JobConfig::default())
            .await
            .unwrap();
        let second = queue
            .create_job(items(1), JobPriority::Low, JobConfig::default())
            .await
            .unwrap();

        assert!(queue.cancel(first).await);
        assert!(!queue.cancel(first).await);

        let job = queue.dequeue_next().await.unwrap();
        assert_eq!(job.id, second);
        assert!(!queue.cancel(second).await);

        let cancelled = queue.get_job(first).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.started_at.is_none());
        assert!(cancelled.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_progress() {
        let queue = JobQueue::new();
        let id = processing_job(&queue, 3).await;

        let update = ProgressUpdate {
            processed_count: 0,
            failed_count: 1,
            current_item: Some("item0".to_string()),
            new_results: Vec::new(),
            new_errors: vec![WorkError::for_item(
                "item0",
                1,
                ErrorKind::TargetRejected,
                "refused",
                Some("c1".to_string()),
            )],
        };
        assert!(queue.update_progress(id, update).await);

        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.failed_count, 1);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.current_item.as_deref(), Some("item0"));

        assert!(!queue.update_progress(Uuid::new_v4(), ProgressUpdate::default()).await);
        let overflow = ProgressUpdate {
            processed_count: 3,
            failed_count: 1,
            ..Default::default()
        };
        assert!(!queue.update_progress(id, overflow).await);
    }

    #[tokio::test]
    async fn test_terminal_transitions_are_idempotent() {
        let queue = JobQueue::new();
        let id = processing_job(&queue, 1).await;

        assert!(queue.complete(id, None, None).await);
        let completed_at = queue.get_job(id).await.unwrap().completed_at;

        assert!(!queue.complete(id, None, None).await);
        assert!(!queue.fail(id, "late failure").await);
        assert!(!queue.cancel(id).await);
        assert!(!queue.update_progress(id, ProgressUpdate::default()).await);

        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_at, completed_at);
        assert!(job.errors.is_empty());
    }

    #[tokio::test]
    async fn test_pending_job_cannot_complete() {
        let queue = JobQueue::new();
        let id = queue
            .create_job(items(1), JobPriority::Normal, JobConfig::default())
            .await
            .unwrap();

        assert!(!queue.complete(id, None, None).await);
        assert!(!queue.fail(id, "nope").await);
        assert_eq!(queue.get_job(id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_fail_appends_job_error() {
        let queue = JobQueue::new();
        let id = processing_job(&queue, 2).await;

        assert!(queue.fail(id, "processor crashed").await);
        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].kind, ErrorKind::Unexpected);
        assert!(job.errors[0].item.is_none());
    }

    #[tokio::test]
    async fn test_status_statistics() {
        let queue = JobQueue::new();
        let id = processing_job(&queue, 4).await;
        queue
            .update_progress(
                id,
                ProgressUpdate {
                    processed_count: 3,
                    failed_count: 1,
                    ..Default::default()
                },
            )
            .await;
        queue.complete(id, None, None).await;
        queue
            .create_job(items(1), JobPriority::Urgent, JobConfig::default())
            .await
            .unwrap();

        let status = queue.status().await;
        assert_eq!(status.total_jobs, 2);
        assert_eq!(status.queue_size, 1);
        assert_eq!(status.count(JobStatus::Completed), 1);
        assert_eq!(status.count(JobStatus::Pending), 1);
        assert_eq!(status.priority_breakdown[&JobPriority::Urgent], 1);
        assert_eq!(status.statistics.total_jobs_created, 2);
        assert_eq!(status.statistics.total_jobs_completed, 1);
        assert!((status.statistics.success_rate - 50.0).abs() < f64::EPSILON);
        assert!((status.statistics.item_success_rate - 75.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_listings() {
        let queue = JobQueue::new();
        let running = processing_job(&queue, 1).await;
        let low = queue
            .create_job(items(1), JobPriority::Low, JobConfig::default())
            .await
            .unwrap();
        let high = queue
            .create_job(items(1), JobPriority::High, JobConfig::default())
            .await
            .unwrap();

        let pending: Vec<Uuid> = queue.list_pending().await.iter().map(|d| d.job_id).collect();
        assert_eq!(pending, vec![high, low]);

        let active = queue.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].job_id, running);

        queue.complete(running, None, None).await;
        queue.cancel(low).await;
        let recent = queue.list_recent_completed(1).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].job_id, low);
    }

    #[tokio::test]
    async fn test_cleanup_by_age() {
        let queue = JobQueue::new();
        let old = processing_job(&queue, 1).await;
        queue.complete(old, None, None).await;
        let fresh = processing_job(&queue, 1).await;
        queue.complete(fresh, None, None).await;
        let pending = queue
            .create_job(items(1), JobPriority::Normal, JobConfig::default())
            .await
            .unwrap();

        queue.backdate_completion(old, Duration::hours(50)).await;

        assert_eq!(queue.cleanup(48).await, 1);
        assert!(queue.get_job(old).await.is_none());
        assert!(queue.get_job(fresh).await.is_some());
        assert!(queue.get_job(pending).await.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_with_unrepresentable_age_keeps_jobs() {
        let queue = JobQueue::new();
        let id = processing_job(&queue, 1).await;
        queue.complete(id, None, None).await;

        assert_eq!(queue.cleanup(u64::MAX).await, 0);
        assert_eq!(queue.cleanup(3_000_000_000_000_000).await, 0);
        assert!(queue.get_job(id).await.is_some());
    }

    #[tokio::test]
    async fn test_retention_cap() {
        let queue = JobQueue::with_max_completed_jobs(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = processing_job(&queue, 1).await;
            queue.complete(id, None, None).await;
            ids.push(id);
        }

        assert!(queue.get_job(ids[0]).await.is_none());
        assert!(queue.get_job(ids[1]).await.is_some());
        assert!(queue.get_job(ids[2]).await.is_some());
    }

    #[tokio::test]
    async fn test_requeue_remaining() {
        let queue = JobQueue::new();
        let id = queue
            .create_job(items(4), JobPriority::High, JobConfig::default())
            .await
            .unwrap();
        queue.dequeue_next().await;
        queue
            .update_progress(
                id,
                ProgressUpdate {
                    processed_count: 1,
                    failed_count: 1,
                    ..Default::default()
                },
            )
            .await;

        let new_id = queue.requeue_remaining(id).await.unwrap();
        let original = queue.get_job(id).await.unwrap();
        assert_eq!(original.status, JobStatus::Failed);

        let requeued = queue.get_job(new_id).await.unwrap();
        assert_eq!(requeued.items, vec!["item2", "item3"]);
        assert_eq!(requeued.priority, JobPriority::High);
        assert_eq!(requeued.status, JobStatus::Pending);

        assert!(matches!(
            queue.requeue_remaining(id).await,
            Err(QueueError::InvalidState { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requeue_creates_one_job() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let id = queue
            .create_job(items(3), JobPriority::Normal, JobConfig::default())
            .await
            .unwrap();
        queue.dequeue_next().await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.requeue_remaining(id).await })
            })
            .collect();
        let outcomes = futures::future::join_all(handles).await;
        let succeeded = outcomes
            .into_iter()
            .filter(|outcome| matches!(outcome, Ok(Ok(_))))
            .count();

        assert_eq!(succeeded, 1);
        assert_eq!(queue.list_pending().await.len(), 1);
        assert_eq!(queue.status().await.statistics.total_jobs_failed, 1);
    }
}
