//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: A submitted batch of work items processed as a unit
//! - `JobConfig`: Per-job execution overrides
//! - `WorkResult` / `WorkError`: Outcome of a single item
//! - `ErrorKind`: Classification of item failures

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of recent results and errors included in job details.
const RECENT_ENTRIES: usize = 5;

/// Lifecycle state of a job.
///
/// Valid transitions are `Pending -> Processing -> {Completed, Failed}` and
/// `Pending -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Returns whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Admission priority. Higher priorities are dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Low,
        JobPriority::Normal,
        JobPriority::High,
        JobPriority::Urgent,
    ];

    /// Numeric weight used for heap ordering.
    pub fn weight(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Low => write!(f, "LOW"),
            JobPriority::Normal => write!(f, "NORMAL"),
            JobPriority::High => write!(f, "HIGH"),
            JobPriority::Urgent => write!(f, "URGENT"),
        }
    }
}

impl FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(JobPriority::Low),
            "NORMAL" => Ok(JobPriority::Normal),
            "HIGH" => Ok(JobPriority::High),
            "URGENT" => Ok(JobPriority::Urgent),
            other => Err(format!(
                "invalid priority '{}', expected one of LOW, NORMAL, HIGH, URGENT",
                other
            )),
        }
    }
}

/// Per-job execution overrides. Unset fields fall back to scheduler defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Seconds to wait between items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<f64>,
    /// Abort the remaining items after the first failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_on_error: Option<bool>,
    /// Consecutive requests served by one credential before rotating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_credential: Option<u32>,
    /// Take a long break after every N items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_break_interval: Option<u32>,
    /// Length of the long break in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_break_seconds: Option<f64>,
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay_seconds(mut self, seconds: f64) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = Some(stop);
        self
    }

    pub fn with_requests_per_credential(mut self, requests: u32) -> Self {
        self.requests_per_credential = Some(requests);
        self
    }

    /// Sets the long break cadence and duration.
    pub fn with_long_break(mut self, every: u32, seconds: f64) -> Self {
        self.long_break_interval = Some(every);
        self.long_break_seconds = Some(seconds);
        self
    }
}

/// Classification of a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No credential was available.
    CredentialExhausted,
    /// The credential itself was rejected.
    CredentialFault,
    /// The external resource refused this item.
    TargetRejected,
    /// The item was malformed.
    DataValidation,
    /// Anything else.
    Unexpected,
}

impl ErrorKind {
    /// Returns whether the failure counts against the credential used.
    pub fn penalizes_credential(&self) -> bool {
        matches!(self, ErrorKind::CredentialFault)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CredentialExhausted => "credential_exhausted",
            ErrorKind::CredentialFault => "credential_fault",
            ErrorKind::TargetRejected => "target_rejected",
            ErrorKind::DataValidation => "data_validation",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful outcome of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub job_id: Uuid,
    pub item: String,
    /// One-based position of the item in the job.
    pub item_number: usize,
    pub credential_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Whether the result reached the persister. `None` without a persister.
    #[serde(default)]
    pub persisted: Option<bool>,
}

/// Failed outcome of one item, or of the whole job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkError {
    /// `None` for job-level failures.
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default)]
    pub item_number: Option<usize>,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub credential_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WorkError {
    /// Creates an error entry for one item.
    pub fn for_item(
        item: impl Into<String>,
        item_number: usize,
        kind: ErrorKind,
        message: impl Into<String>,
        credential_id: Option<String>,
    ) -> Self {
        Self {
            item: Some(item.into()),
            item_number: Some(item_number),
            kind,
            message: message.into(),
            credential_id,
            timestamp: Utc::now(),
        }
    }

    /// Creates a job-level error entry.
    pub fn for_job(message: impl Into<String>) -> Self {
        Self {
            item: None,
            item_number: None,
            kind: ErrorKind::Unexpected,
            message: message.into(),
            credential_id: None,
            timestamp: Utc::now(),
        }
    }
}

/// A submitted batch of work items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Work descriptors, immutable once created.
    pub items: Vec<String>,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processed_count: usize,
    pub failed_count: usize,
    pub results: Vec<WorkResult>,
    pub errors: Vec<WorkError>,
    pub current_item: Option<String>,
    pub config: JobConfig,
}

impl Job {
    /// Creates a pending job.
    pub fn new(items: Vec<String>, priority: JobPriority, config: JobConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            items,
            status: JobStatus::Pending,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processed_count: 0,
            failed_count: 0,
            results: Vec::new(),
            errors: Vec::new(),
            current_item: None,
            config,
        }
    }

    pub fn total_items(&self) -> usize {
        self.items.len()
    }

    /// Items that have an outcome, successful or not.
    pub fn attempted(&self) -> usize {
        self.processed_count + self.failed_count
    }

    /// Share of items with an outcome; 100 for an empty job.
    pub fn progress_percentage(&self) -> f64 {
        if self.items.is_empty() {
            return 100.0;
        }
        self.attempted() as f64 / self.items.len() as f64 * 100.0
    }

    /// Seconds since the job started, up to completion.
    pub fn processing_time(&self, now: DateTime<Utc>) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }

    /// Projected seconds left, once at least one item has an outcome.
    pub fn estimated_time_remaining(&self, now: DateTime<Utc>) -> Option<f64> {
        let started = self.started_at?;
        if self.completed_at.is_some() || self.attempted() == 0 {
            return None;
        }
        let elapsed = (now - started).num_milliseconds() as f64 / 1000.0;
        let per_item = elapsed / self.attempted() as f64;
        let remaining = self.items.len().saturating_sub(self.attempted());
        Some(per_item * remaining as f64)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Snapshot of the job with derived fields.
    pub fn details(&self, now: DateTime<Utc>) -> JobDetails {
        JobDetails {
            job_id: self.id,
            status: self.status,
            priority: self.priority,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            total_items: self.items.len(),
            processed_count: self.processed_count,
            failed_count: self.failed_count,
            current_item: self.current_item.clone(),
            progress_percentage: (self.progress_percentage() * 100.0).round() / 100.0,
            processing_time_seconds: self.processing_time(now),
            estimated_time_remaining_seconds: self.estimated_time_remaining(now),
            results_count: self.results.len(),
            errors_count: self.errors.len(),
            config: self.config.clone(),
            recent_results: last_n(&self.results, RECENT_ENTRIES),
            recent_errors: last_n(&self.errors, RECENT_ENTRIES),
        }
    }

    /// Results and errors, optionally limited to the most recent `limit`.
    pub fn results_page(&self, limit: Option<usize>) -> JobResults {
        let (results, errors) = match limit {
            Some(n) => (last_n(&self.results, n), last_n(&self.errors, n)),
            None => (self.results.clone(), self.errors.clone()),
        };

        JobResults {
            job_id: self.id,
            status: self.status,
            total_results: self.results.len(),
            total_errors: self.errors.len(),
            results,
            errors,
        }
    }
}

fn last_n<T: Clone>(entries: &[T], n: usize) -> Vec<T> {
    entries[entries.len().saturating_sub(n)..].to_vec()
}

/// Observable view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetails {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_items: usize,
    pub processed_count: usize,
    pub failed_count: usize,
    pub current_item: Option<String>,
    pub progress_percentage: f64,
    pub processing_time_seconds: Option<f64>,
    pub estimated_time_remaining_seconds: Option<f64>,
    pub results_count: usize,
    pub errors_count: usize,
    pub config: JobConfig,
    pub recent_results: Vec<WorkResult>,
    pub recent_errors: Vec<WorkError>,
}

/// Results and errors of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total_results: usize,
    pub total_errors: usize,
    pub results: Vec<WorkResult>,
    pub errors: Vec<WorkError>,
}
