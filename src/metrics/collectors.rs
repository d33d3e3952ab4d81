//! Recording interface over the raw Prometheus statics.

use super::prometheus::{
    ACQUISITIONS_TOTAL, ACTIVE_PROCESSORS, AVAILABLE_CAPACITY, CREDENTIALS_DEACTIVATED,
    ITEMS_TOTAL, JOBS_TOTAL, JOB_DURATION, PENDING_JOBS,
};
use crate::scheduler::job::{ErrorKind, JobStatus};

/// Records quotaflow operational metrics.
///
/// Cheap to construct and clone; every method is a no-op until
/// [`init_metrics`](super::init_metrics) has run.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one item. `None` means success.
    pub fn record_item(&self, error: Option<ErrorKind>) {
        let outcome = error.map_or("success", |kind| kind.as_str());

        if let Some(items) = ITEMS_TOTAL.get() {
            items.with_label_values(&[outcome]).inc();
        }

        tracing::trace!(outcome = outcome, "Recorded item metric");
    }

    /// Record a credential acquisition attempt.
    pub fn record_acquisition(&self, granted: bool) {
        let result = if granted { "granted" } else { "exhausted" };

        if let Some(acquisitions) = ACQUISITIONS_TOTAL.get() {
            acquisitions.with_label_values(&[result]).inc();
        }
    }

    pub fn record_credential_deactivated(&self) {
        if let Some(counter) = CREDENTIALS_DEACTIVATED.get() {
            counter.inc();
        }
    }

    /// Record a job reaching a terminal status.
    ///
    /// # Arguments
    ///
    /// * `status` - Terminal status of the job
    /// * `duration_secs` - Time from start to finish, zero for jobs that never started
    pub fn record_job_finished(&self, status: JobStatus, duration_secs: f64) {
        let label = status.to_string();

        if let Some(jobs) = JOBS_TOTAL.get() {
            jobs.with_label_values(&[label.as_str()]).inc();
        }

        if let Some(duration) = JOB_DURATION.get() {
            duration
                .with_label_values(&[label.as_str()])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = %label,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    pub fn set_pending_jobs(&self, count: usize) {
        if let Some(gauge) = PENDING_JOBS.get() {
            gauge.set(count as f64);
        }
    }

    pub fn set_active_processors(&self, count: usize) {
        if let Some(gauge) = ACTIVE_PROCESSORS.get() {
            gauge.set(count as f64);
        }
    }

    pub fn set_available_capacity(&self, capacity: u64) {
        if let Some(gauge) = AVAILABLE_CAPACITY.get() {
            gauge.set(capacity as f64);
        }
    }
}
