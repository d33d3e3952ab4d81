//! Prometheus metrics registration and export.
//!
//! All quotaflow metrics live in one registry created by [`init_metrics`].
//! Until then the statics are empty and recording is a no-op.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all quotaflow metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Items processed, labeled by outcome (`success` or an error kind).
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Credential acquisitions, labeled by result (`granted` / `exhausted`).
pub static ACQUISITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Credentials deactivated after crossing the error threshold.
pub static CREDENTIALS_DEACTIVATED: OnceLock<Counter> = OnceLock::new();

/// Jobs reaching a terminal status, labeled by status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock job duration in seconds, labeled by terminal status.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs waiting in the queue.
pub static PENDING_JOBS: OnceLock<Gauge> = OnceLock::new();

/// Processors currently running.
pub static ACTIVE_PROCESSORS: OnceLock<Gauge> = OnceLock::new();

/// Remaining daily requests across active credentials.
pub static AVAILABLE_CAPACITY: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once: later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric cannot be created or registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let items_total = CounterVec::new(
        Opts::new("quotaflow_items_total", "Items processed by outcome"),
        &["outcome"],
    )?;

    let acquisitions_total = CounterVec::new(
        Opts::new(
            "quotaflow_credential_acquisitions_total",
            "Credential acquisition attempts",
        ),
        &["result"],
    )?;

    let credentials_deactivated = Counter::new(
        "quotaflow_credentials_deactivated_total",
        "Credentials deactivated after repeated faults",
    )?;

    let jobs_total = CounterVec::new(
        Opts::new("quotaflow_jobs_total", "Jobs reaching a terminal status"),
        &["status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new("quotaflow_job_duration_seconds", "Job duration in seconds")
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
        &["status"],
    )?;

    let pending_jobs = Gauge::new("quotaflow_pending_jobs", "Jobs waiting in the queue")?;

    let active_processors = Gauge::new(
        "quotaflow_active_processors",
        "Number of processors currently running",
    )?;

    let available_capacity = Gauge::new(
        "quotaflow_available_capacity",
        "Remaining daily requests across active credentials",
    )?;

    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(acquisitions_total.clone()))?;
    registry.register(Box::new(credentials_deactivated.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(pending_jobs.clone()))?;
    registry.register(Box::new(active_processors.clone()))?;
    registry.register(Box::new(available_capacity.clone()))?;

    // Already initialized if any of these fail
    let _ = REGISTRY.set(registry);
    let _ = ITEMS_TOTAL.set(items_total);
    let _ = ACQUISITIONS_TOTAL.set(acquisitions_total);
    let _ = CREDENTIALS_DEACTIVATED.set(credentials_deactivated);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = PENDING_JOBS.set(pending_jobs);
    let _ = ACTIVE_PROCESSORS.set(active_processors);
    let _ = AVAILABLE_CAPACITY.set(available_capacity);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry is missing or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
