//! Scheduler tunables and per-job overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

use super::job::JobConfig;

/// Upper bound for `requests_per_credential`.
pub const MAX_REQUESTS_PER_CREDENTIAL: u32 = 50;

/// Upper bound for any interval, delay or timeout, in seconds (one week).
pub const MAX_INTERVAL_SECS: f64 = 604_800.0;

/// Upper bound for `max_job_age_hours` (one year).
pub const MAX_JOB_AGE_HOURS: u64 = 8_760;

/// Configuration for the heartbeat scheduler.
///
/// Intervals are stored as seconds so the struct maps directly onto YAML and
/// status output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between admission ticks.
    pub polling_interval_secs: f64,
    /// Maximum number of jobs processed at once.
    pub max_concurrent_jobs: usize,
    /// Seconds between health checks.
    pub health_check_interval_secs: f64,
    /// Seconds between cleanup passes.
    pub cleanup_interval_secs: f64,
    /// Age after which terminal jobs are purged.
    pub max_job_age_hours: u64,
    /// Default pause between items.
    pub delay_between_items_secs: f64,
    /// Default run length on one credential before rotating.
    pub requests_per_credential: u32,
    /// Default long break cadence in items. Zero disables long breaks.
    pub long_break_interval: u32,
    /// Default long break length.
    pub long_break_secs: f64,
    /// Default stop-on-error behavior.
    pub stop_on_error: bool,
    /// Bound on each join during shutdown.
    pub shutdown_timeout_secs: f64,
    /// Pending job count above which health reports a backlog.
    pub pending_backlog_warning: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: 3.0,
            max_concurrent_jobs: 5,
            health_check_interval_secs: 60.0,
            cleanup_interval_secs: 1800.0, // 30 minutes
            max_job_age_hours: 48,
            delay_between_items_secs: 2.0,
            requests_per_credential: 15,
            long_break_interval: 10,
            long_break_secs: 10.0,
            stop_on_error: false,
            shutdown_timeout_secs: 30.0,
            pending_backlog_warning: 50,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn polling_interval(&self) -> Duration {
        secs(self.polling_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        secs(self.health_check_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        secs(self.cleanup_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        secs(self.shutdown_timeout_secs)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("polling_interval_secs", self.polling_interval_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs),
        ];
        for (name, value) in intervals {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
            check_upper_bound(name, value)?;
        }

        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }

        if self.max_job_age_hours > MAX_JOB_AGE_HOURS {
            return Err(ConfigError::ValidationFailed(format!(
                "max_job_age_hours cannot exceed {}",
                MAX_JOB_AGE_HOURS
            )));
        }

        check_seconds("delay_between_items_secs", self.delay_between_items_secs)?;
        check_seconds("long_break_secs", self.long_break_secs)?;
        check_requests_per_credential(self.requests_per_credential)?;

        Ok(())
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval_secs = interval.as_secs_f64();
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_secs = interval.as_secs_f64();
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_secs = interval.as_secs_f64();
        self
    }

    pub fn with_max_job_age_hours(mut self, hours: u64) -> Self {
        self.max_job_age_hours = hours;
        self
    }

    pub fn with_delay_between_items(mut self, delay: Duration) -> Self {
        self.delay_between_items_secs = delay.as_secs_f64();
        self
    }

    pub fn with_requests_per_credential(mut self, requests: u32) -> Self {
        self.requests_per_credential = requests;
        self
    }

    /// Sets the default long break cadence and length.
    pub fn with_long_break(mut self, every: u32, length: Duration) -> Self {
        self.long_break_interval = every;
        self.long_break_secs = length.as_secs_f64();
        self
    }

    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_pending_backlog_warning(mut self, threshold: usize) -> Self {
        self.pending_backlog_warning = threshold;
        self
    }
}

/// Partial update applied to a running scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfigPatch {
    #[serde(default)]
    pub polling_interval_secs: Option<f64>,
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,
    #[serde(default)]
    pub health_check_interval_secs: Option<f64>,
    #[serde(default)]
    pub cleanup_interval_secs: Option<f64>,
    #[serde(default)]
    pub max_job_age_hours: Option<u64>,
    #[serde(default)]
    pub delay_between_items_secs: Option<f64>,
    #[serde(default)]
    pub requests_per_credential: Option<u32>,
    #[serde(default)]
    pub long_break_interval: Option<u32>,
    #[serde(default)]
    pub long_break_secs: Option<f64>,
    #[serde(default)]
    pub stop_on_error: Option<bool>,
    #[serde(default)]
    pub pending_backlog_warning: Option<usize>,
}

impl SchedulerConfigPatch {
    /// Returns a copy of `base` with every set field replaced.
    pub fn apply_to(&self, base: &SchedulerConfig) -> SchedulerConfig {
        let mut config = base.clone();
        if let Some(v) = self.polling_interval_secs {
            config.polling_interval_secs = v;
        }
        if let Some(v) = self.max_concurrent_jobs {
            config.max_concurrent_jobs = v;
        }
        if let Some(v) = self.health_check_interval_secs {
            config.health_check_interval_secs = v;
        }
        if let Some(v) = self.cleanup_interval_secs {
            config.cleanup_interval_secs = v;
        }
        if let Some(v) = self.max_job_age_hours {
            config.max_job_age_hours = v;
        }
        if let Some(v) = self.delay_between_items_secs {
            config.delay_between_items_secs = v;
        }
        if let Some(v) = self.requests_per_credential {
            config.requests_per_credential = v;
        }
        if let Some(v) = self.long_break_interval {
            config.long_break_interval = v;
        }
        if let Some(v) = self.long_break_secs {
            config.long_break_secs = v;
        }
        if let Some(v) = self.stop_on_error {
            config.stop_on_error = v;
        }
        if let Some(v) = self.pending_backlog_warning {
            config.pending_backlog_warning = v;
        }
        config
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Effective settings of one processor: job overrides merged over the
/// scheduler defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub delay: Duration,
    pub stop_on_error: bool,
    pub requests_per_credential: u32,
    /// Zero disables long breaks.
    pub long_break_interval: u32,
    pub long_break: Duration,
}

impl ProcessorConfig {
    pub fn merged(defaults: &SchedulerConfig, job: &JobConfig) -> Self {
        Self {
            delay: secs(job.delay_seconds.unwrap_or(defaults.delay_between_items_secs)),
            stop_on_error: job.stop_on_error.unwrap_or(defaults.stop_on_error),
            requests_per_credential: job
                .requests_per_credential
                .unwrap_or(defaults.requests_per_credential)
                .max(1),
            long_break_interval: job
                .long_break_interval
                .unwrap_or(defaults.long_break_interval),
            long_break: secs(job.long_break_seconds.unwrap_or(defaults.long_break_secs)),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::merged(&SchedulerConfig::default(), &JobConfig::default())
    }
}

/// Checks the overrides of a submitted job.
///
/// # Errors
///
/// Returns `ConfigError::ValidationFailed` for out-of-range values.
pub fn validate_job_config(config: &JobConfig) -> Result<(), ConfigError> {
    if let Some(requests) = config.requests_per_credential {
        check_requests_per_credential(requests)?;
    }
    if let Some(delay) = config.delay_seconds {
        check_seconds("delay_seconds", delay)?;
    }
    if let Some(length) = config.long_break_seconds {
        check_seconds("long_break_seconds", length)?;
    }
    Ok(())
}

fn check_requests_per_credential(requests: u32) -> Result<(), ConfigError> {
    if !(1..=MAX_REQUESTS_PER_CREDENTIAL).contains(&requests) {
        return Err(ConfigError::ValidationFailed(format!(
            "requests_per_credential must be between 1 and {}",
            MAX_REQUESTS_PER_CREDENTIAL
        )));
    }
    Ok(())
}

fn check_seconds(name: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::ValidationFailed(format!(
            "{} cannot be negative",
            name
        )));
    }
    check_upper_bound(name, value)
}

fn check_upper_bound(name: &str, value: f64) -> Result<(), ConfigError> {
    if value > MAX_INTERVAL_SECS {
        return Err(ConfigError::ValidationFailed(format!(
            "{} cannot exceed {} seconds",
            name, MAX_INTERVAL_SECS
        )));
    }
    Ok(())
}

/// NaN and negative values collapse to zero; anything above
/// `MAX_INTERVAL_SECS` is clamped to it.
fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value.min(MAX_INTERVAL_SECS)).unwrap_or(Duration::ZERO)
}
