//! Process-level configuration.
//!
//! Settings come from an optional YAML file, then `QUOTAFLOW_*` environment
//! variables override individual fields.

use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::PoolConfig;
use crate::scheduler::SchedulerConfig;

/// Upper bound for `credential_lifetime_hours` (one year).
pub const MAX_CREDENTIAL_LIFETIME_HOURS: u64 = 8_760;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Complete configuration of a quotaflow process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    /// Requests each credential may serve per day.
    pub max_daily_requests: u32,
    /// Lifetime of newly added credentials.
    pub credential_lifetime_hours: u64,
    /// SQLite URL for credential and result storage. Unset keeps everything in memory.
    pub database_url: Option<String>,
    /// Endpoint used by the HTTP fetcher.
    pub fetch_endpoint: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            max_daily_requests: 500,
            credential_lifetime_hours: 22,
            database_url: None,
            fetch_endpoint: None,
        }
    }
}

impl AppConfig {
    /// Creates configuration from environment variables over the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `QUOTAFLOW_POLLING_INTERVAL_SECS`: Admission tick (default: 3)
    /// - `QUOTAFLOW_MAX_CONCURRENT_JOBS`: Concurrent jobs (default: 5)
    /// - `QUOTAFLOW_HEALTH_CHECK_INTERVAL_SECS`: Health tick (default: 60)
    /// - `QUOTAFLOW_CLEANUP_INTERVAL_SECS`: Cleanup tick (default: 1800)
    /// - `QUOTAFLOW_MAX_JOB_AGE_HOURS`: Retention of finished jobs (default: 48)
    /// - `QUOTAFLOW_DELAY_BETWEEN_ITEMS_SECS`: Pause between items (default: 2.0)
    /// - `QUOTAFLOW_REQUESTS_PER_CREDENTIAL`: Rotation run length (default: 15)
    /// - `QUOTAFLOW_LONG_BREAK_INTERVAL`: Items between long breaks (default: 10)
    /// - `QUOTAFLOW_LONG_BREAK_SECS`: Long break length (default: 10)
    /// - `QUOTAFLOW_STOP_ON_ERROR`: Abort jobs on first failure (default: false)
    /// - `QUOTAFLOW_MAX_DAILY_REQUESTS`: Daily quota per credential (default: 500)
    /// - `QUOTAFLOW_CREDENTIAL_LIFETIME_HOURS`: Credential lifetime (default: 22)
    /// - `QUOTAFLOW_DATABASE_URL`: SQLite URL (optional)
    /// - `QUOTAFLOW_FETCH_ENDPOINT`: Lookup endpoint (optional)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML configuration file. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` or `ConfigError::Yaml` if the file cannot be read.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Loads the effective configuration: file (if any), then environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` on unreadable files, bad values, or failed validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from a variable lookup.
    pub(crate) fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let s = &mut self.scheduler;

        if let Some(val) = lookup("QUOTAFLOW_POLLING_INTERVAL_SECS") {
            s.polling_interval_secs = parse_env_value(&val, "QUOTAFLOW_POLLING_INTERVAL_SECS")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_MAX_CONCURRENT_JOBS") {
            s.max_concurrent_jobs = parse_env_value(&val, "QUOTAFLOW_MAX_CONCURRENT_JOBS")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_HEALTH_CHECK_INTERVAL_SECS") {
            s.health_check_interval_secs =
                parse_env_value(&val, "QUOTAFLOW_HEALTH_CHECK_INTERVAL_SECS")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_CLEANUP_INTERVAL_SECS") {
            s.cleanup_interval_secs = parse_env_value(&val, "QUOTAFLOW_CLEANUP_INTERVAL_SECS")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_MAX_JOB_AGE_HOURS") {
            s.max_job_age_hours = parse_env_value(&val, "QUOTAFLOW_MAX_JOB_AGE_HOURS")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_DELAY_BETWEEN_ITEMS_SECS") {
            s.delay_between_items_secs =
                parse_env_value(&val, "QUOTAFLOW_DELAY_BETWEEN_ITEMS_SECS")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_REQUESTS_PER_CREDENTIAL") {
            s.requests_per_credential =
                parse_env_value(&val, "QUOTAFLOW_REQUESTS_PER_CREDENTIAL")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_LONG_BREAK_INTERVAL") {
            s.long_break_interval = parse_env_value(&val, "QUOTAFLOW_LONG_BREAK_INTERVAL")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_LONG_BREAK_SECS") {
            s.long_break_secs = parse_env_value(&val, "QUOTAFLOW_LONG_BREAK_SECS")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_STOP_ON_ERROR") {
            s.stop_on_error = parse_env_bool(&val, "QUOTAFLOW_STOP_ON_ERROR")?;
        }

        if let Some(val) = lookup("QUOTAFLOW_MAX_DAILY_REQUESTS") {
            self.max_daily_requests = parse_env_value(&val, "QUOTAFLOW_MAX_DAILY_REQUESTS")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_CREDENTIAL_LIFETIME_HOURS") {
            self.credential_lifetime_hours =
                parse_env_value(&val, "QUOTAFLOW_CREDENTIAL_LIFETIME_HOURS")?;
        }
        if let Some(val) = lookup("QUOTAFLOW_DATABASE_URL") {
            self.database_url = Some(val);
        }
        if let Some(val) = lookup("QUOTAFLOW_FETCH_ENDPOINT") {
            self.fetch_endpoint = Some(val);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;

        if self.max_daily_requests == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_daily_requests must be greater than 0".to_string(),
            ));
        }
        if self.credential_lifetime_hours == 0 {
            return Err(ConfigError::ValidationFailed(
                "credential_lifetime_hours must be greater than 0".to_string(),
            ));
        }
        if self.credential_lifetime_hours > MAX_CREDENTIAL_LIFETIME_HOURS {
            return Err(ConfigError::ValidationFailed(format!(
                "credential_lifetime_hours cannot exceed {}",
                MAX_CREDENTIAL_LIFETIME_HOURS
            )));
        }
        if self.database_url.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Credential pool settings derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_max_daily_requests(self.max_daily_requests)
            .with_credential_lifetime(Duration::hours(
                self.credential_lifetime_hours.min(MAX_CREDENTIAL_LIFETIME_HOURS) as i64,
            ))
    }

    /// Returns the fetch endpoint or an error naming its variable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if no endpoint is configured.
    pub fn require_fetch_endpoint(&self) -> Result<&str, ConfigError> {
        self.fetch_endpoint
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("QUOTAFLOW_FETCH_ENDPOINT".to_string()))
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.max_daily_requests, 500);
        assert_eq!(config.credential_lifetime_hours, 22);
        assert!(config.database_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_env_with(lookup(&[
                ("QUOTAFLOW_MAX_CONCURRENT_JOBS", "8"),
                ("QUOTAFLOW_DELAY_BETWEEN_ITEMS_SECS", "0.5"),
                ("QUOTAFLOW_STOP_ON_ERROR", "yes"),
                ("QUOTAFLOW_MAX_DAILY_REQUESTS", "100"),
                ("QUOTAFLOW_DATABASE_URL", "sqlite://quotaflow.db"),
            ]))
            .unwrap();

        assert_eq!(config.scheduler.max_concurrent_jobs, 8);
        assert!((config.scheduler.delay_between_items_secs - 0.5).abs() < f64::EPSILON);
        assert!(config.scheduler.stop_on_error);
        assert_eq!(config.max_daily_requests, 100);
        assert_eq!(config.database_url.as_deref(), Some("sqlite://quotaflow.db"));
        assert_eq!(config.pool_config().max_daily_requests, 100);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_with(lookup(&[("QUOTAFLOW_MAX_CONCURRENT_JOBS", "many")]))
            .unwrap_err();

        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("QUOTAFLOW_MAX_CONCURRENT_JOBS"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("TRUE", "test").unwrap());
        assert!(parse_env_bool("on", "test").unwrap());
        assert!(!parse_env_bool("0", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "max_daily_requests: 250\nscheduler:\n  max_concurrent_jobs: 2\n  requests_per_credential: 5"
        )
        .unwrap();

        let config = AppConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.max_daily_requests, 250);
        assert_eq!(config.scheduler.max_concurrent_jobs, 2);
        assert_eq!(config.scheduler.requests_per_credential, 5);
        assert_eq!(config.scheduler.max_job_age_hours, 48);
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig {
            max_daily_requests: 0,
            ..Default::default()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("max_daily_requests"));

        config.max_daily_requests = 10;
        config.database_url = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_env_values_fail_validation() {
        let mut config = AppConfig::default();
        config
            .apply_env_with(lookup(&[("QUOTAFLOW_MAX_JOB_AGE_HOURS", "18446744073709551615")]))
            .unwrap();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("max_job_age_hours"));

        let mut config = AppConfig::default();
        config
            .apply_env_with(lookup(&[("QUOTAFLOW_CREDENTIAL_LIFETIME_HOURS", "3000000000000000")]))
            .unwrap();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("credential_lifetime_hours"));
        assert_eq!(
            config.pool_config().credential_lifetime,
            Duration::hours(MAX_CREDENTIAL_LIFETIME_HOURS as i64)
        );

        let mut config = AppConfig::default();
        config
            .apply_env_with(lookup(&[("QUOTAFLOW_POLLING_INTERVAL_SECS", "1e20")]))
            .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_require_fetch_endpoint() {
        let config = AppConfig::default();
        assert!(matches!(
            config.require_fetch_endpoint(),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }
}
