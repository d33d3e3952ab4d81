//! quotaflow: quota-aware batch processing over a pool of rate-limited credentials.
//!
//! This library provides a credential pool with daily quotas and rotation,
//! a priority job queue, per-job processors, and a heartbeat scheduler that
//! admits jobs while credential capacity remains.

// Core modules
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod validation;

// Re-export commonly used types
pub use config::{AppConfig, ConfigError};
pub use credentials::{Acquisition, CredentialPool, PoolConfig};
pub use error::ServiceError;
pub use fetcher::{FetchError, Fetcher};
pub use scheduler::{JobPriority, JobQueue, Scheduler, SchedulerConfig};
pub use service::Service;
