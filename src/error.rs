//! Error types for service-level operations.
//!
//! Each subsystem owns its error enum (`PoolError`, `QueueError`,
//! `SchedulerError`, `ConfigError`, `StoreError`). [`ServiceError`] wraps them
//! for callers of [`crate::service::Service`] and adds the submission-time
//! rejections that belong to no single subsystem.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::credentials::{PoolError, SourceError, StoreError};
use crate::scheduler::{QueueError, SchedulerError};

/// Errors returned by service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A submitted job contained no items.
    #[error("Job has no items")]
    EmptyJob,

    /// Every submitted item failed validation.
    #[error("No valid items after validation ({invalid} rejected)")]
    NoValidItems { invalid: usize },

    /// Unknown job id.
    #[error("Job '{0}' not found")]
    JobNotFound(Uuid),

    /// Unknown credential id.
    #[error("Credential '{0}' not found")]
    CredentialNotFound(String),

    /// A credentials file held nothing usable.
    #[error("No credentials found in input")]
    NoCredentials,

    #[error("Credential pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Credential source error: {0}")]
    Source(#[from] SourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
