//! Durable storage for credentials and fetched results.
//!
//! The in-memory pool and queue are authoritative while the process runs.
//! Storage is write-through: credentials are reloaded at startup and results
//! are appended as they arrive.
//!
//! # Usage
//!
//! ```rust,ignore
//! use quotaflow::storage::SqliteStore;
//!
//! let store = SqliteStore::connect("sqlite://quotaflow.db").await?;
//! let results = store.results_for_job(job_id).await?;
//! ```

pub mod database;
pub mod migrations;
pub mod schema;

use async_trait::async_trait;

use crate::scheduler::job::WorkResult;

pub use database::{SqliteStore, StoredResult};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};

/// Best-effort sink for individual results.
///
/// Implementations report failure by returning `false`; they must never
/// panic or block job processing on errors.
#[async_trait]
pub trait JobPersister: Send + Sync {
    async fn save(&self, result: &WorkResult) -> bool;
}
