//! Job scheduling: queue, processors and the heartbeat that connects them.
//!
//! - **JobQueue**: in-memory priority queue owning every job record
//! - **WorkProcessor**: drives one job's items through credentials and the fetcher
//! - **Scheduler**: admits pending jobs while slots and credential capacity remain
//!
//! # Architecture
//!
//! ```text
//!      submit ──────► ┌──────────┐
//!                     │ JobQueue │ ◄──── progress / complete / fail
//!                     └────┬─────┘                  ▲
//!                          │ dequeue_next            │
//!                     ┌────▼──────┐   spawn   ┌──────┴────────┐
//!                     │ Scheduler │ ────────► │ WorkProcessor │ ──► Fetcher
//!                     └────┬──────┘           └──────┬────────┘
//!                          │ available_capacity      │ acquire / report
//!                          └──────────► CredentialPool ◄┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use quotaflow::scheduler::{JobQueue, Scheduler, SchedulerConfig, JobPriority, JobConfig};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(JobQueue::new());
//! let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default(), pool, queue.clone(), fetcher));
//! scheduler.start().await?;
//!
//! let id = queue.create_job(items, JobPriority::High, JobConfig::default()).await?;
//!
//! scheduler.shutdown().await?;
//! ```

pub mod config;
pub mod heartbeat;
pub mod job;
pub mod processor;
pub mod queue;

pub use config::{ProcessorConfig, SchedulerConfig, SchedulerConfigPatch, MAX_REQUESTS_PER_CREDENTIAL};
pub use heartbeat::{HealthReport, Scheduler, SchedulerError, ServiceStatus};
pub use job::{
    ErrorKind, Job, JobConfig, JobDetails, JobPriority, JobResults, JobStatus, WorkError,
    WorkResult,
};
pub use processor::{
    ProcessorError, ProcessorHandle, ProcessorReport, ProcessorState, ProcessorStats,
    WorkProcessor,
};
pub use queue::{JobQueue, ProgressUpdate, QueueError, QueueStatistics, QueueStatus};
