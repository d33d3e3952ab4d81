//! Long-lived service context.
//!
//! [`Service`] owns the shared pool, queue and scheduler and exposes every
//! operator-facing operation over them. The entry point builds one instance
//! and hands it to whatever transport hosts the operations.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::credentials::{
    parse_credentials, BulkAddReport, CredentialPool, CredentialSource, CredentialStore,
    PoolStatus,
};
use crate::error::ServiceError;
use crate::fetcher::Fetcher;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::config::validate_job_config;
use crate::scheduler::{
    HealthReport, JobConfig, JobDetails, JobPriority, JobQueue, JobResults, QueueStatus,
    Scheduler, SchedulerConfig, SchedulerConfigPatch, ServiceStatus,
};
use crate::storage::{JobPersister, SqliteStore, StoredResult};
use crate::validation::{validate_and_clean, ItemFormat};

/// Outcome of a job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub job_id: Uuid,
    /// Items accepted into the job after cleaning.
    pub accepted: usize,
    /// Reasons for each dropped item.
    pub rejected: Vec<String>,
}

/// Shared handle over the pool, queue and scheduler.
pub struct Service {
    pool: Arc<CredentialPool>,
    queue: Arc<JobQueue>,
    scheduler: Arc<Scheduler>,
    store: Option<SqliteStore>,
}

impl Service {
    /// Wraps already-constructed components.
    pub fn new(pool: Arc<CredentialPool>, queue: Arc<JobQueue>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            pool,
            queue,
            scheduler,
            store: None,
        }
    }

    /// Builds every component from configuration.
    ///
    /// When `database_url` is set, the pool writes through to SQLite, stored
    /// credentials are loaded, and results are persisted as they arrive.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the database
    /// cannot be opened.
    pub async fn from_config(
        config: &AppConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        if let Err(e) = init_metrics() {
            warn!(error = %e, "Failed to initialize metrics");
        }

        let queue = Arc::new(JobQueue::new());

        let Some(url) = config.database_url.as_deref() else {
            let pool = Arc::new(CredentialPool::new(config.pool_config()));
            let scheduler = Arc::new(Scheduler::new(
                config.scheduler.clone(),
                Arc::clone(&pool),
                Arc::clone(&queue),
                fetcher,
            ));
            return Ok(Self::new(pool, queue, scheduler));
        };

        let store = SqliteStore::connect(url).await?;
        let pool = Arc::new(CredentialPool::with_store(
            config.pool_config(),
            Arc::new(store.clone()) as Arc<dyn CredentialStore>,
        ));
        let loaded = pool.load_from_store().await?;

        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            Arc::clone(&pool),
            Arc::clone(&queue),
            fetcher,
        )
        .with_persister(Arc::new(store.clone()) as Arc<dyn JobPersister>);

        info!(database_url = %url, credentials = loaded, "Service initialized with storage");
        Ok(Self {
            pool,
            queue,
            scheduler: Arc::new(scheduler),
            store: Some(store),
        })
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    // ---- jobs ----

    /// Submits a job of free-form items.
    pub async fn submit(
        &self,
        items: &[String],
        priority: JobPriority,
        config: JobConfig,
    ) -> Result<Submission, ServiceError> {
        self.submit_with_format(items, priority, config, ItemFormat::Any)
            .await
    }

    /// Submits a job, cleaning items against `format` first.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::EmptyJob` for an empty list,
    /// `ServiceError::NoValidItems` when nothing survives cleaning, and
    /// `ServiceError::Config` for an invalid job config.
    pub async fn submit_with_format(
        &self,
        items: &[String],
        priority: JobPriority,
        config: JobConfig,
        format: ItemFormat,
    ) -> Result<Submission, ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::EmptyJob);
        }
        validate_job_config(&config)?;

        let report = validate_and_clean(items, format);
        if report.clean.is_empty() {
            return Err(ServiceError::NoValidItems {
                invalid: report.invalid.len(),
            });
        }
        if !report.is_clean() {
            warn!(
                rejected = report.invalid.len(),
                accepted = report.clean.len(),
                "Dropped invalid items from submission"
            );
        }

        let accepted = report.clean.len();
        let job_id = self.queue.create_job(report.clean, priority, config).await?;

        Ok(Submission {
            job_id,
            accepted,
            rejected: report.invalid,
        })
    }

    pub async fn job_details(&self, id: Uuid) -> Result<JobDetails, ServiceError> {
        self.queue
            .job_details(id)
            .await
            .ok_or(ServiceError::JobNotFound(id))
    }

    /// Latest results and errors of a job, up to `limit` of each.
    pub async fn job_results(
        &self,
        id: Uuid,
        limit: Option<usize>,
    ) -> Result<JobResults, ServiceError> {
        self.queue
            .job_results(id, limit)
            .await
            .ok_or(ServiceError::JobNotFound(id))
    }

    /// Results persisted for a job. Empty without storage.
    pub async fn stored_results(&self, id: Uuid) -> Result<Vec<StoredResult>, ServiceError> {
        match &self.store {
            Some(store) => Ok(store.results_for_job(id).await?),
            None => Ok(Vec::new()),
        }
    }

    /// Cancels a pending job. Returns `false` if it is not pending.
    pub async fn cancel_job(&self, id: Uuid) -> bool {
        self.queue.cancel(id).await
    }

    /// Asks the processor running `id` to stop after its current item.
    pub async fn stop_job(&self, id: Uuid) -> bool {
        self.scheduler.stop_processor(id).await
    }

    pub async fn list_pending(&self) -> Vec<JobDetails> {
        self.queue.list_pending().await
    }

    pub async fn list_active(&self) -> Vec<JobDetails> {
        self.queue.list_active().await
    }

    pub async fn list_completed(&self, limit: usize) -> Vec<JobDetails> {
        self.queue.list_recent_completed(limit).await
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.queue.status().await
    }

    /// Polls until the job reaches a terminal status.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::JobNotFound` if the job disappears.
    pub async fn wait_for_job(
        &self,
        id: Uuid,
        poll_interval: Duration,
    ) -> Result<JobDetails, ServiceError> {
        loop {
            let details = self.job_details(id).await?;
            if details.status.is_terminal() {
                return Ok(details);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    // ---- credentials ----

    pub async fn add_credential(
        &self,
        secret: &str,
        id: Option<&str>,
    ) -> Result<String, ServiceError> {
        Ok(self.pool.add(secret, id).await?)
    }

    pub async fn add_credentials(&self, secrets: &[String]) -> BulkAddReport {
        self.pool.add_many(secrets).await
    }

    /// Parses a credentials document and adds every secret found.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NoCredentials` if nothing could be parsed.
    pub async fn import_credentials(&self, content: &str) -> Result<BulkAddReport, ServiceError> {
        let secrets = parse_credentials(content);
        if secrets.is_empty() {
            return Err(ServiceError::NoCredentials);
        }
        Ok(self.pool.add_many(&secrets).await)
    }

    /// Reads a credentials file and imports it.
    pub async fn import_credentials_file(
        &self,
        path: &Path,
    ) -> Result<BulkAddReport, ServiceError> {
        let content = tokio::fs::read_to_string(path).await?;
        let report = self.import_credentials(&content).await?;
        info!(
            path = %path.display(),
            added = report.added,
            failed = report.failed,
            "Imported credentials"
        );
        Ok(report)
    }

    /// Pulls one fresh credential from `source` into the pool.
    ///
    /// Operator-triggered; typically used after the pool reports exhaustion.
    pub async fn top_up_from(&self, source: &dyn CredentialSource) -> Result<String, ServiceError> {
        let secret = source.extract_fresh().await?;
        let id = self.pool.add(&secret, None).await?;
        info!(credential_id = %id, "Topped up pool from credential source");
        Ok(id)
    }

    pub async fn remove_credential(&self, id: &str) -> Result<(), ServiceError> {
        if self.pool.remove(id).await {
            Ok(())
        } else {
            Err(ServiceError::CredentialNotFound(id.to_string()))
        }
    }

    pub async fn reactivate_credential(&self, id: &str) -> Result<(), ServiceError> {
        if self.pool.reactivate(id).await {
            Ok(())
        } else {
            Err(ServiceError::CredentialNotFound(id.to_string()))
        }
    }

    pub async fn credential_status(&self) -> PoolStatus {
        self.pool.status().await
    }

    // ---- scheduler ----

    pub async fn start_scheduler(&self) -> Result<(), ServiceError> {
        Ok(self.scheduler.start().await?)
    }

    pub async fn stop_scheduler(&self) -> Result<(), ServiceError> {
        Ok(self.scheduler.shutdown().await?)
    }

    pub async fn service_status(&self) -> ServiceStatus {
        self.scheduler.service_status().await
    }

    pub async fn health(&self) -> HealthReport {
        self.scheduler.health_check().await
    }

    /// Prometheus text exposition of all metrics.
    pub fn metrics_text(&self) -> String {
        export_metrics()
    }

    pub async fn update_config(
        &self,
        patch: &SchedulerConfigPatch,
    ) -> Result<SchedulerConfig, ServiceError> {
        Ok(self.scheduler.update_config(patch).await?)
    }

    /// Purges old terminal jobs now.
    pub async fn cleanup(&self) -> usize {
        let removed = self.scheduler.cleanup().await;
        info!(removed = removed, "Manual cleanup complete");
        removed
    }

    pub async fn requeue_remaining(&self, id: Uuid) -> Result<Uuid, ServiceError> {
        Ok(self.scheduler.requeue_remaining(id).await?)
    }
}
