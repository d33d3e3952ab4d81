//! SQLite-backed credential and result storage.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::credentials::{Credential, CredentialStore, StoreError};
use crate::scheduler::job::WorkResult;

use super::migrations::MigrationRunner;
use super::JobPersister;

/// A result row read back from `work_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub job_id: String,
    pub item: String,
    pub item_number: i64,
    pub credential_id: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

/// SQLite store for credentials and fetched results.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `database_url` and runs
    /// migrations.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite URL (e.g., "sqlite://quotaflow.db")
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Creates a store from an existing pool. Migrations are not run.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MigrationRunner::new(self.pool.clone())
            .run_migrations()
            .await?;
        Ok(())
    }

    async fn insert_result(&self, result: &WorkResult) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&result.payload)?;

        sqlx::query(
            r#"
            INSERT INTO work_results (
                job_id, item, item_number, credential_id, payload, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.job_id.to_string())
        .bind(&result.item)
        .bind(result.item_number as i64)
        .bind(&result.credential_id)
        .bind(payload)
        .bind(result.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stored results of one job, in item order.
    pub async fn results_for_job(&self, job_id: Uuid) -> Result<Vec<StoredResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, item, item_number, credential_id, payload, fetched_at
            FROM work_results
            WHERE job_id = ?
            ORDER BY item_number
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_result).collect()
    }
}

fn row_to_result(row: &SqliteRow) -> Result<StoredResult, StoreError> {
    let job_id: String = row.try_get("job_id")?;
    let raw: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        id: job_id.clone(),
        reason: format!("payload is not JSON: {}", e),
    })?;

    Ok(StoredResult {
        job_id,
        item: row.try_get("item")?,
        item_number: row.try_get("item_number")?,
        credential_id: row.try_get("credential_id")?,
        payload,
        fetched_at: row.try_get("fetched_at")?,
    })
}

fn row_to_credential(row: &SqliteRow) -> Result<Credential, StoreError> {
    let id: String = row.try_get("id")?;
    let counter = |column: &str| -> Result<i64, StoreError> {
        let value: i64 = row.try_get(column)?;
        if value < 0 {
            return Err(StoreError::Corrupt {
                id: id.clone(),
                reason: format!("negative {}", column),
            });
        }
        Ok(value)
    };

    let daily_usage = counter("daily_usage")?;
    let total_usage = counter("total_usage")?;
    let error_count = counter("error_count")?;

    Ok(Credential {
        secret: row.try_get("secret")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        daily_usage: u32::try_from(daily_usage).unwrap_or(u32::MAX),
        total_usage: total_usage as u64,
        is_active: row.try_get("is_active")?,
        last_used_at: row.try_get("last_used_at")?,
        error_count: u32::try_from(error_count).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        rotation_session_usage: 0,
        id,
    })
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn load_all(&self) -> Result<Vec<Credential>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, secret, created_at, expires_at, daily_usage, total_usage,
                   is_active, last_used_at, error_count, last_error
            FROM credentials
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_credential).collect()
    }

    async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO credentials (
                id, secret, created_at, expires_at, daily_usage, total_usage,
                is_active, last_used_at, error_count, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                secret = excluded.secret,
                expires_at = excluded.expires_at,
                daily_usage = excluded.daily_usage,
                total_usage = excluded.total_usage,
                is_active = excluded.is_active,
                last_used_at = excluded.last_used_at,
                error_count = excluded.error_count,
                last_error = excluded.last_error
            "#,
        )
        .bind(&credential.id)
        .bind(&credential.secret)
        .bind(credential.created_at)
        .bind(credential.expires_at)
        .bind(i64::from(credential.daily_usage))
        .bind(credential.total_usage as i64)
        .bind(credential.is_active)
        .bind(credential.last_used_at)
        .bind(i64::from(credential.error_count))
        .bind(&credential.last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM credentials WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobPersister for SqliteStore {
    async fn save(&self, result: &WorkResult) -> bool {
        match self.insert_result(result).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    job_id = %result.job_id,
                    item_number = result.item_number,
                    error = %e,
                    "Failed to persist result"
                );
                false
            }
        }
    }
}
