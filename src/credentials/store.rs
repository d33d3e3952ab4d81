//! Durability and intake seams for the credential pool.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::credential::Credential;

/// Errors raised by credential stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database rejected the operation.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema setup failed.
    #[error("Migration error: {0}")]
    Migration(#[from] crate::storage::MigrationError),

    /// A payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded.
    #[error("Corrupt record '{id}': {reason}")]
    Corrupt { id: String, reason: String },
}

/// Write-through cache for pool state across restarts.
///
/// The in-memory pool is authoritative while running; the store is only read
/// back at startup.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Loads every stored credential.
    async fn load_all(&self) -> Result<Vec<Credential>, StoreError>;

    /// Inserts or replaces a credential.
    async fn save(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Deletes a credential by id. Missing ids are not an error.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Errors raised by a credential source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No fresh credential could be produced.
    #[error("Credential source unavailable: {0}")]
    Unavailable(String),
}

/// Produces fresh credentials from their origin (for example an interactive
/// login). Only used for operator-triggered top-ups.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn extract_fresh(&self) -> Result<String, SourceError>;
}

/// Reads a single credential from a file on every call.
pub struct FileCredentialSource {
    path: std::path::PathBuf,
}

impl FileCredentialSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for FileCredentialSource {
    async fn extract_fresh(&self) -> Result<String, SourceError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", self.path.display(), e)))?;

        super::parse::parse_credentials(&content)
            .into_iter()
            .next()
            .ok_or_else(|| {
                SourceError::Unavailable(format!("{} holds no credential", self.path.display()))
            })
    }
}

/// In-memory store, used in tests and when no database is configured.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored credentials.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns a stored credential by id.
    pub async fn get(&self, id: &str) -> Option<Credential> {
        self.records.read().await.get(id).cloned()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_all(&self) -> Result<Vec<Credential>, StoreError> {
        let mut all: Vec<Credential> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        let cred = Credential::new("c1", "s1", Utc::now(), Duration::hours(1));

        store.save(&cred).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("c1").await.unwrap().secret, "s1");

        store.delete("c1").await.unwrap();
        store.delete("missing").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_source_reads_first_credential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.txt");
        let secret = "z".repeat(64);
        std::fs::write(&path, format!("Bearer {}\n", secret)).unwrap();

        let source = FileCredentialSource::new(&path);
        assert_eq!(source.extract_fresh().await.unwrap(), secret);
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        let source = FileCredentialSource::new("/nonexistent/token.txt");
        assert!(matches!(
            source.extract_fresh().await,
            Err(SourceError::Unavailable(_))
        ));
    }
}
