//! Credential pool with quota tracking and rotation.
//!
//! The pool hands out the least-loaded available credential for each unit of
//! work. Processors use [`CredentialPool::acquire_rotating`], which keeps a
//! credential for a bounded run of consecutive calls before moving on to a
//! different one.
//!
//! Exhaustion is reported as [`Acquisition::Exhausted`], never as an error:
//! callers are expected to back off.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;

use super::credential::{generate_credential_id, Credential, CredentialDetail};
use super::store::{CredentialStore, StoreError};

/// Errors returned by pool mutations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A credential with the same secret is already pooled.
    #[error("Credential already present as '{0}'")]
    DuplicateSecret(String),

    /// A credential with the same id is already pooled.
    #[error("Credential id '{0}' already exists")]
    DuplicateId(String),

    /// The secret was empty after trimming.
    #[error("Credential secret is empty")]
    EmptySecret,
}

/// Tunables for the credential pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Requests a credential may serve per calendar day.
    pub max_daily_requests: u32,
    /// Credential faults that deactivate a credential.
    pub error_threshold: u32,
    /// Lifetime assigned to newly added credentials.
    pub credential_lifetime: Duration,
    /// How recently a credential must have been used to be penalized on switch.
    pub recent_use_window: Duration,
    /// Score penalty for recently used credentials on switch.
    pub recent_use_penalty: u32,
    /// Score weight of each recorded credential fault.
    pub error_weight: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_daily_requests: 500,
            error_threshold: 5,
            credential_lifetime: Duration::hours(22),
            recent_use_window: Duration::minutes(5),
            recent_use_penalty: 5,
            error_weight: 10,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the daily request quota per credential.
    pub fn with_max_daily_requests(mut self, max: u32) -> Self {
        self.max_daily_requests = max;
        self
    }

    /// Sets the lifetime of newly added credentials.
    pub fn with_credential_lifetime(mut self, lifetime: Duration) -> Self {
        self.credential_lifetime = lifetime;
        self
    }

    /// Sets the fault count that deactivates a credential.
    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }
}

/// Outcome of a credential request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// A credential was reserved for one request.
    Granted { id: String, secret: String },
    /// No credential is available right now.
    Exhausted,
}

impl Acquisition {
    /// Returns `(id, secret)` when a credential was granted.
    pub fn granted(&self) -> Option<(&str, &str)> {
        match self {
            Acquisition::Granted { id, secret } => Some((id.as_str(), secret.as_str())),
            Acquisition::Exhausted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Acquisition::Exhausted)
    }
}

/// Aggregate pool status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total_credentials: usize,
    pub active_credentials: usize,
    pub available_credentials: usize,
    pub total_daily_usage: u64,
    pub max_daily_capacity: u64,
    pub available_capacity: u64,
    pub usage_percentage: f64,
    pub credentials: Vec<CredentialDetail>,
}

/// Result of a bulk add.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkAddReport {
    pub added: usize,
    pub failed: usize,
    pub details: Vec<BulkAddEntry>,
}

/// Outcome for one secret of a bulk add.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAddEntry {
    /// Position of the secret in the input.
    pub index: usize,
    pub id: Option<String>,
    pub error: Option<String>,
}

struct PoolState {
    /// Insertion order is the tie-breaker for selection.
    credentials: Vec<Credential>,
    last_reset: NaiveDate,
}

impl PoolState {
    fn position(&self, id: &str) -> Option<usize> {
        self.credentials.iter().position(|c| c.id == id)
    }
}

/// Pool of interchangeable credentials.
pub struct CredentialPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    store: Option<Arc<dyn CredentialStore>>,
    metrics: MetricsCollector,
}

impl CredentialPool {
    /// Creates an empty pool without durable storage.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                credentials: Vec::new(),
                last_reset: Utc::now().date_naive(),
            }),
            store: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates an empty pool that writes every mutation through to `store`.
    pub fn with_store(config: PoolConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Replaces the pool contents with the store's records.
    ///
    /// Returns the number of credentials loaded; zero without a store.
    pub async fn load_from_store(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let loaded = store.load_all().await?;
        let count = loaded.len();
        let mut state = self.state.lock().await;
        state.credentials = loaded;
        drop(state);

        info!(count = count, "Loaded credentials from store");
        Ok(count)
    }

    /// Adds a credential, generating an id when none is given.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::DuplicateSecret` if the secret is already pooled and
    /// `PoolError::DuplicateId` if the id is taken.
    pub async fn add(&self, secret: &str, id: Option<&str>) -> Result<String, PoolError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(PoolError::EmptySecret);
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(existing) = state.credentials.iter().find(|c| c.secret == secret) {
            return Err(PoolError::DuplicateSecret(existing.id.clone()));
        }

        let id = match id {
            Some(id) => id.to_string(),
            None => generate_credential_id(secret, now),
        };
        if state.position(&id).is_some() {
            return Err(PoolError::DuplicateId(id));
        }

        let credential = Credential::new(&id, secret, now, self.config.credential_lifetime);
        state.credentials.push(credential.clone());
        drop(state);

        info!(
            credential_id = %id,
            expires_at = %credential.expires_at,
            "Added credential"
        );
        self.persist(&credential).await;

        Ok(id)
    }

    /// Adds several credentials, reporting the outcome of each.
    pub async fn add_many(&self, secrets: &[String]) -> BulkAddReport {
        let mut report = BulkAddReport::default();

        for (index, secret) in secrets.iter().enumerate() {
            match self.add(secret, None).await {
                Ok(id) => {
                    report.added += 1;
                    report.details.push(BulkAddEntry {
                        index,
                        id: Some(id),
                        error: None,
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    report.details.push(BulkAddEntry {
                        index,
                        id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        report
    }

    /// Reserves the best available credential for a single request.
    pub async fn acquire(&self) -> Acquisition {
        self.acquire_at(Utc::now()).await
    }

    pub(crate) async fn acquire_at(&self, now: DateTime<Utc>) -> Acquisition {
        let mut state = self.state.lock().await;
        let reset = self.reset_locked(&mut state, now);

        let picked = self
            .select_best(&state.credentials, now, None, false)
            .map(|idx| {
                let credential = &mut state.credentials[idx];
                credential.record_use(now);
                credential.clone()
            });
        drop(state);

        self.finish_acquisition(picked, reset).await
    }

    /// Reserves a credential, staying on `current` for up to
    /// `requests_per_credential` consecutive calls.
    ///
    /// When switching, recently used credentials are penalized. If no other
    /// credential is available the current one is reused past its run length.
    pub async fn acquire_rotating(
        &self,
        current: Option<&str>,
        requests_per_credential: u32,
    ) -> Acquisition {
        self.acquire_rotating_at(current, requests_per_credential, Utc::now())
            .await
    }

    pub(crate) async fn acquire_rotating_at(
        &self,
        current: Option<&str>,
        requests_per_credential: u32,
        now: DateTime<Utc>,
    ) -> Acquisition {
        let max_daily = self.config.max_daily_requests;
        let mut state = self.state.lock().await;
        let reset = self.reset_locked(&mut state, now);

        let current_idx = current
            .and_then(|id| state.position(id))
            .filter(|&idx| state.credentials[idx].is_available(max_daily, now));

        if let Some(idx) = current_idx {
            let credential = &mut state.credentials[idx];
            if credential.rotation_session_usage < requests_per_credential {
                credential.record_use(now);
                credential.rotation_session_usage += 1;
                let snapshot = credential.clone();
                drop(state);
                return self.finish_acquisition(Some(snapshot), reset).await;
            }
        }

        let picked = self
            .select_best(&state.credentials, now, current, true)
            .or(current_idx)
            .map(|idx| {
                let credential = &mut state.credentials[idx];
                credential.record_use(now);
                credential.rotation_session_usage = 1;
                credential.clone()
            });
        drop(state);

        if let Some(credential) = &picked {
            if current != Some(credential.id.as_str()) {
                debug!(
                    from = current.unwrap_or("none"),
                    to = %credential.id,
                    "Rotated credential"
                );
            }
        }

        self.finish_acquisition(picked, reset).await
    }

    /// Records a successful request, decaying the credential's error count.
    ///
    /// Returns `false` if the id is unknown.
    pub async fn report_success(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(idx) = state.position(id) else {
            return false;
        };

        let credential = &mut state.credentials[idx];
        if credential.error_count == 0 {
            return true;
        }
        credential.error_count -= 1;
        if credential.error_count == 0 {
            credential.last_error = None;
        }
        let snapshot = credential.clone();
        drop(state);

        self.persist(&snapshot).await;
        true
    }

    /// Records a failed request.
    ///
    /// Only credential faults count; once the error count reaches the threshold
    /// the credential is deactivated until an operator reactivates it.
    /// Returns `false` if the id is unknown.
    pub async fn report_error(&self, id: &str, message: &str, is_credential_fault: bool) -> bool {
        let mut state = self.state.lock().await;
        let Some(idx) = state.position(id) else {
            return false;
        };

        if !is_credential_fault {
            debug!(credential_id = %id, "Ignoring non-credential failure");
            return true;
        }

        let credential = &mut state.credentials[idx];
        credential.error_count += 1;
        credential.last_error = Some(message.to_string());

        let deactivated =
            credential.is_active && credential.error_count >= self.config.error_threshold;
        if deactivated {
            credential.is_active = false;
        }
        let snapshot = credential.clone();
        drop(state);

        if deactivated {
            warn!(
                credential_id = %id,
                error_count = snapshot.error_count,
                last_error = %message,
                "Credential deactivated after repeated faults"
            );
            self.metrics.record_credential_deactivated();
        } else {
            debug!(
                credential_id = %id,
                error_count = snapshot.error_count,
                "Recorded credential fault"
            );
        }

        self.persist(&snapshot).await;
        true
    }

    /// Re-enables a deactivated credential and clears its fault history.
    pub async fn reactivate(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(idx) = state.position(id) else {
            return false;
        };

        let credential = &mut state.credentials[idx];
        credential.is_active = true;
        credential.error_count = 0;
        credential.last_error = None;
        let snapshot = credential.clone();
        drop(state);

        info!(credential_id = %id, "Credential reactivated");
        self.persist(&snapshot).await;
        true
    }

    /// Removes a credential from the pool and the store.
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(idx) = state.position(id) else {
            return false;
        };
        state.credentials.remove(idx);
        drop(state);

        if let Some(store) = &self.store {
            if let Err(e) = store.delete(id).await {
                warn!(credential_id = %id, error = %e, "Failed to delete credential from store");
            }
        }

        info!(credential_id = %id, "Removed credential");
        true
    }

    /// Remaining requests today across active, unexpired credentials.
    pub async fn available_capacity(&self) -> u64 {
        self.available_capacity_at(Utc::now()).await
    }

    pub(crate) async fn available_capacity_at(&self, now: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock().await;
        let reset = self.reset_locked(&mut state, now);
        let capacity = self.capacity_locked(&state, now);
        drop(state);

        if let Some(snapshots) = reset {
            self.persist_all(&snapshots).await;
        }
        capacity
    }

    /// Zeroes every daily counter once per calendar day.
    ///
    /// Returns `true` when a reset happened.
    pub async fn reset_daily_usage_if_new_day(&self) -> bool {
        self.reset_daily_usage_if_new_day_at(Utc::now()).await
    }

    pub(crate) async fn reset_daily_usage_if_new_day_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        let reset = self.reset_locked(&mut state, now);
        drop(state);

        match reset {
            Some(snapshots) => {
                self.persist_all(&snapshots).await;
                true
            }
            None => false,
        }
    }

    /// Returns a copy of a credential.
    pub async fn get(&self, id: &str) -> Option<Credential> {
        let state = self.state.lock().await;
        state.position(id).map(|idx| state.credentials[idx].clone())
    }

    /// Number of pooled credentials.
    pub async fn len(&self) -> usize {
        self.state.lock().await.credentials.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Aggregate counts and per-credential detail.
    pub async fn status(&self) -> PoolStatus {
        let now = Utc::now();
        let max_daily = self.config.max_daily_requests;
        let state = self.state.lock().await;

        let total = state.credentials.len();
        let total_daily_usage: u64 = state
            .credentials
            .iter()
            .map(|c| u64::from(c.daily_usage))
            .sum();
        let max_daily_capacity = total as u64 * u64::from(max_daily);

        PoolStatus {
            total_credentials: total,
            active_credentials: state.credentials.iter().filter(|c| c.is_active).count(),
            available_credentials: state
                .credentials
                .iter()
                .filter(|c| c.is_available(max_daily, now))
                .count(),
            total_daily_usage,
            max_daily_capacity,
            available_capacity: self.capacity_locked(&state, now),
            usage_percentage: if max_daily_capacity > 0 {
                total_daily_usage as f64 / max_daily_capacity as f64 * 100.0
            } else {
                0.0
            },
            credentials: state
                .credentials
                .iter()
                .map(|c| CredentialDetail::from_credential(c, max_daily))
                .collect(),
        }
    }

    fn capacity_locked(&self, state: &PoolState, now: DateTime<Utc>) -> u64 {
        state
            .credentials
            .iter()
            .filter(|c| c.is_active && !c.is_expired(now))
            .map(|c| u64::from(c.remaining_daily(self.config.max_daily_requests)))
            .sum()
    }

    /// Lowest-score available credential, ties going to insertion order.
    fn select_best(
        &self,
        credentials: &[Credential],
        now: DateTime<Utc>,
        exclude: Option<&str>,
        penalize_recent: bool,
    ) -> Option<usize> {
        credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_available(self.config.max_daily_requests, now))
            .filter(|(_, c)| exclude != Some(c.id.as_str()))
            .min_by_key(|(idx, c)| (self.score(c, now, penalize_recent), *idx))
            .map(|(idx, _)| idx)
    }

    fn score(&self, credential: &Credential, now: DateTime<Utc>, penalize_recent: bool) -> u64 {
        let mut score = u64::from(credential.daily_usage)
            + u64::from(credential.error_count) * u64::from(self.config.error_weight);

        if penalize_recent {
            let recent = credential
                .last_used_at
                .is_some_and(|used| now - used < self.config.recent_use_window);
            if recent {
                score += u64::from(self.config.recent_use_penalty);
            }
        }

        score
    }

    /// Resets daily counters on a date rollover. Returns the reset records.
    fn reset_locked(&self, state: &mut PoolState, now: DateTime<Utc>) -> Option<Vec<Credential>> {
        let today = now.date_naive();
        if today <= state.last_reset {
            return None;
        }

        state.last_reset = today;
        for credential in &mut state.credentials {
            credential.daily_usage = 0;
        }

        info!(
            date = %today,
            credentials = state.credentials.len(),
            "Daily credential usage reset"
        );
        Some(state.credentials.clone())
    }

    async fn finish_acquisition(
        &self,
        picked: Option<Credential>,
        reset: Option<Vec<Credential>>,
    ) -> Acquisition {
        if let Some(snapshots) = reset {
            self.persist_all(&snapshots).await;
        }

        match picked {
            Some(credential) => {
                self.metrics.record_acquisition(true);
                self.persist(&credential).await;
                Acquisition::Granted {
                    id: credential.id,
                    secret: credential.secret,
                }
            }
            None => {
                self.metrics.record_acquisition(false);
                debug!("No credential available");
                Acquisition::Exhausted
            }
        }
    }

    async fn persist(&self, credential: &Credential) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(credential).await {
                warn!(
                    credential_id = %credential.id,
                    error = %e,
                    "Failed to persist credential"
                );
            }
        }
    }

    async fn persist_all(&self, credentials: &[Credential]) {
        for credential in credentials {
            self.persist(credential).await;
        }
    }
}
