//! Credential records held by the pool.
//!
//! A credential wraps an opaque secret that authorizes calls against the
//! external resource. Each one carries a daily quota, an expiry and an error
//! counter that drives automatic deactivation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of secret characters shown in status output.
const SECRET_PREVIEW_CHARS: usize = 50;

/// A quota-bounded, time-bounded capability token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    /// Unique identifier.
    pub id: String,
    /// Opaque payload handed to the fetcher.
    pub secret: String,
    /// When the credential was added.
    pub created_at: DateTime<Utc>,
    /// When the credential stops being usable.
    pub expires_at: DateTime<Utc>,
    /// Requests made since the last daily reset.
    pub daily_usage: u32,
    /// Requests made over the credential's lifetime.
    pub total_usage: u64,
    /// Whether the credential may be selected at all.
    pub is_active: bool,
    /// Last time the credential was handed out.
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Consecutive credential faults, decayed by successes.
    pub error_count: u32,
    /// Most recent credential fault message.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Consecutive uses by the current rotation session. Not persisted.
    #[serde(skip)]
    pub rotation_session_usage: u32,
}

impl Credential {
    /// Creates a fresh credential with zeroed counters.
    pub fn new(
        id: impl Into<String>,
        secret: impl Into<String>,
        now: DateTime<Utc>,
        lifetime: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            created_at: now,
            expires_at: now + lifetime,
            daily_usage: 0,
            total_usage: 0,
            is_active: true,
            last_used_at: None,
            error_count: 0,
            last_error: None,
            rotation_session_usage: 0,
        }
    }

    /// Returns whether this credential can be handed out at `now`.
    pub fn is_available(&self, max_daily: u32, now: DateTime<Utc>) -> bool {
        self.is_active && self.daily_usage < max_daily && self.expires_at > now
    }

    /// Returns whether the credential has passed its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Requests left before the daily quota is reached.
    pub fn remaining_daily(&self, max_daily: u32) -> u32 {
        max_daily.saturating_sub(self.daily_usage)
    }

    /// Records one use of the credential.
    pub(crate) fn record_use(&mut self, now: DateTime<Utc>) {
        self.daily_usage += 1;
        self.total_usage += 1;
        self.last_used_at = Some(now);
    }

    /// Truncated secret for display.
    pub fn secret_preview(&self) -> String {
        let preview: String = self.secret.chars().take(SECRET_PREVIEW_CHARS).collect();
        format!("{}...", preview)
    }
}

/// Generates a credential id from the secret's hash and a timestamp.
///
/// The format is `token_{16 hex chars}_{unix seconds}`.
pub fn generate_credential_id(secret: &str, now: DateTime<Utc>) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let hash = hex::encode(digest);
    format!("token_{}_{}", &hash[..16], now.timestamp())
}

/// Per-credential detail reported by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialDetail {
    pub id: String,
    pub daily_usage: u32,
    pub total_usage: u64,
    pub is_active: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub remaining_usage: u32,
    pub secret_preview: String,
}

impl CredentialDetail {
    pub(crate) fn from_credential(credential: &Credential, max_daily: u32) -> Self {
        Self {
            id: credential.id.clone(),
            daily_usage: credential.daily_usage,
            total_usage: credential.total_usage,
            is_active: credential.is_active,
            error_count: credential.error_count,
            last_error: credential.last_error.clone(),
            created_at: credential.created_at,
            expires_at: credential.expires_at,
            last_used_at: credential.last_used_at,
            remaining_usage: credential.remaining_daily(max_daily),
            secret_preview: credential.secret_preview(),
        }
    }
}
