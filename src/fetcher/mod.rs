//! Contract for the external unit of work.
//!
//! A [`Fetcher`] performs one call against the rate-limited resource using a
//! credential secret. Failures come back as a [`FetchError`] carrying the
//! response status, which [`classify`] maps onto the closed [`ErrorKind`]
//! taxonomy. Nothing here inspects error message text.

pub mod http;

use std::fmt;

use async_trait::async_trait;

use crate::scheduler::job::ErrorKind;

pub use http::HttpFetcher;

/// A failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    /// Response status, `None` when no response was received.
    pub status: Option<u16>,
    /// Response body or transport error text.
    pub body: String,
}

impl FetchError {
    /// Error carrying an HTTP status.
    pub fn status(code: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            body: body.into(),
        }
    }

    /// Error raised before any response arrived.
    pub fn transport(body: impl Into<String>) -> Self {
        Self {
            status: None,
            body: body.into(),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "Fetch failed with status {}: {}", code, self.body),
            None => write!(f, "Fetch failed: {}", self.body),
        }
    }
}

impl std::error::Error for FetchError {}

/// Maps a fetch failure onto the error taxonomy.
///
/// | Status          | Kind             |
/// |-----------------|------------------|
/// | 401, 429        | CredentialFault  |
/// | 403, 404, 424   | TargetRejected   |
/// | anything else   | Unexpected       |
pub fn classify(error: &FetchError) -> ErrorKind {
    match error.status {
        Some(401) | Some(429) => ErrorKind::CredentialFault,
        Some(403) | Some(404) | Some(424) => ErrorKind::TargetRejected,
        _ => ErrorKind::Unexpected,
    }
}

/// Performs the unit of work for one item.
///
/// Implementations must tolerate concurrent calls, one per active processor.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, item: &str, secret: &str) -> Result<serde_json::Value, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_credential_faults() {
        assert_eq!(
            classify(&FetchError::status(401, "expired")),
            ErrorKind::CredentialFault
        );
        assert_eq!(
            classify(&FetchError::status(429, "slow down")),
            ErrorKind::CredentialFault
        );
    }

    #[test]
    fn test_classify_target_rejections() {
        for code in [403, 404, 424] {
            assert_eq!(
                classify(&FetchError::status(code, "no")),
                ErrorKind::TargetRejected
            );
        }
    }

    #[test]
    fn test_classify_unexpected() {
        assert_eq!(
            classify(&FetchError::status(500, "oops")),
            ErrorKind::Unexpected
        );
        assert_eq!(
            classify(&FetchError::transport("connection reset")),
            ErrorKind::Unexpected
        );
    }

    #[test]
    fn test_fetch_error_display() {
        let err = FetchError::status(403, "restricted");
        assert_eq!(err.to_string(), "Fetch failed with status 403: restricted");

        let err = FetchError::transport("timeout");
        assert_eq!(err.to_string(), "Fetch failed: timeout");
    }
}
