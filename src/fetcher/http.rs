//! HTTP implementation of the fetcher contract.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{FetchError, Fetcher};

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Looks items up with `GET {endpoint}?q={item}` using a bearer credential.
pub struct HttpFetcher {
    endpoint: String,
    http_client: Client,
}

impl HttpFetcher {
    /// Creates a fetcher for `endpoint` with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns `reqwest::Error` if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(endpoint, DEFAULT_TIMEOUT)
    }

    /// Creates a fetcher with a custom request timeout.
    pub fn with_timeout(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            endpoint: endpoint.into(),
            http_client: Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url_for(&self, item: &str) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}q={}",
            self.endpoint,
            separator,
            urlencoding::encode(item)
        )
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, item: &str, secret: &str) -> Result<serde_json::Value, FetchError> {
        let url = self.url_for(item);
        debug!(url = %url, "Fetching item");

        let response = self
            .http_client
            .get(&url)
            .header("Authorization", format!("Bearer {}", secret))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| FetchError::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(FetchError::status(status.as_u16(), body));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| FetchError::transport(format!("Failed to parse response: {}", e)))
    }
}
