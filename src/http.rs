//! HTTP transport for topology descriptors.

use crate::error::{TransportError, TransportResult};
use crate::transport::{ConfigTransport, RawDescriptor};
use crate::types::TransportKind;
use async_trait::async_trait;
use std::time::Duration;

/// Fetches the bucket descriptor from the first seed whose management
/// interface answers.
pub struct HttpConfigTransport {
    urls: Vec<String>,
    bucket: String,
    password: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpConfigTransport {
    pub fn new(urls: Vec<String>, bucket: String, password: String, timeout: Duration) -> Self {
        Self {
            urls,
            bucket,
            password,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    async fn fetch_one(&self, url: &str) -> TransportResult<String> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.bucket, Some(&self.password))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("{} returned {}", url, status)));
        }
        response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }
}

#[async_trait]
impl ConfigTransport for HttpConfigTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn fetch(&self) -> TransportResult<Vec<RawDescriptor>> {
        let mut last_error = TransportError::NoResponse;
        for url in &self.urls {
            match self.fetch_one(url).await {
                Ok(text) if !text.trim().is_empty() => {
                    let origin = reqwest::Url::parse(url)
                        .ok()
                        .and_then(|parsed| parsed.host_str().map(str::to_string))
                        .unwrap_or_default();
                    return Ok(vec![RawDescriptor { origin, text }]);
                }
                Ok(_) => {
                    tracing::debug!(url = %url, "empty bucket configuration");
                }
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "bucket configuration fetch failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
