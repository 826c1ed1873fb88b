//! HTTP transport seam for the remote data API
//!
//! The fetch loop talks to the API through [`ApiTransport`] so tests can
//! script page sequences without a network.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::deadline::Deadline;
use crate::error::{SyncError, SyncResult};

/// Status and body of one API reply. Statuses are carried rather than
/// converted to errors so the caller can distinguish 401 from other 4xx.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// One authenticated GET against the remote data API.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn get(&self, url: &str, bearer: &str, deadline: &Deadline) -> SyncResult<HttpReply>;
}

/// reqwest-backed transport with a shared connection pool.
pub struct HttpTransport {
    http: reqwest::Client,
    page_timeout: Duration,
}

impl HttpTransport {
    /// Per-page request timeout. The client-wide default is wider to cover
    /// slow token endpoints.
    pub const PAGE_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            page_timeout: Self::PAGE_TIMEOUT,
        }
    }

    /// Shared HTTP client used by both the transport and the token source.
    pub fn build_client() -> reqwest::Client {
        reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("outbound-sync/1.0")
            .build()
            .expect("Failed to build HTTP client")
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn get(&self, url: &str, bearer: &str, deadline: &Deadline) -> SyncResult<HttpReply> {
        if deadline.expired() {
            return Err(SyncError::DeadlineExceeded);
        }

        debug!("GET {}", url);

        let request = self
            .http
            .get(url)
            .bearer_auth(bearer)
            .header("Accept", "application/json")
            .timeout(deadline.cap(self.page_timeout))
            .send();

        let response = request.await.map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(classify_reqwest_error)?;

        Ok(HttpReply { status, body })
    }
}

/// Errors reqwest raises itself are connection-level or timeout failures;
/// HTTP statuses travel in [`HttpReply`] instead. Both classes are
/// candidates for the retry policy.
pub fn classify_reqwest_error(err: reqwest::Error) -> SyncError {
    SyncError::transient(err.status().map(|s| s.as_u16()), err.to_string())
}
