//! Bearer token lifecycle
//!
//! One token per run, owned by [`TokenManager`], refreshed via the OAuth2
//! client-credentials grant. Refresh happens at most once per staleness
//! event: all callers serialize on an internal mutex and re-check freshness
//! before fetching.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::api::resilience::RetryPolicy;
use crate::api::transport::{classify_reqwest_error, HttpReply};
use crate::catalog::AccessInfo;
use crate::deadline::Deadline;
use crate::error::{SyncError, SyncResult};

/// Tokens are considered stale this long before their actual expiry, so a
/// page request started near the boundary still carries a live token.
pub const REFRESH_SKEW: Duration = Duration::from_secs(180);

const TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Access token plus its absolute expiry. Never persisted.
#[derive(Debug, Clone)]
pub struct BearerToken {
    pub access_token: String,
    pub expires_at: SystemTime,
}

impl BearerToken {
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        now + REFRESH_SKEW < self.expires_at
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(SystemTime::now())
    }
}

/// Where new tokens come from. Production uses [`OAuthTokenSource`]; tests
/// count refreshes through a fake.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, access: &AccessInfo, deadline: &Deadline) -> SyncResult<BearerToken>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Client-credentials POST against the tenant's token endpoint.
pub struct OAuthTokenSource {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl OAuthTokenSource {
    pub fn new(http: reqwest::Client, retry: RetryPolicy) -> Self {
        Self { http, retry }
    }
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn fetch(&self, access: &AccessInfo, deadline: &Deadline) -> SyncResult<BearerToken> {
        if deadline.expired() {
            return Err(SyncError::DeadlineExceeded);
        }

        let reply = self
            .retry
            .execute("token request", || async {
                let response = self
                    .http
                    .post(&access.url)
                    .form(&[
                        ("grant_type", access.grant_type.as_str()),
                        ("client_id", access.client_id.as_str()),
                        ("client_secret", access.client_secret.as_str()),
                        ("scope", access.scope.as_str()),
                    ])
                    .timeout(deadline.cap(TOKEN_TIMEOUT))
                    .send()
                    .await
                    .map_err(classify_reqwest_error)?;

                let status = response.status().as_u16();
                let body = response.text().await.map_err(classify_reqwest_error)?;
                Ok(HttpReply { status, body })
            })
            .await
            .map_err(|e| match e {
                SyncError::DeadlineExceeded => SyncError::DeadlineExceeded,
                other => SyncError::auth_with_source("token request failed after retries", other),
            })?;

        if !(200..300).contains(&reply.status) {
            return Err(SyncError::auth(format!(
                "token endpoint returned status {}",
                reply.status
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&reply.body)
            .map_err(|e| SyncError::auth_with_source("malformed token response body", e))?;

        Ok(BearerToken {
            access_token: parsed.access_token,
            expires_at: SystemTime::now() + Duration::from_secs(parsed.expires_in),
        })
    }
}

/// Owns the run's single bearer token.
pub struct TokenManager<S> {
    source: S,
    current: Mutex<Option<BearerToken>>,
}

impl<S: TokenSource> TokenManager<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            current: Mutex::new(None),
        }
    }

    /// Returns the held token if it is still fresh, otherwise refreshes.
    /// Concurrent callers observing a stale token trigger one refresh: the
    /// loser of the lock race finds a fresh token and returns it.
    pub async fn ensure_valid(
        &self,
        access: &AccessInfo,
        deadline: &Deadline,
    ) -> SyncResult<BearerToken> {
        let mut guard = self.current.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.is_fresh() {
                return Ok(token.clone());
            }
            info!("Token nearing expiry, refreshing...");
        } else {
            info!("Fetching new access token...");
        }

        let token = self.source.fetch(access, deadline).await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Forced refresh after a 401. `seen` is the token the rejected request
    /// carried: if another caller already replaced it, the replacement is
    /// returned without a second fetch.
    pub async fn refresh_stale(
        &self,
        seen: &str,
        access: &AccessInfo,
        deadline: &Deadline,
    ) -> SyncResult<BearerToken> {
        let mut guard = self.current.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.access_token != seen && token.is_fresh() {
                return Ok(token.clone());
            }
        }

        warn!("Token rejected by API, forcing refresh");
        let token = self.source.fetch(access, deadline).await?;
        *guard = Some(token.clone());
        Ok(token)
    }
}
