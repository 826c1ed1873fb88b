//! Retry policy with exponential backoff
//!
//! Transient failures (5xx, 429, connect/timeout) are retried with
//! `2^attempt` second delays plus a bounded random jitter; anything else is
//! returned to the caller on the first attempt.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::api::transport::HttpReply;
use crate::error::{SyncError, SyncResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Adds 0-500ms of random jitter to each delay to avoid retry storms.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries, no delays. For tests.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Types of failures and their retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryableError {
    /// Connection-level errors (refused, DNS, timeout).
    Network,
    /// HTTP 5xx server errors.
    ServerError(u16),
    /// HTTP 429 Too Many Requests.
    RateLimited,
    /// HTTP 408 Request Timeout.
    Timeout,
    /// Other 4xx client errors.
    ClientError(u16),
    /// Everything else, including success statuses.
    Other(u16),
}

impl RetryableError {
    pub fn should_retry(&self) -> bool {
        match self {
            RetryableError::Network => true,
            RetryableError::ServerError(_) => true,
            RetryableError::RateLimited => true,
            RetryableError::Timeout => true,
            RetryableError::ClientError(_) => false,
            RetryableError::Other(_) => false,
        }
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            408 => RetryableError::Timeout,
            429 => RetryableError::RateLimited,
            400..=499 => RetryableError::ClientError(status),
            500..=599 => RetryableError::ServerError(status),
            _ => RetryableError::Other(status),
        }
    }
}

/// Executes HTTP operations with exponential backoff on transient failures.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it yields a non-retryable outcome or attempts
    /// are exhausted. A retryable status on the final attempt surfaces as
    /// `TransientHttpError`; non-retryable replies are returned as-is for
    /// the caller to interpret (401 handling, 4xx fatality).
    pub async fn execute<F, Fut>(&self, what: &str, operation: F) -> SyncResult<HttpReply>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = SyncResult<HttpReply>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = operation().await;

            match outcome {
                Ok(reply) if RetryableError::from_status(reply.status).should_retry() => {
                    if attempt >= self.config.max_attempts {
                        warn!(
                            "{} failed with status {} after {} attempts",
                            what, reply.status, attempt
                        );
                        return Err(SyncError::transient(
                            Some(reply.status),
                            format!("{what} exhausted {attempt} attempts"),
                        ));
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} returned status {} on attempt {}, retrying in {:?}",
                        what, reply.status, attempt, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(reply) => {
                    if attempt > 1 {
                        debug!("{} succeeded after {} attempts", what, attempt);
                    }
                    return Ok(reply);
                }
                Err(err) if err.is_transient() => {
                    if attempt >= self.config.max_attempts {
                        warn!("{} failed after {} attempts: {}", what, attempt, err);
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed on attempt {} ({}), retrying in {:?}",
                        what, attempt, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Exponential backoff delay for the given attempt, capped and jittered.
    fn delay_for(&self, attempt: u32) -> Duration {
        let backoff_ms = (self.config.base_delay.as_millis() as f64)
            * self.config.backoff_multiplier.powi(attempt as i32 - 1);

        let mut delay = Duration::from_millis(backoff_ms as u64).min(self.config.max_delay);

        if self.config.jitter {
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=500));
        }

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn status_classification() {
        assert_eq!(RetryableError::from_status(408), RetryableError::Timeout);
        assert_eq!(RetryableError::from_status(429), RetryableError::RateLimited);
        assert_eq!(
            RetryableError::from_status(404),
            RetryableError::ClientError(404)
        );
        assert_eq!(
            RetryableError::from_status(503),
            RetryableError::ServerError(503)
        );
        assert_eq!(RetryableError::from_status(200), RetryableError::Other(200));
    }

    #[test]
    fn retry_decisions() {
        assert!(RetryableError::Network.should_retry());
        assert!(RetryableError::ServerError(500).should_retry());
        assert!(RetryableError::RateLimited.should_retry());
        assert!(!RetryableError::ClientError(400).should_retry());
        assert!(!RetryableError::Other(200).should_retry());
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        assert_eq!(policy.delay_for(8), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();

        let reply = policy
            .execute("test call", || {
                let calls = calls_in_op.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Ok(HttpReply {
                            status: 503,
                            body: String::new(),
                        })
                    } else {
                        Ok(HttpReply {
                            status: 200,
                            body: "ok".into(),
                        })
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_transient() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();

        let err = policy
            .execute("test call", || {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(HttpReply {
                        status: 500,
                        body: String::new(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_reply_returns_immediately() {
        let policy = RetryPolicy::new(RetryConfig::default());

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();

        let reply = policy
            .execute("test call", || {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(HttpReply {
                        status: 404,
                        body: String::new(),
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(reply.status, 404);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
