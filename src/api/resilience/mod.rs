//! Retry and backoff for remote API interactions.

pub mod retry;

pub use retry::{RetryConfig, RetryPolicy, RetryableError};
