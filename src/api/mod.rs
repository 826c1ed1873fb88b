//! Remote data API module
//!
//! Token lifecycle, retrying transport, filter resolution, payload repair,
//! and the paginated fetch loop that feeds pages into persistence.

pub mod auth;
pub mod criteria;
pub mod fetcher;
pub mod payload;
pub mod resilience;
pub mod transport;

pub use auth::{BearerToken, OAuthTokenSource, TokenManager, TokenSource, REFRESH_SKEW};
pub use fetcher::{FetchOutcome, Page, PageSink, PaginatedFetcher, MAX_ITERATIONS};
pub use resilience::{RetryConfig, RetryPolicy, RetryableError};
pub use transport::{ApiTransport, HttpReply, HttpTransport};
