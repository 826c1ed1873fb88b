//! Paginated fetch loop
//!
//! Drives `$top`/`$skip` pagination against one API resource, refreshing
//! the bearer token proactively before every page and reactively on 401.
//! Pages are handed to a [`PageSink`] as they arrive; an empty page ends
//! the loop, and a safety bound caps runaway pagination.

use async_trait::async_trait;
use chrono::Local;
use log::{error, info, warn};
use serde_json::Value;

use crate::api::auth::{TokenManager, TokenSource};
use crate::api::criteria;
use crate::api::payload;
use crate::api::resilience::RetryPolicy;
use crate::api::transport::{ApiTransport, HttpReply};
use crate::catalog::{AccessInfo, ResourceSpec};
use crate::deadline::Deadline;
use crate::error::{SyncError, SyncResult};

/// Pagination gives up after this many pages even if the API never returns
/// an empty one.
pub const MAX_ITERATIONS: usize = 100;

/// One fetched unit: the record array plus its position in the run.
#[derive(Debug)]
pub struct Page {
    pub records: Vec<Value>,
    pub skip: i64,
    pub number: usize,
}

impl Page {
    pub fn is_first(&self) -> bool {
        self.number == 0
    }
}

/// Consumer of fetched pages. Returns the number of rows it persisted.
#[async_trait]
pub trait PageSink: Send {
    async fn handle(&mut self, page: &Page) -> SyncResult<u64>;
}

/// Summary of one resource's fetch loop.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub pages: usize,
    pub rows: u64,
    pub final_skip: i64,
    pub hit_iteration_cap: bool,
}

pub struct PaginatedFetcher<'a, T, S> {
    transport: &'a T,
    tokens: &'a TokenManager<S>,
    retry: RetryPolicy,
    max_iterations: usize,
}

impl<'a, T: ApiTransport, S: TokenSource> PaginatedFetcher<'a, T, S> {
    pub fn new(transport: &'a T, tokens: &'a TokenManager<S>) -> Self {
        Self {
            transport,
            tokens,
            retry: RetryPolicy::default(),
            max_iterations: MAX_ITERATIONS,
        }
    }

    pub fn with_limits(
        transport: &'a T,
        tokens: &'a TokenManager<S>,
        retry: RetryPolicy,
        max_iterations: usize,
    ) -> Self {
        Self {
            transport,
            tokens,
            retry,
            max_iterations,
        }
    }

    /// Fetch every page of `resource`, feeding each one to `sink`.
    pub async fn fetch(
        &self,
        resource: &ResourceSpec,
        access: &AccessInfo,
        deadline: &Deadline,
        sink: &mut dyn PageSink,
    ) -> SyncResult<FetchOutcome> {
        let mut outcome = FetchOutcome::default();
        let mut skip = 0i64;

        loop {
            if outcome.pages >= self.max_iterations {
                warn!(
                    "Max iterations reached for {}. Possible pagination issue.",
                    resource.endpoint
                );
                outcome.hit_iteration_cap = true;
                break;
            }
            if deadline.expired() {
                return Err(SyncError::DeadlineExceeded);
            }

            // Re-resolve per page: the order-date placeholder can cross its
            // cutoff while a long run is in flight.
            let filter =
                criteria::resolve(&resource.filter, access.day_offset, Local::now().naive_local());
            let url = build_url(&access.root_url, &resource.endpoint, resource.batch_size, skip, &filter);

            let reply = self.request_page(&url, access, deadline).await?;
            if !(200..300).contains(&reply.status) {
                return Err(SyncError::Fetch {
                    resource: resource.endpoint.clone(),
                    status: reply.status,
                });
            }

            let records = payload::extract_records(&reply.body).map_err(|e| {
                error!(
                    "Quarantined unrepairable page from {} (skip {}): {}; excerpt: {}",
                    resource.endpoint,
                    skip,
                    e,
                    excerpt(&reply.body)
                );
                SyncError::Payload {
                    resource: resource.endpoint.clone(),
                    detail: e.to_string(),
                }
            })?;

            if records.is_empty() {
                break;
            }

            let page = Page {
                records,
                skip,
                number: outcome.pages,
            };
            outcome.rows += sink.handle(&page).await?;
            outcome.pages += 1;
            skip += resource.batch_size;
        }

        outcome.final_skip = skip;
        info!(
            "Fetched {} pages ({} rows) from {}",
            outcome.pages, outcome.rows, resource.endpoint
        );
        Ok(outcome)
    }

    /// One page GET with retry/backoff, plus a single same-request replay
    /// after a forced token refresh on 401.
    async fn request_page(
        &self,
        url: &str,
        access: &AccessInfo,
        deadline: &Deadline,
    ) -> SyncResult<HttpReply> {
        let token = self.tokens.ensure_valid(access, deadline).await?;

        let reply = self
            .retry
            .execute("page request", || async {
                self.transport.get(url, &token.access_token, deadline).await
            })
            .await?;

        if reply.status != 401 {
            return Ok(reply);
        }

        warn!("Token expired during API call, refreshing...");
        let refreshed = self
            .tokens
            .refresh_stale(&token.access_token, access, deadline)
            .await?;

        self.retry
            .execute("page request (refreshed token)", || async {
                self.transport
                    .get(url, &refreshed.access_token, deadline)
                    .await
            })
            .await
    }
}

fn build_url(root_url: &str, endpoint: &str, top: i64, skip: i64, filter: &str) -> String {
    let base = if endpoint.starts_with("http") {
        endpoint.to_string()
    } else {
        format!(
            "{}/{}",
            root_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    };
    format!("{base}?$top={top}&$skip={skip}{filter}")
}

fn excerpt(body: &str) -> String {
    const LIMIT: usize = 200;
    if body.len() <= LIMIT {
        body.to_string()
    } else {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i < LIMIT)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &body[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::BearerToken;
    use crate::api::resilience::{RetryConfig, RetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    fn demo_access() -> AccessInfo {
        AccessInfo {
            url: "https://login.example/token".into(),
            grant_type: "client_credentials".into(),
            client_id: "cid".into(),
            client_secret: "secret".into(),
            scope: "scope".into(),
            root_url: "https://api.example/v2".into(),
            database_name: "DEMO_DB".into(),
            day_offset: 0,
            ftp_host: String::new(),
            ftp_user: String::new(),
            ftp_pass: String::new(),
            ftp_remote_path: String::new(),
            ftp_local_path: String::new(),
            smtp_host: String::new(),
            smtp_user: String::new(),
            smtp_pass: String::new(),
            email_sender: String::new(),
            email_recipients: String::new(),
        }
    }

    fn spec(batch_size: i64) -> ResourceSpec {
        ResourceSpec {
            table_name: "HFSITEM".into(),
            endpoint: "items".into(),
            filter: "N".into(),
            batch_size,
        }
    }

    struct StaticTokens;

    #[async_trait]
    impl TokenSource for StaticTokens {
        async fn fetch(&self, _: &AccessInfo, _: &Deadline) -> SyncResult<BearerToken> {
            Ok(BearerToken {
                access_token: "tok".into(),
                expires_at: SystemTime::now() + Duration::from_secs(3600),
            })
        }
    }

    /// Transport scripted with one reply per request, in order.
    struct ScriptedTransport {
        replies: Mutex<Vec<HttpReply>>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<HttpReply>) -> Self {
            Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn page(bodies: &[&str]) -> Vec<HttpReply> {
            bodies
                .iter()
                .map(|b| HttpReply {
                    status: 200,
                    body: b.to_string(),
                })
                .collect()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ApiTransport for ScriptedTransport {
        async fn get(&self, url: &str, _: &str, _: &Deadline) -> SyncResult<HttpReply> {
            self.requests.lock().unwrap().push(url.to_string());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                panic!("unexpected extra request: {url}");
            }
            Ok(replies.remove(0))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        pages: Vec<(usize, i64, usize)>,
    }

    #[async_trait]
    impl PageSink for RecordingSink {
        async fn handle(&mut self, page: &Page) -> SyncResult<u64> {
            self.pages.push((page.number, page.skip, page.records.len()));
            Ok(page.records.len() as u64)
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        })
    }

    #[tokio::test]
    async fn pagination_terminates_on_empty_page() {
        let transport = ScriptedTransport::new(ScriptedTransport::page(&[
            r#"[{"No":"1"},{"No":"2"}]"#,
            r#"[{"No":"3"},{"No":"4"}]"#,
            r#"[{"No":"5"}]"#,
            "[]",
        ]));
        let tokens = TokenManager::new(StaticTokens);
        let fetcher = PaginatedFetcher::with_limits(&transport, &tokens, fast_retry(), 100);
        let deadline = Deadline::after(Duration::from_secs(30));
        let mut sink = RecordingSink::default();

        let outcome = fetcher
            .fetch(&spec(2), &demo_access(), &deadline, &mut sink)
            .await
            .unwrap();

        assert_eq!(transport.request_count(), 4);
        assert_eq!(outcome.pages, 3);
        assert_eq!(outcome.rows, 5);
        assert_eq!(outcome.final_skip, 6);
        assert!(!outcome.hit_iteration_cap);
        assert_eq!(sink.pages, vec![(0, 0, 2), (1, 2, 2), (2, 4, 1)]);
    }

    #[tokio::test]
    async fn skip_advances_by_batch_size_in_request_urls() {
        let transport = ScriptedTransport::new(ScriptedTransport::page(&[
            r#"[{"No":"1"}]"#,
            "[]",
        ]));
        let tokens = TokenManager::new(StaticTokens);
        let fetcher = PaginatedFetcher::with_limits(&transport, &tokens, fast_retry(), 100);
        let deadline = Deadline::after(Duration::from_secs(30));
        let mut sink = RecordingSink::default();

        fetcher
            .fetch(&spec(50), &demo_access(), &deadline, &mut sink)
            .await
            .unwrap();

        let requests = transport.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![
                "https://api.example/v2/items?$top=50&$skip=0",
                "https://api.example/v2/items?$top=50&$skip=50"
            ]
        );
    }

    #[tokio::test]
    async fn unauthorized_reply_triggers_one_refresh_and_replay() {
        let transport = ScriptedTransport::new(vec![
            HttpReply {
                status: 401,
                body: String::new(),
            },
            HttpReply {
                status: 200,
                body: r#"[{"No":"1"}]"#.into(),
            },
            HttpReply {
                status: 200,
                body: "[]".into(),
            },
        ]);
        let tokens = TokenManager::new(StaticTokens);
        let fetcher = PaginatedFetcher::with_limits(&transport, &tokens, fast_retry(), 100);
        let deadline = Deadline::after(Duration::from_secs(30));
        let mut sink = RecordingSink::default();

        let outcome = fetcher
            .fetch(&spec(2), &demo_access(), &deadline, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome.rows, 1);
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn client_error_is_fatal_for_the_resource() {
        let transport = ScriptedTransport::new(vec![HttpReply {
            status: 404,
            body: String::new(),
        }]);
        let tokens = TokenManager::new(StaticTokens);
        let fetcher = PaginatedFetcher::with_limits(&transport, &tokens, fast_retry(), 100);
        let deadline = Deadline::after(Duration::from_secs(30));
        let mut sink = RecordingSink::default();

        let err = fetcher
            .fetch(&spec(2), &demo_access(), &deadline, &mut sink)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Fetch { status: 404, .. }));
        assert!(sink.pages.is_empty());
    }

    #[tokio::test]
    async fn server_errors_are_retried_before_succeeding() {
        let attempts = Arc::new(AtomicU32::new(0));

        struct Flaky {
            attempts: Arc<AtomicU32>,
        }

        #[async_trait]
        impl ApiTransport for Flaky {
            async fn get(&self, _: &str, _: &str, _: &Deadline) -> SyncResult<HttpReply> {
                let n = self.attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Ok(HttpReply {
                        status: 503,
                        body: String::new(),
                    })
                } else if n == 1 {
                    Ok(HttpReply {
                        status: 200,
                        body: r#"[{"No":"1"}]"#.into(),
                    })
                } else {
                    Ok(HttpReply {
                        status: 200,
                        body: "[]".into(),
                    })
                }
            }
        }

        let transport = Flaky {
            attempts: attempts.clone(),
        };
        let tokens = TokenManager::new(StaticTokens);
        let fetcher = PaginatedFetcher::with_limits(&transport, &tokens, fast_retry(), 100);
        let deadline = Deadline::after(Duration::from_secs(30));
        let mut sink = RecordingSink::default();

        let outcome = fetcher
            .fetch(&spec(2), &demo_access(), &deadline, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome.rows, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn iteration_cap_stops_runaway_pagination() {
        struct Endless;

        #[async_trait]
        impl ApiTransport for Endless {
            async fn get(&self, _: &str, _: &str, _: &Deadline) -> SyncResult<HttpReply> {
                Ok(HttpReply {
                    status: 200,
                    body: r#"[{"No":"1"}]"#.into(),
                })
            }
        }

        let tokens = TokenManager::new(StaticTokens);
        let fetcher = PaginatedFetcher::with_limits(&Endless, &tokens, fast_retry(), 5);
        let deadline = Deadline::after(Duration::from_secs(30));
        let mut sink = RecordingSink::default();

        let outcome = fetcher
            .fetch(&spec(1), &demo_access(), &deadline, &mut sink)
            .await
            .unwrap();

        assert!(outcome.hit_iteration_cap);
        assert_eq!(outcome.pages, 5);
    }

    #[tokio::test]
    async fn unrepairable_page_is_quarantined() {
        let transport = ScriptedTransport::new(ScriptedTransport::page(&["total garbage"]));
        let tokens = TokenManager::new(StaticTokens);
        let fetcher = PaginatedFetcher::with_limits(&transport, &tokens, fast_retry(), 100);
        let deadline = Deadline::after(Duration::from_secs(30));
        let mut sink = RecordingSink::default();

        let err = fetcher
            .fetch(&spec(2), &demo_access(), &deadline, &mut sink)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Payload { .. }));
        assert!(sink.pages.is_empty());
    }

    #[test]
    fn absolute_endpoints_bypass_the_root_url() {
        let url = build_url(
            "https://api.example/v2",
            "https://other.example/feed",
            10,
            0,
            "",
        );
        assert_eq!(url, "https://other.example/feed?$top=10&$skip=0");
    }
}
