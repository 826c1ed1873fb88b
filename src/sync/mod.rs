//! Run orchestration
//!
//! Processes the run's resources one at a time in catalogue order, wiring
//! the fetch loop into the ingestor. Resource-scoped failures are recorded
//! and the run moves on; auth failures and deadline expiry abort the run.

use log::{error, info, warn};
use sqlx::SqlitePool;

use crate::api::auth::{TokenManager, TokenSource};
use crate::api::fetcher::PaginatedFetcher;
use crate::api::resilience::RetryPolicy;
use crate::api::transport::ApiTransport;
use crate::api::MAX_ITERATIONS;
use crate::catalog::{AccessInfo, ResourceSpec};
use crate::deadline::Deadline;
use crate::error::{SyncError, SyncResult};
use crate::notify::{self, Notifier};
use crate::sql::{ColumnMapper, Ingestor};

/// What happened to one resource.
#[derive(Debug)]
pub struct ResourceOutcome {
    pub table: String,
    pub endpoint: String,
    pub rows: u64,
    pub pages: usize,
    pub final_skip: i64,
    pub error: Option<SyncError>,
}

/// Per-resource outcomes for the whole run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<ResourceOutcome>,
}

impl RunReport {
    pub fn total_rows(&self) -> u64 {
        self.outcomes.iter().map(|o| o.rows).sum()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.failure_count() > 0
    }
}

pub struct SyncOrchestrator<'a, T, S> {
    transport: &'a T,
    tokens: &'a TokenManager<S>,
    retry: RetryPolicy,
    max_iterations: usize,
    notifier: Option<&'a dyn Notifier>,
    recipients: Vec<String>,
}

impl<'a, T: ApiTransport, S: TokenSource> SyncOrchestrator<'a, T, S> {
    pub fn new(transport: &'a T, tokens: &'a TokenManager<S>) -> Self {
        Self {
            transport,
            tokens,
            retry: RetryPolicy::default(),
            max_iterations: MAX_ITERATIONS,
            notifier: None,
            recipients: Vec::new(),
        }
    }

    pub fn with_retry(transport: &'a T, tokens: &'a TokenManager<S>, retry: RetryPolicy) -> Self {
        Self {
            retry,
            ..Self::new(transport, tokens)
        }
    }

    /// Notify the operator as soon as a resource fails instead of only in
    /// the end-of-run summary.
    pub fn notify_failures(mut self, notifier: &'a dyn Notifier, recipients: Vec<String>) -> Self {
        self.notifier = Some(notifier);
        self.recipients = recipients;
        self
    }

    /// Process every resource in order against the tenant database.
    pub async fn run(
        &self,
        resources: &[ResourceSpec],
        access: &AccessInfo,
        tenant_pool: &SqlitePool,
        deadline: &Deadline,
    ) -> SyncResult<RunReport> {
        let mapper = ColumnMapper::new();
        let mut report = RunReport::default();

        for resource in resources {
            if deadline.expired() {
                return Err(SyncError::DeadlineExceeded);
            }

            // Proactive freshness check so a resource does not start with a
            // token that will die mid-pagination. Auth failures abort here.
            self.tokens.ensure_valid(access, deadline).await?;

            info!(
                "Processing resource {} -> {}",
                resource.endpoint, resource.table_name
            );

            match self
                .sync_resource(resource, access, tenant_pool, &mapper, deadline)
                .await
            {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(err) if err.is_run_fatal() => {
                    error!("Run-fatal error on {}: {}", resource.endpoint, err);
                    return Err(err);
                }
                Err(err) => {
                    error!("Resource {} failed: {}", resource.endpoint, err);
                    if let Some(notifier) = self.notifier {
                        let subject =
                            format!("Outbound sync: resource {} failed", resource.endpoint);
                        let body = format!(
                            "<h3>Resource {} ({}) failed</h3>\n<p>Stage: {}</p>\n<p>{}</p>\n",
                            resource.endpoint,
                            resource.table_name,
                            err.stage(),
                            err
                        );
                        notify::send_best_effort(notifier, &subject, &body, &self.recipients).await;
                    }
                    report.outcomes.push(ResourceOutcome {
                        table: resource.table_name.clone(),
                        endpoint: resource.endpoint.clone(),
                        rows: 0,
                        pages: 0,
                        final_skip: 0,
                        error: Some(err),
                    });
                }
            }
        }

        if report.has_failures() {
            warn!(
                "Run finished with {} failed resource(s) out of {}",
                report.failure_count(),
                resources.len()
            );
        }
        Ok(report)
    }

    async fn sync_resource(
        &self,
        resource: &ResourceSpec,
        access: &AccessInfo,
        tenant_pool: &SqlitePool,
        mapper: &ColumnMapper,
        deadline: &Deadline,
    ) -> SyncResult<ResourceOutcome> {
        let mapping = mapper.resolve(tenant_pool, &resource.table_name).await?;
        let mut ingestor = Ingestor::new(tenant_pool.clone(), &resource.table_name, mapping)?;

        let fetcher = PaginatedFetcher::with_limits(
            self.transport,
            self.tokens,
            self.retry.clone(),
            self.max_iterations,
        );
        let fetched = fetcher
            .fetch(resource, access, deadline, &mut ingestor)
            .await?;

        Ok(ResourceOutcome {
            table: resource.table_name.clone(),
            endpoint: resource.endpoint.clone(),
            rows: fetched.rows,
            pages: fetched.pages,
            final_skip: fetched.final_skip,
            error: None,
        })
    }
}
