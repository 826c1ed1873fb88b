//! Run controller
//!
//! Thin sequencing layer: access info -> resource sync -> file handshake ->
//! notification. All policy lives in the components; the controller only
//! wires them together and reports.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Local;
use log::{info, warn};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::api::auth::{OAuthTokenSource, TokenManager};
use crate::api::resilience::RetryPolicy;
use crate::api::transport::HttpTransport;
use crate::catalog::{AccessInfo, CatalogStore};
use crate::cli::Cli;
use crate::config::AppConfig;
use crate::deadline::Deadline;
use crate::error::{SyncError, SyncResult};
use crate::notify::{self, Notifier, SmtpNotifier};
use crate::sync::{RunReport, SyncOrchestrator};
use crate::transfer::{HandshakeReport, HandshakeUploader, SftpStore};

pub struct RunSummary {
    pub run_id: String,
    pub customer: String,
    pub report: RunReport,
    pub handshake: Option<HandshakeReport>,
    pub duration: Duration,
}

pub struct RunController {
    config: AppConfig,
}

impl RunController {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, cli: &Cli) -> SyncResult<RunSummary> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        info!("Starting run {} for customer {}", run_id, cli.customer);

        let catalog = CatalogStore::connect(&self.config.catalog_db_url, &self.config.prod).await?;
        let access = catalog.access_info(&cli.customer).await?;

        // Notifications are best-effort from here on; a broken relay must
        // not stop the sync itself.
        let notifier = match SmtpNotifier::new(&access) {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("Notifier unavailable: {}", e);
                None
            }
        };

        let resources = catalog
            .resource_specs(&cli.run_group, &self.config.single_table_prefix)
            .await?;
        if resources.is_empty() {
            warn!("No resources found for customer {}", cli.customer);
            return Ok(RunSummary {
                run_id,
                customer: cli.customer.clone(),
                report: RunReport::default(),
                handshake: None,
                duration: started.elapsed(),
            });
        }

        let deadline = Deadline::after(Duration::from_secs(self.config.run_deadline_secs));
        let http = HttpTransport::build_client();
        let tokens = TokenManager::new(OAuthTokenSource::new(http.clone(), RetryPolicy::default()));
        let transport = HttpTransport::new(http);

        let tenant_url = self.config.tenant_db_url_for(&access.database_name);
        let tenant_pool = SqlitePool::connect(&tenant_url)
            .await
            .map_err(|e| SyncError::config(format!("cannot open tenant database: {e}")))?;

        let mut orchestrator = SyncOrchestrator::new(&transport, &tokens);
        if let Some(n) = &notifier {
            orchestrator = orchestrator.notify_failures(n as &dyn Notifier, access.recipient_list());
        }
        let report = match orchestrator
            .run(&resources, &access, &tenant_pool, &deadline)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                self.notify_failure(&notifier, &access, cli, &run_id, &err).await;
                return Err(err);
            }
        };

        let handshake = if cli.send_requested() {
            match self.run_handshake(&access).await {
                Ok(report) => Some(report),
                Err(err) => {
                    self.notify_failure(&notifier, &access, cli, &run_id, &err).await;
                    return Err(err);
                }
            }
        } else {
            None
        };

        let subject = if report.has_failures() {
            format!(
                "Outbound sync for {} completed with {} failure(s)",
                cli.customer,
                report.failure_count()
            )
        } else {
            format!("Outbound sync for {} completed", cli.customer)
        };
        if let Some(notifier) = &notifier {
            let mut body = notify::render_report(&cli.customer, &run_id, &report);
            if let Some(h) = &handshake {
                body.push_str(&format!(
                    "<p>Handoff: {} file(s) uploaded, {} skipped.</p>\n",
                    h.uploaded.len(),
                    h.skipped.len()
                ));
            }
            body.push_str(&format!("<p>Duration: {:.1}s</p>\n", started.elapsed().as_secs_f64()));
            notify::send_best_effort(notifier, &subject, &body, &access.recipient_list()).await;
        }

        info!(
            "Run {} finished: {} rows across {} resource(s)",
            run_id,
            report.total_rows(),
            report.outcomes.len()
        );
        Ok(RunSummary {
            run_id,
            customer: cli.customer.clone(),
            report,
            handshake,
            duration: started.elapsed(),
        })
    }

    /// The SFTP stack is blocking, so the whole handshake runs on a
    /// blocking task.
    async fn run_handshake(&self, access: &AccessInfo) -> SyncResult<HandshakeReport> {
        let local_drop = Path::new(&access.ftp_local_path)
            .join("Outbound")
            .join(Local::now().format("%Y%m%d").to_string());
        let host = access.ftp_host.clone();
        let user = access.ftp_user.clone();
        let pass = access.ftp_pass.clone();
        let remote_path = access.ftp_remote_path.clone();

        tokio::task::spawn_blocking(move || {
            let store = SftpStore::connect(&host, &user, &pass)?;
            let mut uploader = HandshakeUploader::new(store);
            uploader.run(&local_drop, &remote_path)
        })
        .await
        .map_err(|e| SyncError::config(format!("handshake task failed: {e}")))?
    }

    async fn notify_failure(
        &self,
        notifier: &Option<SmtpNotifier>,
        access: &AccessInfo,
        cli: &Cli,
        run_id: &str,
        err: &SyncError,
    ) {
        if let Some(notifier) = notifier {
            let subject = format!(
                "Outbound sync FAILED for {} ({} stage)",
                cli.customer,
                err.stage()
            );
            let body = notify::render_failure(&cli.customer, run_id, err.stage(), &err.to_string());
            notify::send_best_effort(notifier, &subject, &body, &access.recipient_list()).await;
        }
    }
}
