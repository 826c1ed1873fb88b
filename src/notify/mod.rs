//! Operator notification
//!
//! One email at run end, success or failure, plus a message on fatal
//! sub-failures. Sends are best-effort: a notification failure is logged
//! and never escalated, to avoid failure loops.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{error, info};

use crate::catalog::AccessInfo;
use crate::error::{SyncError, SyncResult};
use crate::sync::RunReport;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, html_body: &str, recipients: &[String]) -> SyncResult<()>;
}

/// SMTP relay notifier configured from the tenant's access info.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: String,
}

impl SmtpNotifier {
    pub fn new(access: &AccessInfo) -> SyncResult<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&access.smtp_host)
            .map_err(|e| SyncError::Notify {
                message: format!("invalid smtp relay {}: {e}", access.smtp_host),
            })?
            .credentials(Credentials::new(
                access.smtp_user.clone(),
                access.smtp_pass.clone(),
            ))
            .build();

        Ok(Self {
            transport,
            sender: access.email_sender.clone(),
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, subject: &str, html_body: &str, recipients: &[String]) -> SyncResult<()> {
        let mut builder = Message::builder()
            .from(self.sender.parse().map_err(|e| SyncError::Notify {
                message: format!("invalid sender {}: {e}", self.sender),
            })?)
            .subject(subject)
            .header(ContentType::TEXT_HTML);

        for recipient in recipients {
            builder = builder.to(recipient.parse().map_err(|e| SyncError::Notify {
                message: format!("invalid recipient {recipient}: {e}"),
            })?);
        }

        let message = builder
            .body(html_body.to_string())
            .map_err(|e| SyncError::Notify {
                message: format!("cannot build message: {e}"),
            })?;

        self.transport
            .send(message)
            .await
            .map_err(|e| SyncError::Notify {
                message: e.to_string(),
            })?;

        info!("Email sent successfully");
        Ok(())
    }
}

/// Send without letting a notification failure affect the run outcome.
pub async fn send_best_effort(
    notifier: &dyn Notifier,
    subject: &str,
    html_body: &str,
    recipients: &[String],
) {
    if recipients.is_empty() {
        return;
    }
    if let Err(e) = notifier.send(subject, html_body, recipients).await {
        error!("Error sending email: {}", e);
    }
}

/// HTML summary of a completed (possibly partially failed) run.
pub fn render_report(customer: &str, run_id: &str, report: &RunReport) -> String {
    let mut body = format!(
        "<h3>Outbound sync for {} (run {})</h3>\n<table border=\"1\">\n\
         <tr><th>Table</th><th>Rows</th><th>Pages</th><th>Status</th></tr>\n",
        customer, run_id
    );
    for outcome in &report.outcomes {
        let status = match &outcome.error {
            None => "OK".to_string(),
            Some(e) => format!("FAILED ({e})"),
        };
        body.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            outcome.table, outcome.rows, outcome.pages, status
        ));
    }
    body.push_str(&format!(
        "</table>\n<p>{} rows total, {} resource(s) failed.</p>\n",
        report.total_rows(),
        report.failure_count()
    ));
    body
}

/// HTML body for a run that died before producing a report.
pub fn render_failure(customer: &str, run_id: &str, stage: &str, detail: &str) -> String {
    format!(
        "<h3>Outbound sync FAILED for {} (run {})</h3>\n\
         <p>Stage: {}</p>\n<p>{}</p>\n",
        customer, run_id, stage, detail
    )
}
