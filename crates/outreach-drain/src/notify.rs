//! Run report delivery.
//!
//! Notification is best-effort. A failed delivery is logged and never fails the run.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::report::DrainReport;

/// Delivers the end-of-run report.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends the report.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    async fn notify(&self, report: &DrainReport) -> Result<()>;
}

/// Sends the report and logs any failure.
pub async fn notify_best_effort(notifier: &dyn Notifier, report: &DrainReport) {
    if let Err(err) = notifier.notify(report).await {
        warn!(run_id = %report.run_id, error = %err, "failed to deliver drain report");
    }
}

/// Writes a one-line summary to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, report: &DrainReport) -> Result<()> {
        info!(
            run_id = %report.run_id,
            targeting = %report.targeting,
            analyzed = report.analyzed,
            to_drain = report.to_drain,
            deleted = report.deletion.succeeded,
            failed = report.deletion.failed,
            not_processed = report.deletion.not_processed,
            missing = report.missing,
            sync_failures = report.sync_failures,
            partial = report.is_partial(),
            duration_ms = report.duration_ms,
            "drain run finished"
        );
        Ok(())
    }
}

/// POSTs the report as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebhookNotifier {
    /// Creates a notifier for `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| Error::configuration(format!("invalid webhook url: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build webhook client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, report: &DrainReport) -> Result<()> {
        let response = self.client.post(self.url.clone()).json(report).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::api_status(
                status.as_u16(),
                format!("webhook rejected report: {}", body.chars().take(500).collect::<String>()),
            ));
        }
        Ok(())
    }
}
