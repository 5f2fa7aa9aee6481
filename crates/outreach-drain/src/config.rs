//! Configuration for a drain run.
//!
//! Every knob has a production default; tests shrink the delays to zero with
//! the `with_*` builders.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A campaign whose enrolled leads are evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignTarget {
    /// Platform campaign identifier.
    pub id: String,
    /// Human-readable name used in logs and history rows.
    pub name: String,
}

impl CampaignTarget {
    /// Creates a campaign target.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Where the unsubscribe signal is read from.
///
/// The free-text match is what the platform supports today; the structured
/// counter is read when the platform sends it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsubscribeSignal {
    /// Case-insensitive `"unsubscribed"` substring in `status_text`.
    #[default]
    StatusText,
    /// `status_summary.unsubscribed`.
    StatusSummary,
    /// Either of the above.
    Any,
}

/// Thresholds used by the lead classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Active leads older than this are drained as stale.
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: i64,
    /// Hard bounces younger than this are kept while the platform retries.
    #[serde(default = "default_bounce_grace_days")]
    pub bounce_grace_days: i64,
    /// Unsubscribe detection source.
    #[serde(default)]
    pub unsubscribe_signal: UnsubscribeSignal,
}

const fn default_stale_after_days() -> i64 {
    90
}

const fn default_bounce_grace_days() -> i64 {
    7
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            stale_after_days: default_stale_after_days(),
            bounce_grace_days: default_bounce_grace_days(),
            unsubscribe_signal: UnsubscribeSignal::default(),
        }
    }
}

/// Adaptive pacing for campaign API calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Delay before the first call.
    pub initial_delay: Duration,
    /// Smallest delay sustained success can reach.
    pub min_delay: Duration,
    /// Largest delay 429 responses can push to.
    pub max_rate_limited_delay: Duration,
    /// Largest delay generic failures can push to.
    pub max_failure_delay: Duration,
    /// Consecutive successes before the delay shrinks.
    pub success_streak: u32,
    /// Consecutive generic failures before the delay grows.
    pub failure_streak: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            min_delay: Duration::from_millis(100),
            max_rate_limited_delay: Duration::from_secs(30),
            max_failure_delay: Duration::from_secs(10),
            success_streak: 5,
            failure_streak: 2,
        }
    }
}

impl RateLimitConfig {
    /// A configuration that never sleeps, for tests.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            min_delay: Duration::ZERO,
            max_rate_limited_delay: Duration::ZERO,
            max_failure_delay: Duration::ZERO,
            success_streak: 5,
            failure_streak: 2,
        }
    }
}

/// Deletion pacing, retry, and circuit-breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionConfig {
    /// Leads per deletion batch.
    pub batch_size: usize,
    /// Pause between deletes inside a batch.
    pub item_delay: Duration,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Retries after the first attempt, only for 429/5xx/timeouts.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles for each later one.
    pub retry_backoff: Duration,
    /// Number of recent outcomes the circuit breaker looks at.
    pub breaker_window: usize,
    /// Failure share of a full window above which the breaker trips.
    pub breaker_failure_ratio: f64,
    /// Consecutive rate-limited outcomes that trip the breaker.
    pub breaker_consecutive_rate_limits: u32,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            item_delay: Duration::from_secs(3),
            batch_delay: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            breaker_window: 10,
            breaker_failure_ratio: 0.8,
            breaker_consecutive_rate_limits: 3,
        }
    }
}

impl DeletionConfig {
    /// Returns the backoff before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor)
    }
}

/// Connection settings for the campaign platform.
#[derive(Clone, Serialize, Deserialize)]
pub struct CampaignApiConfig {
    /// Base URL, without the `/api/v2` suffix.
    pub base_url: String,
    /// Bearer token.
    pub api_key: String,
    /// Timeout for list and get calls.
    pub read_timeout: Duration,
    /// Timeout for delete calls.
    pub delete_timeout: Duration,
}

impl CampaignApiConfig {
    /// Default platform endpoint.
    pub const DEFAULT_BASE_URL: &'static str = "https://api.instantly.ai";

    /// Creates a configuration for the default endpoint.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            read_timeout: Duration::from_secs(30),
            delete_timeout: Duration::from_secs(10),
        }
    }

    /// Overrides the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl std::fmt::Debug for CampaignApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("read_timeout", &self.read_timeout)
            .field("delete_timeout", &self.delete_timeout)
            .finish()
    }
}

/// Location of the tracking tables in BigQuery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigQueryConfig {
    /// GCP project id.
    pub project_id: String,
    /// Dataset holding the tables.
    pub dataset_id: String,
    /// Per-lead tracking rows.
    #[serde(default = "default_state_table")]
    pub state_table: String,
    /// Append-only history used for re-contact cooldowns.
    #[serde(default = "default_history_table")]
    pub history_table: String,
    /// Permanent do-not-contact list.
    #[serde(default = "default_dnc_table")]
    pub do_not_contact_table: String,
    /// Dead-letter records.
    #[serde(default = "default_dead_letter_table")]
    pub dead_letter_table: String,
    /// REST endpoint root; overridden in tests.
    #[serde(default = "default_bigquery_endpoint")]
    pub endpoint: String,
    /// Timeout for each REST call.
    #[serde(default = "default_bigquery_timeout")]
    pub timeout: Duration,
}

fn default_state_table() -> String {
    "ops_inst_state".to_string()
}

fn default_history_table() -> String {
    "ops_lead_history".to_string()
}

fn default_dnc_table() -> String {
    "dnc_list".to_string()
}

fn default_dead_letter_table() -> String {
    "ops_dead_letters".to_string()
}

fn default_bigquery_endpoint() -> String {
    "https://bigquery.googleapis.com".to_string()
}

const fn default_bigquery_timeout() -> Duration {
    Duration::from_secs(60)
}

impl BigQueryConfig {
    /// Creates a configuration with the standard table names.
    #[must_use]
    pub fn new(project_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            state_table: default_state_table(),
            history_table: default_history_table(),
            do_not_contact_table: default_dnc_table(),
            dead_letter_table: default_dead_letter_table(),
            endpoint: default_bigquery_endpoint(),
            timeout: default_bigquery_timeout(),
        }
    }

    /// Overrides the REST endpoint root.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Fully-qualified, backtick-quoted table reference.
    #[must_use]
    pub fn table(&self, name: &str) -> String {
        format!("`{}.{}.{}`", self.project_id, self.dataset_id, name)
    }
}

/// Top-level drain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Campaigns to evaluate, processed in order.
    pub campaigns: Vec<CampaignTarget>,
    /// Cap on state-store candidates per run.
    pub drain_batch_size: usize,
    /// Leads requested per list page.
    pub page_size: usize,
    /// Safety cap on pages walked per campaign.
    pub max_pages_per_campaign: usize,
    /// Optional cap on leads evaluated across the whole run.
    #[serde(default)]
    pub max_leads_to_evaluate: Option<usize>,
    /// Hours before an evaluated lead is due again.
    pub recheck_after_hours: i64,
    /// Hours after which a page of already-checked leads ends a full scan.
    ///
    /// Deliberately wider than `recheck_after_hours`; the two are tuned as a pair.
    pub pagination_stop_after_hours: i64,
    /// Consecutive all-duplicate pages that abort a walk.
    pub duplicate_page_limit: usize,
    /// Attempts per list page before the campaign is abandoned for this run.
    pub page_fetch_attempts: u32,
    /// Backoff step between page fetch attempts.
    pub page_retry_backoff: Duration,
    /// Evaluate and report without writing anywhere.
    #[serde(default)]
    pub dry_run: bool,
    /// Bypass the re-check window and scan every campaign fully.
    #[serde(default)]
    pub force_recheck: bool,
    /// Classifier thresholds.
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// API pacing.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Deletion settings.
    #[serde(default)]
    pub deletion: DeletionConfig,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            campaigns: Vec::new(),
            drain_batch_size: 50,
            page_size: 100,
            max_pages_per_campaign: 2000,
            max_leads_to_evaluate: None,
            recheck_after_hours: 24,
            pagination_stop_after_hours: 26,
            duplicate_page_limit: 3,
            page_fetch_attempts: 3,
            page_retry_backoff: Duration::from_millis(500),
            dry_run: false,
            force_recheck: false,
            classifier: ClassifierConfig::default(),
            rate_limit: RateLimitConfig::default(),
            deletion: DeletionConfig::default(),
        }
    }
}

impl DrainConfig {
    /// Creates a configuration for the given campaigns with default settings.
    #[must_use]
    pub fn new(campaigns: Vec<CampaignTarget>) -> Self {
        Self {
            campaigns,
            ..Self::default()
        }
    }

    /// Sets the state-store candidate cap.
    #[must_use]
    pub const fn with_drain_batch_size(mut self, size: usize) -> Self {
        self.drain_batch_size = size;
        self
    }

    /// Sets the list page size.
    #[must_use]
    pub const fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the per-campaign page cap.
    #[must_use]
    pub const fn with_max_pages(mut self, pages: usize) -> Self {
        self.max_pages_per_campaign = pages;
        self
    }

    /// Caps the number of leads evaluated across the run.
    #[must_use]
    pub const fn with_max_leads(mut self, leads: Option<usize>) -> Self {
        self.max_leads_to_evaluate = leads;
        self
    }

    /// Enables or disables dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Enables or disables the force-recheck override.
    #[must_use]
    pub const fn with_force_recheck(mut self, force: bool) -> Self {
        self.force_recheck = force;
        self
    }

    /// Replaces the deletion settings.
    #[must_use]
    pub fn with_deletion(mut self, deletion: DeletionConfig) -> Self {
        self.deletion = deletion;
        self
    }

    /// Replaces the rate-limit settings.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Removes every sleep from the run. Intended for tests.
    #[must_use]
    pub fn without_delays(mut self) -> Self {
        self.rate_limit = RateLimitConfig::immediate();
        self.page_retry_backoff = Duration::ZERO;
        self.deletion.item_delay = Duration::ZERO;
        self.deletion.batch_delay = Duration::ZERO;
        self.deletion.retry_backoff = Duration::ZERO;
        self
    }

    /// Re-check window as a signed duration.
    #[must_use]
    pub fn recheck_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.recheck_after_hours)
    }

    /// Full-scan early-exit window as a signed duration.
    #[must_use]
    pub fn pagination_stop_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.pagination_stop_after_hours)
    }

    /// Returns the campaign name for an id, or the id itself.
    #[must_use]
    pub fn campaign_name<'a>(&'a self, campaign_id: &'a str) -> &'a str {
        self.campaigns
            .iter()
            .find(|c| c.id == campaign_id)
            .map_or(campaign_id, |c| c.name.as_str())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no campaign is configured or a size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.campaigns.is_empty() {
            return Err(Error::configuration("at least one campaign is required"));
        }
        if self.campaigns.iter().any(|c| c.id.trim().is_empty()) {
            return Err(Error::configuration("campaign id cannot be empty"));
        }
        if self.page_size == 0 || self.drain_batch_size == 0 {
            return Err(Error::configuration(
                "page_size and drain_batch_size must be greater than zero",
            ));
        }
        if self.deletion.batch_size == 0 || self.deletion.breaker_window == 0 {
            return Err(Error::configuration(
                "deletion batch_size and breaker_window must be greater than zero",
            ));
        }
        if self.page_fetch_attempts == 0 {
            return Err(Error::configuration(
                "page_fetch_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_values() {
        let config = DrainConfig::default();
        assert_eq!(config.drain_batch_size, 50);
        assert_eq!(config.recheck_after(), chrono::Duration::hours(24));
        assert_eq!(config.pagination_stop_after(), chrono::Duration::hours(26));
        assert_eq!(config.classifier.stale_after_days, 90);
        assert_eq!(config.classifier.bounce_grace_days, 7);
        assert_eq!(config.deletion.batch_size, 5);
        assert_eq!(config.deletion.breaker_window, 10);
    }

    #[test]
    fn deletion_backoff_doubles() {
        let deletion = DeletionConfig::default();
        assert_eq!(deletion.backoff_for(1), Duration::from_millis(500));
        assert_eq!(deletion.backoff_for(2), Duration::from_secs(1));
    }

    #[test]
    fn validation_requires_campaigns() {
        assert!(DrainConfig::default().validate().is_err());
        let config = DrainConfig::new(vec![CampaignTarget::new("c1", "SMB")]);
        assert!(config.validate().is_ok());
        assert!(config.clone().with_page_size(0).validate().is_err());
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let config = CampaignApiConfig::new("secret-key");
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("api.instantly.ai"));
    }

    #[test]
    fn bigquery_table_reference() {
        let config = BigQueryConfig::new("proj", "ops");
        assert_eq!(config.table(&config.state_table), "`proj.ops.ops_inst_state`");
    }

    #[test]
    fn campaign_name_lookup() {
        let config = DrainConfig::new(vec![CampaignTarget::new("c1", "SMB")]);
        assert_eq!(config.campaign_name("c1"), "SMB");
        assert_eq!(config.campaign_name("c2"), "c2");
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: DrainConfig = serde_json::from_value(serde_json::json!({
            "campaigns": [{"id": "c1", "name": "SMB"}],
            "drain_batch_size": 10,
            "page_size": 100,
            "max_pages_per_campaign": 5,
            "recheck_after_hours": 24,
            "pagination_stop_after_hours": 26,
            "duplicate_page_limit": 3,
            "page_fetch_attempts": 3,
            "page_retry_backoff": {"secs": 0, "nanos": 0}
        }))
        .unwrap();
        assert_eq!(config.drain_batch_size, 10);
        assert!(!config.dry_run);
        assert_eq!(config.classifier.stale_after_days, 90);
    }
}
