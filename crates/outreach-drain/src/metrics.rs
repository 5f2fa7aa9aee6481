//! Drain metrics.
//!
//! Recorded through the `metrics` facade; without an installed recorder every
//! call is a no-op.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `outreach_drain_classifications_total` | Counter | `reason` |
//! | `outreach_drain_deletions_total` | Counter | `outcome` |
//! | `outreach_drain_api_retries_total` | Counter | `operation` |
//! | `outreach_drain_pages_total` | Counter | `campaign` |
//! | `outreach_drain_breaker_trips_total` | Counter | `reason` |
//! | `outreach_drain_sync_failures_total` | Counter | `operation` |
//! | `outreach_drain_rate_limit_delay_seconds` | Gauge | - |
//! | `outreach_drain_run_duration_seconds` | Histogram | `path` |

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    /// Counter: classifier verdicts.
    pub const CLASSIFICATIONS_TOTAL: &str = "outreach_drain_classifications_total";
    /// Counter: final delete outcomes.
    pub const DELETIONS_TOTAL: &str = "outreach_drain_deletions_total";
    /// Counter: retried platform calls.
    pub const API_RETRIES_TOTAL: &str = "outreach_drain_api_retries_total";
    /// Counter: list pages fetched.
    pub const PAGES_TOTAL: &str = "outreach_drain_pages_total";
    /// Counter: circuit breaker trips.
    pub const BREAKER_TRIPS_TOTAL: &str = "outreach_drain_breaker_trips_total";
    /// Counter: failed state-store writes.
    pub const SYNC_FAILURES_TOTAL: &str = "outreach_drain_sync_failures_total";
    /// Gauge: current adaptive delay.
    pub const RATE_LIMIT_DELAY_SECONDS: &str = "outreach_drain_rate_limit_delay_seconds";
    /// Histogram: run duration.
    pub const RUN_DURATION_SECONDS: &str = "outreach_drain_run_duration_seconds";
}

/// Label keys.
pub mod labels {
    /// Classifier reason code.
    pub const REASON: &str = "reason";
    /// Delete outcome.
    pub const OUTCOME: &str = "outcome";
    /// Platform or store operation.
    pub const OPERATION: &str = "operation";
    /// Campaign id.
    pub const CAMPAIGN: &str = "campaign";
    /// Targeting path.
    pub const PATH: &str = "path";
}

/// Records drain metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainMetrics;

impl DrainMetrics {
    /// Creates a recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Counts one classifier verdict.
    pub fn record_classification(&self, reason: &str) {
        counter!(names::CLASSIFICATIONS_TOTAL, labels::REASON => reason.to_string()).increment(1);
    }

    /// Counts one final delete outcome.
    pub fn record_deletion(&self, outcome: &str) {
        counter!(names::DELETIONS_TOTAL, labels::OUTCOME => outcome.to_string()).increment(1);
    }

    /// Counts one retried call.
    pub fn record_retry(&self, operation: &str) {
        counter!(names::API_RETRIES_TOTAL, labels::OPERATION => operation.to_string())
            .increment(1);
    }

    /// Counts one fetched list page.
    pub fn record_page(&self, campaign_id: &str) {
        counter!(names::PAGES_TOTAL, labels::CAMPAIGN => campaign_id.to_string()).increment(1);
    }

    /// Counts a circuit breaker trip.
    pub fn record_breaker_trip(&self, reason: &str) {
        counter!(names::BREAKER_TRIPS_TOTAL, labels::REASON => reason.to_string()).increment(1);
    }

    /// Counts a failed state-store write.
    pub fn record_sync_failure(&self, operation: &str) {
        counter!(names::SYNC_FAILURES_TOTAL, labels::OPERATION => operation.to_string())
            .increment(1);
    }

    /// Publishes the current adaptive delay.
    pub fn set_rate_limit_delay(&self, delay: Duration) {
        gauge!(names::RATE_LIMIT_DELAY_SECONDS).set(delay.as_secs_f64());
    }

    /// Records how long a run took.
    pub fn observe_run_duration(&self, path: &str, duration: Duration) {
        histogram!(names::RUN_DURATION_SECONDS, labels::PATH => path.to_string())
            .record(duration.as_secs_f64());
    }
}
