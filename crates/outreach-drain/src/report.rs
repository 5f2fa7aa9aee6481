//! End-of-run report handed to the notifier.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use outreach_core::id::DrainRunId;
use serde::{Deserialize, Serialize};

use crate::campaign::DeletionOutcome;
use crate::verdict::ReasonCode;

/// How candidates were chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetingPath {
    /// Due rows from the state store, located on the platform.
    StateStore,
    /// Every campaign paginated in full.
    FullScan,
}

impl TargetingPath {
    /// Stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StateStore => "state_store",
            Self::FullScan => "full_scan",
        }
    }
}

impl fmt::Display for TargetingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker position at the end of the deletion phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Deletions ran to completion.
    #[default]
    Closed,
    /// Deletions were halted.
    Open,
}

/// Why the circuit breaker opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TripReason {
    /// Too many failures in the sliding window.
    FailureRatio {
        /// Failures in the window.
        failures: usize,
        /// Window size.
        window: usize,
    },
    /// Too many rate-limited leads in a row.
    ConsecutiveRateLimits {
        /// Length of the streak.
        count: u32,
    },
}

impl TripReason {
    /// Short label for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FailureRatio { .. } => "failure_ratio",
            Self::ConsecutiveRateLimits { .. } => "consecutive_rate_limits",
        }
    }
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailureRatio { failures, window } => {
                write!(f, "{failures}/{window} recent deletions failed")
            }
            Self::ConsecutiveRateLimits { count } => {
                write!(f, "{count} consecutive rate-limited deletions")
            }
        }
    }
}

/// A lead whose deletion failed terminally or exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionFailure {
    /// Platform lead id.
    pub lead_id: String,
    /// Contact address.
    pub email: String,
    /// Last outcome seen.
    pub outcome: DeletionOutcome,
    /// Attempts made.
    pub attempts: u32,
}

/// Result of the deletion phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionSummary {
    /// Leads handed to the executor.
    pub requested: usize,
    /// Leads at least one delete was attempted for.
    pub attempted: usize,
    /// Leads confirmed gone (including 404s).
    pub succeeded: usize,
    /// Of `succeeded`, leads that were already gone.
    pub already_gone: usize,
    /// Leads whose deletion failed.
    pub failed: usize,
    /// Leads never attempted because the breaker opened.
    pub not_processed: usize,
    /// Breaker position at the end.
    pub breaker_state: BreakerState,
    /// Why the breaker opened, if it did.
    pub trip_reason: Option<TripReason>,
    /// Per-lead failures.
    pub failures: Vec<DeletionFailure>,
}

/// Per-campaign evaluation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    /// Campaign id.
    pub campaign_id: String,
    /// Campaign name.
    pub name: String,
    /// List pages fetched.
    pub pages: usize,
    /// Leads classified.
    pub evaluated: usize,
    /// Leads skipped by the re-check window.
    pub skipped: usize,
    /// Records rejected at the boundary.
    pub malformed: usize,
    /// True if page fetches failed and the campaign was given up for this run.
    pub abandoned: bool,
    /// Why the walk ended.
    pub stop_reason: Option<String>,
}

/// Everything a run did, for the notifier and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Run identifier.
    pub run_id: DrainRunId,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// True if nothing was written.
    pub dry_run: bool,
    /// True if the re-check window was bypassed.
    pub force_recheck: bool,
    /// Targeting path used.
    pub targeting: TargetingPath,
    /// Per-campaign counters.
    pub campaigns: Vec<CampaignReport>,
    /// Leads classified.
    pub analyzed: usize,
    /// Leads skipped because they were checked recently.
    pub skipped_recently_checked: usize,
    /// Verdict counts by reason.
    pub by_reason: BTreeMap<ReasonCode, usize>,
    /// Tracked leads confirmed gone from the platform.
    pub missing: usize,
    /// Targeted leads that could not be located this run.
    pub unresolved: usize,
    /// Platform call failures that were absorbed.
    pub api_errors: usize,
    /// Leads selected for deletion after de-duplication.
    pub to_drain: usize,
    /// Deletion phase result.
    pub deletion: DeletionSummary,
    /// Failed state-store writes.
    pub sync_failures: usize,
    /// Human-readable errors collected during the run.
    pub errors: Vec<String>,
}

impl DrainReport {
    /// Creates an empty report for a run starting at `started_at`.
    #[must_use]
    pub fn new(run_id: DrainRunId, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            dry_run,
            force_recheck: false,
            targeting: TargetingPath::StateStore,
            campaigns: Vec::new(),
            analyzed: 0,
            skipped_recently_checked: 0,
            by_reason: BTreeMap::new(),
            missing: 0,
            unresolved: 0,
            api_errors: 0,
            to_drain: 0,
            deletion: DeletionSummary::default(),
            sync_failures: 0,
            errors: Vec::new(),
        }
    }

    /// Counts a verdict.
    pub fn count_reason(&mut self, reason: ReasonCode) {
        *self.by_reason.entry(reason).or_default() += 1;
    }

    /// Number of verdicts with the given reason.
    #[must_use]
    pub fn reason_count(&self, reason: ReasonCode) -> usize {
        self.by_reason.get(&reason).copied().unwrap_or(0)
    }

    /// Verdicts that selected a lead for draining.
    #[must_use]
    pub fn drain_verdicts(&self) -> usize {
        self.by_reason
            .iter()
            .filter(|(reason, _)| reason.is_drain())
            .map(|(_, count)| count)
            .sum()
    }

    /// Verdicts that kept a lead.
    #[must_use]
    pub fn keep_verdicts(&self) -> usize {
        self.by_reason
            .iter()
            .filter(|(reason, _)| !reason.is_drain())
            .map(|(_, count)| count)
            .sum()
    }

    /// True if the run finished with work left over.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.deletion.breaker_state == BreakerState::Open
            || self.deletion.not_processed > 0
            || self.campaigns.iter().any(|c| c.abandoned)
    }

    /// Stamps the end of the run.
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = finished_at;
        self.duration_ms = u64::try_from((finished_at - self.started_at).num_milliseconds().max(0))
            .unwrap_or_default();
    }
}
