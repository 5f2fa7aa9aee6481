//! Persistent per-lead tracking rows kept in the system of record.
//!
//! One [`TrackedLeadState`] exists per `(email, campaign_id)`; email comparison
//! is case-insensitive. Rows are never physically deleted.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Local lifecycle mirror of a tracked lead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TrackedStatus {
    /// Enrolled and sending.
    Active,
    /// Enrolled, waiting on the platform.
    Pending,
    /// Drained after a genuine reply.
    Replied,
    /// Drained after the sequence finished without reply.
    Completed,
    /// Drained after a hard bounce.
    BouncedHard,
    /// Drained after an unsubscribe.
    Unsubscribed,
    /// Drained by the staleness safety net.
    StaleActive,
    /// No longer present on the platform.
    Missing,
    /// Soft-delete marker.
    Deleted,
    /// Any other value found in the store.
    Other(String),
}

impl TrackedStatus {
    /// Returns the stored string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Replied => "replied",
            Self::Completed => "completed",
            Self::BouncedHard => "bounced_hard",
            Self::Unsubscribed => "unsubscribed",
            Self::StaleActive => "stale_active",
            Self::Missing => "missing",
            Self::Deleted => "deleted",
            Self::Other(s) => s,
        }
    }

    /// Returns true for statuses eligible for drain evaluation.
    #[must_use]
    pub const fn is_enrolled(&self) -> bool {
        matches!(self, Self::Active | Self::Pending)
    }
}

impl FromStr for TrackedStatus {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => Self::Active,
            "pending" => Self::Pending,
            "replied" => Self::Replied,
            "completed" => Self::Completed,
            "bounced_hard" => Self::BouncedHard,
            "unsubscribed" => Self::Unsubscribed,
            "stale_active" => Self::StaleActive,
            "missing" => Self::Missing,
            "deleted" => Self::Deleted,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<String> for TrackedStatus {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl From<TrackedStatus> for String {
    fn from(value: TrackedStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TrackedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the last delete attempt recorded for a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStatus {
    /// Removed from the platform.
    Done,
    /// Delete attempted and failed.
    Failed,
}

/// Composite key of a tracked row: lowercased email plus campaign.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackedKey {
    /// Lowercased email.
    pub email: String,
    /// Campaign identifier.
    pub campaign_id: String,
}

impl TrackedKey {
    /// Builds a key, normalizing the email.
    #[must_use]
    pub fn new(email: &str, campaign_id: &str) -> Self {
        Self {
            email: email.trim().to_lowercase(),
            campaign_id: campaign_id.to_string(),
        }
    }
}

/// A tracking row for one enrolled contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedLeadState {
    /// Contact address.
    pub email: String,
    /// Campaign identifier.
    pub campaign_id: String,
    /// Platform lead id at the time the row was created.
    pub platform_lead_id: String,
    /// Local lifecycle mirror.
    pub status: TrackedStatus,
    /// Last drain evaluation; `None` means never evaluated.
    pub last_drain_check_at: Option<DateTime<Utc>>,
    /// When the row was created.
    pub added_at: DateTime<Utc>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
    /// Outcome of the last delete attempt.
    #[serde(default)]
    pub deletion_status: Option<DeletionStatus>,
    /// Number of failed delete attempts.
    #[serde(default)]
    pub deletion_attempts: u32,
}

impl TrackedLeadState {
    /// Creates a freshly enrolled row that has never been evaluated.
    #[must_use]
    pub fn enrolled(
        email: impl Into<String>,
        campaign_id: impl Into<String>,
        platform_lead_id: impl Into<String>,
        added_at: DateTime<Utc>,
    ) -> Self {
        Self {
            email: email.into(),
            campaign_id: campaign_id.into(),
            platform_lead_id: platform_lead_id.into(),
            status: TrackedStatus::Active,
            last_drain_check_at: None,
            added_at,
            updated_at: added_at,
            deletion_status: None,
            deletion_attempts: 0,
        }
    }

    /// Sets the last drain check.
    #[must_use]
    pub fn with_last_drain_check(mut self, at: DateTime<Utc>) -> Self {
        self.last_drain_check_at = Some(at);
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: TrackedStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns the composite key.
    #[must_use]
    pub fn key(&self) -> TrackedKey {
        TrackedKey::new(&self.email, &self.campaign_id)
    }

    /// Moves the drain check forward to `at`. Earlier timestamps are ignored.
    pub fn advance_drain_check(&mut self, at: DateTime<Utc>) {
        if self.last_drain_check_at.map_or(true, |prev| prev < at) {
            self.last_drain_check_at = Some(at);
        }
    }
}

/// Returns true if a lead last checked at `last_check` is due for re-evaluation.
///
/// Never-checked leads are always due. Otherwise at least `recheck_after` must
/// have elapsed.
#[must_use]
pub fn is_due_for_check(
    last_check: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    recheck_after: Duration,
) -> bool {
    last_check.map_or(true, |at| now - at >= recheck_after)
}
