//! Classifier output types.

use std::fmt;

use outreach_core::lead::EnrolledLead;
use outreach_core::state::TrackedStatus;
use serde::{Deserialize, Serialize};

/// Why a lead was drained or kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Genuine reply after the sequence finished.
    Replied,
    /// Sequence finished without a reply.
    Completed,
    /// Hard bounce past the grace period.
    BouncedHard,
    /// Recipient unsubscribed.
    Unsubscribed,
    /// Still active long after any real sequence would have ended.
    StaleActive,
    /// Tracked lead no longer exists on the platform.
    Missing,
    /// Reply detected but the platform flagged it as an autoresponder.
    AutoReplySuppressed,
    /// Sequence in progress.
    KeptActive,
    /// Sequence paused.
    KeptPaused,
    /// Any other platform state.
    KeptOther,
    /// Hard bounce inside the grace period.
    RecentBounceGrace,
    /// Soft bounce; the platform retries.
    SoftBounceRetry,
    /// Evaluation failed; kept.
    ClassificationError,
}

impl ReasonCode {
    /// All reason codes, drain reasons first.
    pub const ALL: [Self; 13] = [
        Self::Replied,
        Self::Completed,
        Self::BouncedHard,
        Self::Unsubscribed,
        Self::StaleActive,
        Self::Missing,
        Self::AutoReplySuppressed,
        Self::KeptActive,
        Self::KeptPaused,
        Self::KeptOther,
        Self::RecentBounceGrace,
        Self::SoftBounceRetry,
        Self::ClassificationError,
    ];

    /// Returns the snake-case code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Replied => "replied",
            Self::Completed => "completed",
            Self::BouncedHard => "bounced_hard",
            Self::Unsubscribed => "unsubscribed",
            Self::StaleActive => "stale_active",
            Self::Missing => "missing",
            Self::AutoReplySuppressed => "auto_reply_suppressed",
            Self::KeptActive => "kept_active",
            Self::KeptPaused => "kept_paused",
            Self::KeptOther => "kept_other",
            Self::RecentBounceGrace => "recent_bounce_grace",
            Self::SoftBounceRetry => "soft_bounce_retry",
            Self::ClassificationError => "classification_error",
        }
    }

    /// Returns true if this reason removes the lead from the campaign.
    #[must_use]
    pub const fn is_drain(self) -> bool {
        matches!(
            self,
            Self::Replied
                | Self::Completed
                | Self::BouncedHard
                | Self::Unsubscribed
                | Self::StaleActive
                | Self::Missing
        )
    }

    /// Returns true if the lead gets a history row (re-contact cooldown).
    #[must_use]
    pub const fn records_history(self) -> bool {
        matches!(self, Self::Replied | Self::Completed)
    }

    /// Returns true if the lead goes on the do-not-contact list.
    #[must_use]
    pub const fn is_do_not_contact(self) -> bool {
        matches!(self, Self::Unsubscribed)
    }

    /// The tracked status written for a drained lead.
    #[must_use]
    pub fn tracked_status(self) -> TrackedStatus {
        match self {
            Self::Replied => TrackedStatus::Replied,
            Self::Completed => TrackedStatus::Completed,
            Self::BouncedHard => TrackedStatus::BouncedHard,
            Self::Unsubscribed => TrackedStatus::Unsubscribed,
            Self::StaleActive => TrackedStatus::StaleActive,
            Self::Missing => TrackedStatus::Missing,
            other => TrackedStatus::Other(other.as_str().to_string()),
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The classifier's decision for one lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainVerdict {
    /// Whether the lead leaves the campaign.
    pub should_drain: bool,
    /// Reason code.
    pub reason: ReasonCode,
    /// Free-text explanation for audit logs.
    pub detail: String,
}

impl DrainVerdict {
    /// Creates a verdict; `should_drain` follows the reason.
    #[must_use]
    pub fn new(reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            should_drain: reason.is_drain(),
            reason,
            detail: detail.into(),
        }
    }
}

/// A lead selected for removal, carried through sync and deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainedLead {
    /// Platform lead id.
    pub lead_id: String,
    /// Contact address.
    pub email: String,
    /// Campaign the enrollment belongs to.
    pub campaign_id: String,
    /// Why it is drained.
    pub reason: ReasonCode,
}

impl DrainedLead {
    /// Builds a drained lead from a classified enrollment.
    #[must_use]
    pub fn from_lead(lead: &EnrolledLead, reason: ReasonCode) -> Self {
        Self {
            lead_id: lead.id.clone(),
            email: lead.email.clone(),
            campaign_id: lead.campaign_id.clone(),
            reason,
        }
    }
}
