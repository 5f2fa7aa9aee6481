//! Lead classification.
//!
//! Rules are evaluated in a fixed priority order and the first match wins:
//!
//! 1. Finished, replies, no suppression: drain `replied`
//! 2. Finished, replies, suppression: keep `auto_reply_suppressed`
//! 3. Finished, no replies: drain `completed`
//! 4. Not started / in progress / paused with replies and suppression: keep `auto_reply_suppressed`
//! 5. Not started / in progress for at least the stale window: drain `stale_active`
//! 6. Hard bounce: drain `bounced_hard` after the grace period, else keep `recent_bounce_grace`
//! 7. Soft bounce: keep `soft_bounce_retry`
//! 8. Unsubscribe signal: drain `unsubscribed`
//! 9. Otherwise keep: InProgress as `kept_active`, Paused as `kept_paused`, and
//!    every other lifecycle (NotStarted included) as `kept_other`. A lead that
//!    has not started sending is not an active sequence yet, even though rule 5
//!    already treats it as sequencing for staleness.
//!
//! Classification is pure. Anything that cannot be evaluated is kept.

use chrono::{DateTime, Utc};
use outreach_core::lead::{EnrolledLead, LifecycleStatus};

use crate::config::{ClassifierConfig, UnsubscribeSignal};
use crate::verdict::{DrainVerdict, ReasonCode};

const UNASSIGNED_CAMPAIGN: &str = "unassigned";

/// Classifies enrolled leads against a fixed set of thresholds.
#[derive(Debug, Clone, Default)]
pub struct LeadClassifier {
    config: ClassifierConfig,
}

impl LeadClassifier {
    /// Creates a classifier with the given thresholds.
    #[must_use]
    pub const fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Returns the thresholds in use.
    #[must_use]
    pub const fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classifies a typed lead.
    #[must_use]
    pub fn classify(&self, lead: &EnrolledLead, now: DateTime<Utc>) -> DrainVerdict {
        classify(lead, now, &self.config)
    }

    /// Classifies a raw platform record, keeping it if it cannot be parsed.
    ///
    /// The campaign does not influence the verdict, so records without one are accepted.
    #[must_use]
    pub fn classify_value(&self, value: &serde_json::Value, now: DateTime<Utc>) -> DrainVerdict {
        match EnrolledLead::from_value(value.clone(), Some(UNASSIGNED_CAMPAIGN)) {
            Ok(lead) => self.classify(&lead, now),
            Err(err) => DrainVerdict::new(
                ReasonCode::ClassificationError,
                format!("unparseable lead record: {err}"),
            ),
        }
    }
}

/// Classifies one lead.
#[must_use]
pub fn classify(lead: &EnrolledLead, now: DateTime<Utc>, config: &ClassifierConfig) -> DrainVerdict {
    let status = lead.lifecycle_status;
    let replies = lead.reply_count;
    let suppressed = lead.is_suppressed();
    let days = lead.days_since_created(now);

    if status == LifecycleStatus::Finished && replies > 0 {
        if suppressed {
            return DrainVerdict::new(
                ReasonCode::AutoReplySuppressed,
                format!(
                    "finished with {replies} replies but auto-reply suppression is set until {}",
                    lead.pause_until.as_deref().unwrap_or_default()
                ),
            );
        }
        return DrainVerdict::new(
            ReasonCode::Replied,
            format!("finished with {replies} replies, genuine engagement"),
        );
    }

    if status == LifecycleStatus::Finished {
        return DrainVerdict::new(ReasonCode::Completed, "sequence finished without replies");
    }

    let sequencing = matches!(
        status,
        LifecycleStatus::NotStarted | LifecycleStatus::InProgress
    );

    if (sequencing || status == LifecycleStatus::Paused) && replies > 0 && suppressed {
        return DrainVerdict::new(
            ReasonCode::AutoReplySuppressed,
            format!("{status} with {replies} replies, platform suppressing auto-reply"),
        );
    }

    if sequencing && days >= config.stale_after_days {
        return DrainVerdict::new(
            ReasonCode::StaleActive,
            format!("{status} for {days} days"),
        );
    }

    if lead.delivery_code.is_hard_bounce() {
        let code = lead.delivery_code.esp_code().unwrap_or_default();
        if days >= config.bounce_grace_days {
            return DrainVerdict::new(
                ReasonCode::BouncedHard,
                format!("hard bounce (ESP {code}) after {days} days"),
            );
        }
        return DrainVerdict::new(
            ReasonCode::RecentBounceGrace,
            format!("hard bounce (ESP {code}) within {}-day grace period", config.bounce_grace_days),
        );
    }

    if lead.delivery_code.is_soft_bounce() {
        let code = lead.delivery_code.esp_code().unwrap_or_default();
        return DrainVerdict::new(
            ReasonCode::SoftBounceRetry,
            format!("soft bounce (ESP {code}), platform retrying"),
        );
    }

    if unsubscribe_signalled(lead, config.unsubscribe_signal) {
        return DrainVerdict::new(ReasonCode::Unsubscribed, "lead unsubscribed from campaign");
    }

    let reason = match status {
        LifecycleStatus::InProgress => ReasonCode::KeptActive,
        LifecycleStatus::Paused => ReasonCode::KeptPaused,
        _ => ReasonCode::KeptOther,
    };
    DrainVerdict::new(reason, format!("{status}, {days} days old"))
}

/// Returns true if the lead carries an unsubscribe signal from the given source.
#[must_use]
pub fn unsubscribe_signalled(lead: &EnrolledLead, signal: UnsubscribeSignal) -> bool {
    let from_text = || {
        lead.status_text
            .as_deref()
            .is_some_and(|text| text.to_lowercase().contains("unsubscribed"))
    };
    let from_summary = || lead.status_summary.is_some_and(|s| s.unsubscribed);
    match signal {
        UnsubscribeSignal::StatusText => from_text(),
        UnsubscribeSignal::StatusSummary => from_summary(),
        UnsubscribeSignal::Any => from_text() || from_summary(),
    }
}
