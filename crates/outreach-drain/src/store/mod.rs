//! State store abstraction.
//!
//! The [`StateStore`] trait is the system of record for tracked leads. Every
//! write is an idempotent upsert or an append, so repeated runs converge.
//!
//! ## Implementations
//!
//! - [`memory::InMemoryStateStore`]: for tests and local development
//! - [`bigquery::BigQueryStateStore`]: the production warehouse

pub mod bigquery;
pub mod memory;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use outreach_core::id::DeadLetterId;
use outreach_core::state::TrackedStatus;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::verdict::DrainedLead;

pub use bigquery::BigQueryStateStore;
pub use memory::InMemoryStateStore;

/// A tracked lead due for re-evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainCandidate {
    /// Platform lead id recorded at enrollment.
    pub platform_lead_id: String,
    /// Contact address.
    pub email: String,
    /// Campaign the enrollment belongs to.
    pub campaign_id: String,
    /// Tracked status (always enrolled for candidates).
    pub status: TrackedStatus,
    /// Last evaluation, if any.
    pub last_drain_check_at: Option<DateTime<Utc>>,
}

/// Stage that produced a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterPhase {
    /// Bulk state synchronisation.
    StateSync,
    /// Deletion from the campaign platform.
    DrainDelete,
    /// Listing a campaign page.
    ListLeads,
    /// Looking up a tracked lead by id.
    GetLead,
}

impl DeadLetterPhase {
    /// Stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StateSync => "state_sync",
            Self::DrainDelete => "drain_delete",
            Self::ListLeads => "list_leads",
            Self::GetLead => "get_lead",
        }
    }
}

impl fmt::Display for DeadLetterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminally failed operation kept for manual inspection or replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Record id.
    pub id: DeadLetterId,
    /// When the failure happened.
    pub occurred_at: DateTime<Utc>,
    /// Stage that failed.
    pub phase: DeadLetterPhase,
    /// Affected contact, when the failure concerns one lead.
    pub email: Option<String>,
    /// HTTP status, when one was received.
    pub http_status: Option<u16>,
    /// Error description.
    pub error_text: String,
    /// Context needed to replay the operation.
    pub payload: serde_json::Value,
}

impl DeadLetter {
    /// Creates a dead letter with a fresh id.
    #[must_use]
    pub fn new(
        phase: DeadLetterPhase,
        occurred_at: DateTime<Utc>,
        error_text: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: DeadLetterId::generate(),
            occurred_at,
            phase,
            email: None,
            http_status: None,
            error_text: error_text.into(),
            payload,
        }
    }

    /// Sets the affected email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the HTTP status.
    #[must_use]
    pub const fn with_http_status(mut self, status: Option<u16>) -> Self {
        self.http_status = status;
        self
    }
}

/// Persistence for tracked lead state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Verifies connectivity and credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn probe(&self) -> Result<()>;

    /// Returns enrolled rows in the given campaigns that are due for a check,
    /// never-checked first, then oldest check first, then by email.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn drain_candidates(
        &self,
        campaign_ids: &[String],
        now: DateTime<Utc>,
        recheck_after: Duration,
        limit: usize,
    ) -> Result<Vec<DrainCandidate>>;

    /// Looks up the last drain check for each platform lead id.
    ///
    /// Tracked ids map to their timestamp (or `None` if never checked).
    /// Untracked ids are absent from the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn last_drain_checks(
        &self,
        lead_ids: &[String],
    ) -> Result<HashMap<String, Option<DateTime<Utc>>>>;

    /// Moves `last_drain_check_at` forward to `now` for each tracked id.
    /// Returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    async fn touch_drain_checks(&self, lead_ids: &[String], now: DateTime<Utc>) -> Result<usize>;

    /// Sets `status = reason` for each drained lead, inserting missing rows.
    /// With `deleted`, the rows are also marked as removed from the platform.
    ///
    /// # Errors
    ///
    /// Returns an error if the merge fails.
    async fn upsert_statuses(
        &self,
        leads: &[DrainedLead],
        deleted: bool,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Appends immutable history rows used for re-contact cooldowns.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    async fn append_history(&self, leads: &[DrainedLead], now: DateTime<Utc>) -> Result<usize>;

    /// Adds leads to the permanent do-not-contact list. Existing entries are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    async fn insert_do_not_contact(
        &self,
        leads: &[DrainedLead],
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Marks a failed delete attempt for each lead id.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    async fn record_deletion_failures(
        &self,
        lead_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Persists a dead letter.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails. Callers treat this as best-effort.
    async fn write_dead_letter(&self, letter: &DeadLetter) -> Result<()>;
}

/// Writes a dead letter, logging and swallowing any failure.
pub async fn write_dead_letter_best_effort(store: &dyn StateStore, letter: DeadLetter) {
    if let Err(err) = store.write_dead_letter(&letter).await {
        tracing::warn!(
            phase = %letter.phase,
            email = letter.email.as_deref().unwrap_or_default(),
            error = %err,
            "failed to write dead letter"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_builder() {
        let letter = DeadLetter::new(
            DeadLetterPhase::DrainDelete,
            Utc::now(),
            "client error",
            serde_json::json!({"lead_id": "l1"}),
        )
        .with_email("a@example.com")
        .with_http_status(Some(422));
        assert_eq!(letter.phase.as_str(), "drain_delete");
        assert_eq!(letter.http_status, Some(422));
        assert_eq!(letter.email.as_deref(), Some("a@example.com"));
    }
}
