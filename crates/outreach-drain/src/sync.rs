//! State synchronization for drained leads.
//!
//! Writes are best-effort: a failed step is logged with its payload, parked as
//! a dead letter, and counted. It never aborts the run.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error};

use crate::error::Error;
use crate::metrics::DrainMetrics;
use crate::store::{write_dead_letter_best_effort, DeadLetter, DeadLetterPhase, StateStore};
use crate::verdict::DrainedLead;

/// Rows written by one sync call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Status rows upserted.
    pub upserted: usize,
    /// History rows appended.
    pub history: usize,
    /// Do-not-contact entries added.
    pub do_not_contact: usize,
    /// Steps that failed.
    pub failures: usize,
    /// Failure descriptions.
    pub errors: Vec<String>,
}

impl SyncResult {
    /// Folds another result into this one.
    pub fn merge(&mut self, other: Self) {
        self.upserted += other.upserted;
        self.history += other.history;
        self.do_not_contact += other.do_not_contact;
        self.failures += other.failures;
        self.errors.extend(other.errors);
    }
}

/// Records drained leads in the state store.
pub struct StateSynchronizer<'a> {
    store: &'a dyn StateStore,
    dry_run: bool,
    metrics: DrainMetrics,
}

impl<'a> StateSynchronizer<'a> {
    /// Creates a synchronizer. In dry-run mode nothing is written.
    #[must_use]
    pub fn new(store: &'a dyn StateStore, dry_run: bool) -> Self {
        Self {
            store,
            dry_run,
            metrics: DrainMetrics::new(),
        }
    }

    /// Upserts statuses, then appends history for finished sequences and
    /// records unsubscribes as do-not-contact.
    ///
    /// `deleted` marks the leads as removed from the platform.
    pub async fn sync(&self, leads: &[DrainedLead], deleted: bool, now: DateTime<Utc>) -> SyncResult {
        let mut result = SyncResult::default();
        if leads.is_empty() {
            return result;
        }
        if self.dry_run {
            debug!(leads = leads.len(), "dry run, skipping state sync");
            return result;
        }

        match self.store.upsert_statuses(leads, deleted, now).await {
            Ok(count) => result.upserted = count,
            Err(err) => self.fail("upsert_statuses", leads, &err, now, &mut result).await,
        }

        let history: Vec<DrainedLead> = leads
            .iter()
            .filter(|lead| lead.reason.records_history())
            .cloned()
            .collect();
        if !history.is_empty() {
            match self.store.append_history(&history, now).await {
                Ok(count) => result.history = count,
                Err(err) => self.fail("append_history", &history, &err, now, &mut result).await,
            }
        }

        let blocked: Vec<DrainedLead> = leads
            .iter()
            .filter(|lead| lead.reason.is_do_not_contact())
            .cloned()
            .collect();
        if !blocked.is_empty() {
            match self.store.insert_do_not_contact(&blocked, now).await {
                Ok(count) => result.do_not_contact = count,
                Err(err) => {
                    self.fail("insert_do_not_contact", &blocked, &err, now, &mut result)
                        .await;
                }
            }
        }

        debug!(
            upserted = result.upserted,
            history = result.history,
            do_not_contact = result.do_not_contact,
            failures = result.failures,
            "state sync finished"
        );
        result
    }

    async fn fail(
        &self,
        operation: &str,
        leads: &[DrainedLead],
        err: &Error,
        now: DateTime<Utc>,
        result: &mut SyncResult,
    ) {
        let payload = json!({ "operation": operation, "leads": leads });
        error!(
            operation,
            leads = leads.len(),
            error = %err,
            payload = %payload,
            "state sync failed"
        );
        self.metrics.record_sync_failure(operation);
        result.failures += 1;
        result.errors.push(format!("{operation}: {err}"));

        let mut letter = DeadLetter::new(DeadLetterPhase::StateSync, now, err.to_string(), payload);
        if let [only] = leads {
            letter = letter.with_email(only.email.clone());
        }
        write_dead_letter_best_effort(self.store, letter).await;
    }
}
