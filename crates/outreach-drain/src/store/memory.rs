//! In-memory state store implementation for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **No persistence**: All state is lost when the process exits

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use outreach_core::state::{
    is_due_for_check, DeletionStatus, TrackedKey, TrackedLeadState,
};

use super::{DeadLetter, DrainCandidate, StateStore};
use crate::error::{Error, Result};
use crate::verdict::{DrainedLead, ReasonCode};

/// An appended history row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Contact address.
    pub email: String,
    /// Campaign the enrollment belonged to.
    pub campaign_id: String,
    /// Platform lead id.
    pub lead_id: String,
    /// Drain reason.
    pub reason: ReasonCode,
    /// When it was recorded.
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    rows: BTreeMap<TrackedKey, TrackedLeadState>,
    history: Vec<HistoryEntry>,
    do_not_contact: HashMap<String, DateTime<Utc>>,
    dead_letters: Vec<DeadLetter>,
}

/// In-memory [`StateStore`].
///
/// Reads and writes can be made to fail independently to exercise the
/// engine's error paths.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    tables: RwLock<Tables>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_dead_letters: AtomicBool,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces tracked rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert_rows(&self, rows: impl IntoIterator<Item = TrackedLeadState>) -> Result<()> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        for row in rows {
            tables.rows.insert(row.key(), row);
        }
        Ok(())
    }

    /// Returns the row for `(email, campaign_id)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn get(&self, email: &str, campaign_id: &str) -> Result<Option<TrackedLeadState>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.rows.get(&TrackedKey::new(email, campaign_id)).cloned())
    }

    /// Returns every row in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn rows(&self) -> Result<Vec<TrackedLeadState>> {
        Ok(self.tables.read().map_err(poison_err)?.rows.values().cloned().collect())
    }

    /// Returns the appended history rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.tables.read().map_err(poison_err)?.history.clone())
    }

    /// Returns the do-not-contact emails, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn do_not_contact(&self) -> Result<Vec<String>> {
        let tables = self.tables.read().map_err(poison_err)?;
        let mut emails: Vec<_> = tables.do_not_contact.keys().cloned().collect();
        emails.sort();
        Ok(emails)
    }

    /// Returns the dead letters written so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.tables.read().map_err(poison_err)?.dead_letters.clone())
    }

    /// Makes every query fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every tracked-state write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes dead-letter writes fail.
    pub fn set_fail_dead_letters(&self, fail: bool) {
        self.fail_dead_letters.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::storage("injected read failure"));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage("injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn probe(&self) -> Result<()> {
        self.check_read()?;
        self.tables.read().map_err(poison_err).map(|_| ())
    }

    async fn drain_candidates(
        &self,
        campaign_ids: &[String],
        now: DateTime<Utc>,
        recheck_after: Duration,
        limit: usize,
    ) -> Result<Vec<DrainCandidate>> {
        self.check_read()?;
        let tables = self.tables.read().map_err(poison_err)?;
        let campaigns: HashSet<&str> = campaign_ids.iter().map(String::as_str).collect();

        let mut due: Vec<&TrackedLeadState> = tables
            .rows
            .values()
            .filter(|row| row.status.is_enrolled())
            .filter(|row| campaigns.contains(row.campaign_id.as_str()))
            .filter(|row| !row.platform_lead_id.is_empty())
            .filter(|row| is_due_for_check(row.last_drain_check_at, now, recheck_after))
            .collect();

        // `None` sorts before `Some`, so never-checked rows come first.
        due.sort_by(|a, b| {
            a.last_drain_check_at
                .cmp(&b.last_drain_check_at)
                .then_with(|| a.email.cmp(&b.email))
        });

        Ok(due
            .into_iter()
            .take(limit)
            .map(|row| DrainCandidate {
                platform_lead_id: row.platform_lead_id.clone(),
                email: row.email.clone(),
                campaign_id: row.campaign_id.clone(),
                status: row.status.clone(),
                last_drain_check_at: row.last_drain_check_at,
            })
            .collect())
    }

    async fn last_drain_checks(
        &self,
        lead_ids: &[String],
    ) -> Result<HashMap<String, Option<DateTime<Utc>>>> {
        self.check_read()?;
        let tables = self.tables.read().map_err(poison_err)?;
        let wanted: HashSet<&str> = lead_ids.iter().map(String::as_str).collect();
        let mut checks: HashMap<String, Option<DateTime<Utc>>> = HashMap::new();
        for row in tables.rows.values() {
            if wanted.contains(row.platform_lead_id.as_str()) {
                let entry = checks.entry(row.platform_lead_id.clone()).or_insert(None);
                *entry = (*entry).max(row.last_drain_check_at);
            }
        }
        Ok(checks)
    }

    async fn touch_drain_checks(&self, lead_ids: &[String], now: DateTime<Utc>) -> Result<usize> {
        self.check_write()?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        let wanted: HashSet<&str> = lead_ids.iter().map(String::as_str).collect();
        let mut touched = 0;
        for row in tables.rows.values_mut() {
            if wanted.contains(row.platform_lead_id.as_str()) {
                let before = row.last_drain_check_at;
                row.advance_drain_check(now);
                if row.last_drain_check_at != before {
                    row.updated_at = now;
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    async fn upsert_statuses(
        &self,
        leads: &[DrainedLead],
        deleted: bool,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.check_write()?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        for lead in leads {
            let key = TrackedKey::new(&lead.email, &lead.campaign_id);
            let row = tables.rows.entry(key).or_insert_with(|| {
                TrackedLeadState::enrolled(&lead.email, &lead.campaign_id, &lead.lead_id, now)
            });
            row.status = lead.reason.tracked_status();
            row.updated_at = now;
            if deleted {
                row.deletion_status = Some(DeletionStatus::Done);
            }
        }
        Ok(leads.len())
    }

    async fn append_history(&self, leads: &[DrainedLead], now: DateTime<Utc>) -> Result<usize> {
        self.check_write()?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        tables.history.extend(leads.iter().map(|lead| HistoryEntry {
            email: lead.email.clone(),
            campaign_id: lead.campaign_id.clone(),
            lead_id: lead.lead_id.clone(),
            reason: lead.reason,
            recorded_at: now,
        }));
        Ok(leads.len())
    }

    async fn insert_do_not_contact(
        &self,
        leads: &[DrainedLead],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.check_write()?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        let mut inserted = 0;
        for lead in leads {
            let email = lead.email.trim().to_lowercase();
            if !tables.do_not_contact.contains_key(&email) {
                tables.do_not_contact.insert(email, now);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn record_deletion_failures(
        &self,
        lead_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.check_write()?;
        let mut tables = self.tables.write().map_err(poison_err)?;
        let wanted: HashSet<&str> = lead_ids.iter().map(String::as_str).collect();
        let mut updated = 0;
        for row in tables.rows.values_mut() {
            if wanted.contains(row.platform_lead_id.as_str()) {
                row.deletion_status = Some(DeletionStatus::Failed);
                row.deletion_attempts += 1;
                row.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn write_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        if self.fail_dead_letters.load(Ordering::SeqCst) {
            return Err(Error::storage("injected dead letter failure"));
        }
        self.tables
            .write()
            .map_err(poison_err)?
            .dead_letters
            .push(letter.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use outreach_core::state::TrackedStatus;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn drained(id: &str, email: &str, reason: ReasonCode) -> DrainedLead {
        DrainedLead {
            lead_id: id.into(),
            email: email.into(),
            campaign_id: "c1".into(),
            reason,
        }
    }

    #[tokio::test]
    async fn candidates_are_ordered_and_limited() {
        let store = InMemoryStateStore::new();
        store
            .insert_rows([
                TrackedLeadState::enrolled("b@x.com", "c1", "l2", now())
                    .with_last_drain_check(now() - Duration::hours(30)),
                TrackedLeadState::enrolled("c@x.com", "c1", "l3", now()),
                TrackedLeadState::enrolled("a@x.com", "c1", "l1", now())
                    .with_last_drain_check(now() - Duration::hours(48)),
                TrackedLeadState::enrolled("d@x.com", "c1", "l4", now())
                    .with_last_drain_check(now() - Duration::hours(1)),
                TrackedLeadState::enrolled("e@x.com", "c1", "l5", now())
                    .with_status(TrackedStatus::Completed),
                TrackedLeadState::enrolled("f@x.com", "c2", "l6", now()),
            ])
            .unwrap();

        let ids: Vec<_> = store
            .drain_candidates(&["c1".into()], now(), Duration::hours(24), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.platform_lead_id)
            .collect();
        assert_eq!(ids, ["l3", "l1", "l2"]);

        let limited = store
            .drain_candidates(&["c1".into()], now(), Duration::hours(24), 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn touch_is_monotonic() {
        let store = InMemoryStateStore::new();
        store
            .insert_rows([TrackedLeadState::enrolled("a@x.com", "c1", "l1", now())
                .with_last_drain_check(now())])
            .unwrap();
        let touched = store
            .touch_drain_checks(&["l1".into()], now() - Duration::hours(5))
            .await
            .unwrap();
        assert_eq!(touched, 0);
        let checks = store
            .last_drain_checks(&["l1".into(), "unknown".into()])
            .await
            .unwrap();
        assert_eq!(checks.get("l1"), Some(&Some(now())));
        assert!(!checks.contains_key("unknown"));
    }

    #[tokio::test]
    async fn upsert_inserts_missing_rows_case_insensitively() {
        let store = InMemoryStateStore::new();
        store
            .insert_rows([TrackedLeadState::enrolled("A@X.com", "c1", "l1", now())])
            .unwrap();
        store
            .upsert_statuses(
                &[
                    drained("l1", "a@x.com", ReasonCode::Completed),
                    drained("l9", "new@x.com", ReasonCode::Replied),
                ],
                true,
                now(),
            )
            .await
            .unwrap();
        let row = store.get("a@x.com", "c1").unwrap().unwrap();
        assert_eq!(row.status, TrackedStatus::Completed);
        assert_eq!(row.deletion_status, Some(DeletionStatus::Done));
        assert_eq!(store.rows().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn do_not_contact_is_deduplicated() {
        let store = InMemoryStateStore::new();
        let lead = drained("l1", "a@x.com", ReasonCode::Unsubscribed);
        assert_eq!(store.insert_do_not_contact(&[lead.clone()], now()).await.unwrap(), 1);
        assert_eq!(store.insert_do_not_contact(&[lead], now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = InMemoryStateStore::new();
        store.set_fail_writes(true);
        assert!(store.append_history(&[], now()).await.is_err());
        store.set_fail_reads(true);
        assert!(store.probe().await.is_err());
    }
}
