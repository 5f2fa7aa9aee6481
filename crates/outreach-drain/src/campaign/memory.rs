//! In-memory campaign platform for testing.
//!
//! Holds leads per campaign in platform order and serves them through the
//! same cursor protocol as the HTTP client. Failures are scripted.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: nothing leaves the process
//! - Cursors are page offsets rendered as strings

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use outreach_core::lead::EnrolledLead;

use super::{CampaignApi, DeletionOutcome, LeadPage, MalformedRecord};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Entry {
    Lead(EnrolledLead),
    Malformed(serde_json::Value),
}

#[derive(Debug, Default)]
struct State {
    campaigns: HashMap<String, Vec<Entry>>,
    delete_scripts: HashMap<String, VecDeque<DeletionOutcome>>,
    default_delete: Option<DeletionOutcome>,
    list_failures: HashMap<String, u32>,
    failing_gets: HashSet<String>,
    stuck_cursor: HashSet<String>,
    deleted: Vec<String>,
}

/// In-memory [`CampaignApi`].
#[derive(Debug, Default)]
pub struct InMemoryCampaignApi {
    state: RwLock<State>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryCampaignApi {
    /// Creates an empty platform.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends leads to their campaigns, preserving order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_leads(&self, leads: impl IntoIterator<Item = EnrolledLead>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        for lead in leads {
            state
                .campaigns
                .entry(lead.campaign_id.clone())
                .or_default()
                .push(Entry::Lead(lead));
        }
        Ok(())
    }

    /// Appends a record that fails boundary validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_malformed(&self, campaign_id: &str, raw: serde_json::Value) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state
            .campaigns
            .entry(campaign_id.to_string())
            .or_default()
            .push(Entry::Malformed(raw));
        Ok(())
    }

    /// Queues delete outcomes for one lead; once exhausted the default applies.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn script_deletes(
        &self,
        lead_id: &str,
        outcomes: impl IntoIterator<Item = DeletionOutcome>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state
            .delete_scripts
            .entry(lead_id.to_string())
            .or_default()
            .extend(outcomes);
        Ok(())
    }

    /// Makes every unscripted delete return `outcome`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_default_delete(&self, outcome: DeletionOutcome) -> Result<()> {
        self.state.write().map_err(poison_err)?.default_delete = Some(outcome);
        Ok(())
    }

    /// Makes the next `count` list calls for a campaign fail with a 503.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_list_calls(&self, campaign_id: &str, count: u32) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        *state.list_failures.entry(campaign_id.to_string()).or_default() += count;
        Ok(())
    }

    /// Makes `get_lead` fail with a 500 for one id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_get(&self, lead_id: &str) -> Result<()> {
        self.state
            .write()
            .map_err(poison_err)?
            .failing_gets
            .insert(lead_id.to_string());
        Ok(())
    }

    /// Makes a campaign's cursor never advance, so every page repeats.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn stick_cursor(&self, campaign_id: &str) -> Result<()> {
        self.state
            .write()
            .map_err(poison_err)?
            .stuck_cursor
            .insert(campaign_id.to_string());
        Ok(())
    }

    /// Ids removed by successful deletes, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn deleted_ids(&self) -> Result<Vec<String>> {
        Ok(self.state.read().map_err(poison_err)?.deleted.clone())
    }

    /// Returns true if a lead is still enrolled.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn contains(&self, lead_id: &str) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(find_lead(&state, lead_id).is_some())
    }

    /// Number of list calls made.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of get calls made.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Number of delete attempts made.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

fn find_lead<'a>(state: &'a State, lead_id: &str) -> Option<&'a EnrolledLead> {
    state.campaigns.values().flatten().find_map(|entry| match entry {
        Entry::Lead(lead) if lead.id == lead_id => Some(lead),
        _ => None,
    })
}

#[async_trait]
impl CampaignApi for InMemoryCampaignApi {
    async fn list_leads(
        &self,
        campaign_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<LeadPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(remaining) = state.list_failures.get_mut(campaign_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::api_status(503, "injected list failure"));
            }
        }

        let offset = match cursor {
            None => 0,
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| Error::api_status(400, format!("invalid cursor {c}")))?,
        };
        let stuck = state.stuck_cursor.contains(campaign_id);
        let entries = state.campaigns.get(campaign_id).map_or(&[][..], Vec::as_slice);
        let end = entries.len().min(offset.saturating_add(limit.max(1)));
        let slice = entries.get(offset..end).unwrap_or_default();

        let mut page = LeadPage::default();
        for entry in slice {
            match entry {
                Entry::Lead(lead) => page.leads.push(lead.clone()),
                Entry::Malformed(raw) => page.malformed.push(MalformedRecord {
                    lead_id: raw.get("id").and_then(|v| v.as_str()).map(str::to_string),
                    error: "invalid lead record".to_string(),
                    raw: raw.clone(),
                }),
            }
        }
        page.next_cursor = if stuck && !slice.is_empty() {
            Some(offset.to_string())
        } else if end < entries.len() {
            Some(end.to_string())
        } else {
            None
        };
        Ok(page)
    }

    async fn get_lead(&self, lead_id: &str) -> Result<Option<EnrolledLead>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().map_err(poison_err)?;
        if state.failing_gets.contains(lead_id) {
            return Err(Error::api_status(500, "injected get failure"));
        }
        Ok(find_lead(&state, lead_id).cloned())
    }

    async fn delete_lead(&self, lead_id: &str) -> DeletionOutcome {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let Ok(mut state) = self.state.write() else {
            return DeletionOutcome::ServerError { status: None };
        };

        let scripted = state
            .delete_scripts
            .get_mut(lead_id)
            .and_then(VecDeque::pop_front);
        let outcome = match scripted.or(state.default_delete) {
            Some(outcome) => outcome,
            None if find_lead(&state, lead_id).is_some() => DeletionOutcome::Success,
            None => DeletionOutcome::NotFound,
        };

        if outcome == DeletionOutcome::Success {
            for entries in state.campaigns.values_mut() {
                entries.retain(|e| !matches!(e, Entry::Lead(l) if l.id == lead_id));
            }
            state.deleted.push(lead_id.to_string());
        }
        outcome
    }
}
