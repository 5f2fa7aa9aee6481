//! Drain targeting.
//!
//! Decides which enrolled leads are worth classifying this run.
//!
//! ## Paths
//!
//! - **State store** (preferred): tracked rows due for a check, oldest check
//!   first, capped at `drain_batch_size`. The platform has no batch lookup by
//!   id, so each campaign is paginated until every targeted id has been seen.
//!   Ids still unseen once the campaign is exhausted are probed individually;
//!   a 404 marks them missing.
//! - **Full scan** (fallback, or forced): every page of every campaign, with
//!   duplicate-page protection, the per-lead re-check window, and two early
//!   exits (empty page; page with nothing due whose oldest update is older
//!   than `pagination_stop_after`).
//!
//! A page that keeps failing abandons its campaign for this run; the next
//! run's re-check window picks up the remainder. Page fetches that exhaust
//! their attempts and failed id lookups are written to the dead-letter table.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use outreach_core::lead::EnrolledLead;
use outreach_core::state::is_due_for_check;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::campaign::{CampaignApi, LeadPage};
use crate::config::{CampaignTarget, DrainConfig};
use crate::error::Result;
use crate::metrics::DrainMetrics;
use crate::rate_limit::{AdaptiveRateLimiter, CallOutcome};
use crate::report::{CampaignReport, TargetingPath};
use crate::store::{
    write_dead_letter_best_effort, DeadLetter, DeadLetterPhase, DrainCandidate, StateStore,
};

/// Which leads to look at this run.
#[derive(Debug, Clone)]
pub struct TargetingPlan {
    /// Path chosen.
    pub path: TargetingPath,
    /// Due candidates per campaign, in store order. Empty for a full scan.
    pub targets: HashMap<String, Vec<DrainCandidate>>,
    /// Why the full scan was chosen, if it was.
    pub fallback_reason: Option<String>,
}

impl TargetingPlan {
    fn full_scan(reason: impl Into<String>) -> Self {
        Self {
            path: TargetingPath::FullScan,
            targets: HashMap::new(),
            fallback_reason: Some(reason.into()),
        }
    }

    /// Total number of targeted candidates.
    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.targets.values().map(Vec::len).sum()
    }
}

/// Leads selected from one campaign.
#[derive(Debug, Clone, Default)]
pub struct CampaignSelection {
    /// Leads to classify, in evaluation order.
    pub leads: Vec<EnrolledLead>,
    /// Tracked candidates confirmed gone from the platform.
    pub missing: Vec<DrainCandidate>,
    /// Targeted ids that could not be located this run.
    pub unresolved: Vec<String>,
    /// Absorbed platform or store failures.
    pub api_errors: usize,
    /// Human-readable errors.
    pub errors: Vec<String>,
    /// Counters for the run report.
    pub report: CampaignReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkEnd {
    AllFound,
    Exhausted,
    PageCap,
    Stuck,
    Abandoned,
}

/// Chooses candidates for classification.
pub struct TargetingSelector<'a> {
    api: &'a dyn CampaignApi,
    store: &'a dyn StateStore,
    config: &'a DrainConfig,
    metrics: DrainMetrics,
}

impl<'a> TargetingSelector<'a> {
    /// Creates a selector.
    #[must_use]
    pub fn new(api: &'a dyn CampaignApi, store: &'a dyn StateStore, config: &'a DrainConfig) -> Self {
        Self {
            api,
            store,
            config,
            metrics: DrainMetrics::new(),
        }
    }

    /// Chooses the targeting path and, for the state-store path, the candidates.
    ///
    /// Store failures fall back to a full scan.
    pub async fn plan(&self, now: DateTime<Utc>) -> TargetingPlan {
        if self.config.force_recheck {
            info!("force recheck enabled, scanning every campaign");
            return TargetingPlan::full_scan("force recheck");
        }

        let campaign_ids: Vec<String> = self.config.campaigns.iter().map(|c| c.id.clone()).collect();
        let candidates = match self
            .store
            .drain_candidates(
                &campaign_ids,
                now,
                self.config.recheck_after(),
                self.config.drain_batch_size,
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "candidate query failed, falling back to full scan");
                return TargetingPlan::full_scan(format!("candidate query failed: {err}"));
            }
        };

        if candidates.is_empty() {
            info!("no tracked leads due for a check, falling back to full scan");
            return TargetingPlan::full_scan("no tracked leads due");
        }

        let mut targets: HashMap<String, Vec<DrainCandidate>> = HashMap::new();
        for candidate in candidates {
            targets
                .entry(candidate.campaign_id.clone())
                .or_default()
                .push(candidate);
        }
        info!(
            campaigns = targets.len(),
            candidates = targets.values().map(Vec::len).sum::<usize>(),
            batch_size = self.config.drain_batch_size,
            "targeting tracked leads due for a check"
        );
        TargetingPlan {
            path: TargetingPath::StateStore,
            targets,
            fallback_reason: None,
        }
    }

    /// Selects the leads to classify in one campaign.
    ///
    /// `budget` caps the number of leads returned.
    pub async fn select(
        &self,
        plan: &TargetingPlan,
        campaign: &CampaignTarget,
        now: DateTime<Utc>,
        limiter: &mut AdaptiveRateLimiter,
        budget: Option<usize>,
    ) -> CampaignSelection {
        let mut selection = CampaignSelection {
            report: CampaignReport {
                campaign_id: campaign.id.clone(),
                name: campaign.name.clone(),
                ..CampaignReport::default()
            },
            ..CampaignSelection::default()
        };
        if budget == Some(0) {
            selection.report.stop_reason = Some("lead_cap".to_string());
            return selection;
        }

        match plan.path {
            TargetingPath::StateStore => {
                let targets = plan.targets.get(&campaign.id).map_or(&[][..], Vec::as_slice);
                if targets.is_empty() {
                    selection.report.stop_reason = Some("nothing_due".to_string());
                } else {
                    self.locate_targets(campaign, targets, now, limiter, budget, &mut selection)
                        .await;
                }
            }
            TargetingPath::FullScan => {
                self.scan_campaign(campaign, now, limiter, budget, &mut selection)
                    .await;
            }
        }
        selection
    }

    async fn locate_targets(
        &self,
        campaign: &CampaignTarget,
        targets: &[DrainCandidate],
        now: DateTime<Utc>,
        limiter: &mut AdaptiveRateLimiter,
        budget: Option<usize>,
        selection: &mut CampaignSelection,
    ) {
        let wanted: HashSet<&str> = targets.iter().map(|c| c.platform_lead_id.as_str()).collect();
        let mut found: HashMap<String, EnrolledLead> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut duplicate_pages = 0;
        let mut cursor: Option<String> = None;

        let end = loop {
            if selection.report.pages >= self.config.max_pages_per_campaign {
                break WalkEnd::PageCap;
            }
            let page = match self.fetch_page(&campaign.id, cursor.as_deref(), now, limiter).await {
                Ok(page) => page,
                Err(err) => {
                    selection.api_errors += 1;
                    selection
                        .errors
                        .push(format!("campaign {}: page fetch failed: {err}", campaign.id));
                    break WalkEnd::Abandoned;
                }
            };
            selection.report.pages += 1;
            selection.report.malformed += page.malformed.len();

            if page.is_empty() {
                break WalkEnd::Exhausted;
            }

            let mut fresh = 0;
            for lead in page.leads {
                if !seen.insert(lead.id.clone()) {
                    continue;
                }
                fresh += 1;
                if wanted.contains(lead.id.as_str()) {
                    found.insert(lead.id.clone(), lead);
                }
            }

            if found.len() == wanted.len() {
                break WalkEnd::AllFound;
            }
            if fresh == 0 && page.malformed.is_empty() {
                duplicate_pages += 1;
                if duplicate_pages >= self.config.duplicate_page_limit {
                    warn!(campaign_id = %campaign.id, duplicate_pages, "cursor is repeating pages, aborting walk");
                    break WalkEnd::Stuck;
                }
            } else {
                duplicate_pages = 0;
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break WalkEnd::Exhausted,
            }
        };

        selection.report.abandoned = end == WalkEnd::Abandoned;
        selection.report.stop_reason = Some(walk_end_label(end).to_string());
        debug!(
            campaign_id = %campaign.id,
            targeted = targets.len(),
            found = found.len(),
            pages = selection.report.pages,
            end = walk_end_label(end),
            "targeted walk finished"
        );

        let mut not_found = Vec::new();
        for candidate in targets {
            match found.remove(&candidate.platform_lead_id) {
                Some(lead) => selection.leads.push(lead),
                None => not_found.push(candidate.clone()),
            }
        }

        if end == WalkEnd::Exhausted {
            for candidate in not_found {
                self.probe_missing(candidate, now, limiter, selection).await;
            }
        } else {
            selection
                .unresolved
                .extend(not_found.into_iter().map(|c| c.platform_lead_id));
        }

        if let Some(cap) = budget {
            if selection.leads.len() > cap {
                selection.leads.truncate(cap);
                selection.report.stop_reason = Some("lead_cap".to_string());
            }
        }
    }

    async fn probe_missing(
        &self,
        candidate: DrainCandidate,
        now: DateTime<Utc>,
        limiter: &mut AdaptiveRateLimiter,
        selection: &mut CampaignSelection,
    ) {
        limiter.wait().await;
        match self.api.get_lead(&candidate.platform_lead_id).await {
            Ok(None) => {
                limiter.record(CallOutcome::Success);
                info!(
                    lead_id = %candidate.platform_lead_id,
                    email = %candidate.email,
                    "tracked lead no longer exists on the platform"
                );
                selection.missing.push(candidate);
            }
            Ok(Some(lead)) => {
                limiter.record(CallOutcome::Success);
                debug!(lead_id = %lead.id, "lead located by id after walk");
                selection.leads.push(lead);
            }
            Err(err) => {
                limiter.record(call_outcome(&err));
                warn!(lead_id = %candidate.platform_lead_id, error = %err, "lead lookup failed, retrying next run");
                selection.api_errors += 1;
                let letter = DeadLetter::new(
                    DeadLetterPhase::GetLead,
                    now,
                    format!("lead lookup failed: {err}"),
                    json!({
                        "lead_id": candidate.platform_lead_id,
                        "campaign_id": candidate.campaign_id,
                    }),
                )
                .with_email(candidate.email.clone())
                .with_http_status(err.http_status());
                self.dead_letter(letter).await;
                selection.unresolved.push(candidate.platform_lead_id);
            }
        }
    }

    async fn scan_campaign(
        &self,
        campaign: &CampaignTarget,
        now: DateTime<Utc>,
        limiter: &mut AdaptiveRateLimiter,
        budget: Option<usize>,
        selection: &mut CampaignSelection,
    ) {
        let stop_after = now - self.config.pagination_stop_after();
        let mut seen: HashSet<String> = HashSet::new();
        let mut duplicate_pages = 0;
        let mut cursor: Option<String> = None;

        let stop_reason = loop {
            if selection.report.pages >= self.config.max_pages_per_campaign {
                break "page_cap";
            }
            let page = match self.fetch_page(&campaign.id, cursor.as_deref(), now, limiter).await {
                Ok(page) => page,
                Err(err) => {
                    selection.api_errors += 1;
                    selection
                        .errors
                        .push(format!("campaign {}: page fetch failed: {err}", campaign.id));
                    selection.report.abandoned = true;
                    break "abandoned";
                }
            };
            selection.report.pages += 1;
            selection.report.malformed += page.malformed.len();

            if page.is_empty() {
                break "empty_page";
            }

            let oldest_update = page.leads.iter().filter_map(|l| l.updated_at).min();
            let new_leads: Vec<EnrolledLead> = page
                .leads
                .into_iter()
                .filter(|lead| seen.insert(lead.id.clone()))
                .collect();

            if new_leads.is_empty() && page.malformed.is_empty() {
                duplicate_pages += 1;
                if duplicate_pages >= self.config.duplicate_page_limit {
                    warn!(campaign_id = %campaign.id, duplicate_pages, "cursor is repeating pages, aborting scan");
                    break "duplicate_pages";
                }
                match page.next_cursor {
                    Some(next) => {
                        cursor = Some(next);
                        continue;
                    }
                    None => break "end_of_campaign",
                }
            }
            duplicate_pages = 0;

            let due = self.filter_due(new_leads, now, selection).await;
            let fresh = due.len();

            let mut capped = false;
            for lead in due {
                if budget.is_some_and(|cap| selection.leads.len() >= cap) {
                    capped = true;
                    break;
                }
                selection.leads.push(lead);
            }
            if capped || budget.is_some_and(|cap| selection.leads.len() >= cap) {
                break "lead_cap";
            }

            if fresh == 0
                && !self.config.force_recheck
                && oldest_update.is_some_and(|oldest| oldest < stop_after)
            {
                debug!(campaign_id = %campaign.id, "page had nothing due and only old updates, stopping scan");
                break "stale_page";
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break "end_of_campaign",
            }
        };

        selection.report.stop_reason = Some(stop_reason.to_string());
        info!(
            campaign_id = %campaign.id,
            pages = selection.report.pages,
            selected = selection.leads.len(),
            skipped = selection.report.skipped,
            stop_reason,
            "full scan finished"
        );
    }

    /// Applies the re-check window to a page's new leads with one store lookup.
    async fn filter_due(
        &self,
        leads: Vec<EnrolledLead>,
        now: DateTime<Utc>,
        selection: &mut CampaignSelection,
    ) -> Vec<EnrolledLead> {
        if self.config.force_recheck || leads.is_empty() {
            return leads;
        }
        let ids: Vec<String> = leads.iter().map(|l| l.id.clone()).collect();
        let checks = match self.store.last_drain_checks(&ids).await {
            Ok(checks) => checks,
            Err(err) => {
                warn!(error = %err, "re-check lookup failed, evaluating the whole page");
                selection.errors.push(format!("re-check lookup failed: {err}"));
                return leads;
            }
        };

        let recheck_after = self.config.recheck_after();
        let total = leads.len();
        let due: Vec<EnrolledLead> = leads
            .into_iter()
            .filter(|lead| {
                let last = checks.get(&lead.id).copied().flatten();
                is_due_for_check(last, now, recheck_after)
            })
            .collect();
        selection.report.skipped += total - due.len();
        due
    }

    /// Fetches one page, retrying transient failures with backoff.
    async fn fetch_page(
        &self,
        campaign_id: &str,
        cursor: Option<&str>,
        now: DateTime<Utc>,
        limiter: &mut AdaptiveRateLimiter,
    ) -> Result<LeadPage> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            limiter.wait().await;
            match self
                .api
                .list_leads(campaign_id, self.config.page_size, cursor)
                .await
            {
                Ok(page) => {
                    limiter.record(CallOutcome::Success);
                    self.metrics.record_page(campaign_id);
                    self.metrics.set_rate_limit_delay(limiter.current_delay());
                    return Ok(page);
                }
                Err(err) => {
                    limiter.record(call_outcome(&err));
                    self.metrics.set_rate_limit_delay(limiter.current_delay());
                    if !err.is_retryable() || attempt >= self.config.page_fetch_attempts {
                        warn!(campaign_id, attempt, error = %err, "page fetch failed, abandoning campaign for this run");
                        let letter = DeadLetter::new(
                            DeadLetterPhase::ListLeads,
                            now,
                            format!("page fetch failed after {attempt} attempts: {err}"),
                            json!({
                                "campaign_id": campaign_id,
                                "cursor": cursor,
                                "page_size": self.config.page_size,
                                "attempts": attempt,
                            }),
                        )
                        .with_http_status(err.http_status());
                        self.dead_letter(letter).await;
                        return Err(err);
                    }
                    self.metrics.record_retry("list_leads");
                    let backoff = self
                        .config
                        .page_retry_backoff
                        .saturating_mul(2_u32.saturating_pow(attempt - 1));
                    debug!(campaign_id, attempt, error = %err, "page fetch failed, retrying");
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }
}

impl TargetingSelector<'_> {
    /// Dry runs write nothing, dead letters included.
    async fn dead_letter(&self, letter: DeadLetter) {
        if !self.config.dry_run {
            write_dead_letter_best_effort(self.store, letter).await;
        }
    }
}

fn call_outcome(err: &crate::error::Error) -> CallOutcome {
    if err.is_rate_limited() {
        CallOutcome::RateLimited
    } else {
        CallOutcome::Failure
    }
}

const fn walk_end_label(end: WalkEnd) -> &'static str {
    match end {
        WalkEnd::AllFound => "all_found",
        WalkEnd::Exhausted => "end_of_campaign",
        WalkEnd::PageCap => "page_cap",
        WalkEnd::Stuck => "duplicate_pages",
        WalkEnd::Abandoned => "abandoned",
    }
}
