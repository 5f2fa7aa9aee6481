//! Top-level drain driver.
//!
//! One run: choose targets, walk each campaign, classify every selected lead,
//! stamp the re-check window, record missing leads, then delete what should
//! be drained. Per-lead and per-batch failures are absorbed into the
//! [`DrainReport`]; only [`DrainOrchestrator::preflight`] can fail.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use outreach_core::id::DrainRunId;
use outreach_core::observability::{campaign_span, drain_span};
use tracing::{debug, info, warn, Instrument};

use crate::campaign::CampaignApi;
use crate::classifier::LeadClassifier;
use crate::config::DrainConfig;
use crate::deletion::DeletionExecutor;
use crate::error::Result;
use crate::metrics::DrainMetrics;
use crate::rate_limit::AdaptiveRateLimiter;
use crate::report::DrainReport;
use crate::selector::{CampaignSelection, TargetingSelector};
use crate::store::StateStore;
use crate::sync::StateSynchronizer;
use crate::verdict::{DrainedLead, ReasonCode};

/// Drives drain runs over a set of campaigns.
pub struct DrainOrchestrator {
    config: DrainConfig,
    api: Arc<dyn CampaignApi>,
    store: Arc<dyn StateStore>,
    classifier: LeadClassifier,
    metrics: DrainMetrics,
}

impl DrainOrchestrator {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: DrainConfig,
        api: Arc<dyn CampaignApi>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate()?;
        let classifier = LeadClassifier::new(config.classifier.clone());
        Ok(Self {
            config,
            api,
            store,
            classifier,
            metrics: DrainMetrics::new(),
        })
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    /// Checks connectivity to both collaborators before a run.
    ///
    /// # Errors
    ///
    /// Returns the first probe failure.
    pub async fn preflight(&self) -> Result<()> {
        self.store.probe().await?;
        if let Some(first) = self.config.campaigns.first() {
            self.api.probe(&first.id).await?;
        }
        Ok(())
    }

    /// Runs one drain pass now.
    pub async fn run(&self) -> DrainReport {
        self.run_at(Utc::now()).await
    }

    /// Runs one drain pass with `now` as the reference time.
    pub async fn run_at(&self, now: DateTime<Utc>) -> DrainReport {
        let run_id = DrainRunId::generate();
        let span = drain_span(&run_id.to_string(), "drain");
        self.drain(run_id, now).instrument(span).await
    }

    async fn drain(&self, run_id: DrainRunId, now: DateTime<Utc>) -> DrainReport {
        let started = Instant::now();
        let config = &self.config;
        let mut report = DrainReport::new(run_id, now, config.dry_run);
        report.force_recheck = config.force_recheck;
        info!(
            campaigns = config.campaigns.len(),
            dry_run = config.dry_run,
            force_recheck = config.force_recheck,
            "drain run starting"
        );

        let mut limiter = AdaptiveRateLimiter::new(config.rate_limit.clone());
        let selector = TargetingSelector::new(self.api.as_ref(), self.store.as_ref(), config);
        let plan = selector.plan(now).await;
        report.targeting = plan.path;
        if let Some(reason) = &plan.fallback_reason {
            debug!(reason = %reason, "using full scan");
        }

        let mut to_drain: Vec<DrainedLead> = Vec::new();
        let mut missing: Vec<DrainedLead> = Vec::new();
        let mut queued: HashSet<String> = HashSet::new();
        let run_label = report.run_id.to_string();

        for campaign in &config.campaigns {
            let budget = config
                .max_leads_to_evaluate
                .map(|cap| cap.saturating_sub(report.analyzed));
            let span = campaign_span(&run_label, &campaign.id, &campaign.name);
            let selection = selector
                .select(&plan, campaign, now, &mut limiter, budget)
                .instrument(span.clone())
                .await;
            self.evaluate(selection, now, &mut report, &mut to_drain, &mut missing, &mut queued)
                .instrument(span)
                .await;
        }

        if !missing.is_empty() {
            let synced = StateSynchronizer::new(self.store.as_ref(), config.dry_run)
                .sync(&missing, false, now)
                .await;
            report.sync_failures += synced.failures;
            report.errors.extend(synced.errors);
        }

        report.to_drain = to_drain.len();
        info!(
            analyzed = report.analyzed,
            to_drain = report.to_drain,
            missing = report.missing,
            "evaluation finished"
        );

        let executor = DeletionExecutor::new(
            self.api.as_ref(),
            self.store.as_ref(),
            &config.deletion,
            config.dry_run,
        );
        let (deletion, synced) = executor
            .execute(&to_drain, &mut limiter, now)
            .instrument(drain_span(&run_label, "delete"))
            .await;
        report.deletion = deletion;
        report.sync_failures += synced.failures;
        report.errors.extend(synced.errors);

        let elapsed = started.elapsed();
        report.finish(now + chrono::Duration::from_std(elapsed).unwrap_or_default());
        self.metrics
            .observe_run_duration(report.targeting.as_str(), elapsed);
        self.metrics.set_rate_limit_delay(limiter.current_delay());
        info!(
            deleted = report.deletion.succeeded,
            failed = report.deletion.failed,
            not_processed = report.deletion.not_processed,
            partial = report.is_partial(),
            duration_ms = report.duration_ms,
            "drain run finished"
        );
        report
    }

    /// Classifies one campaign's selection and stamps its re-check window.
    async fn evaluate(
        &self,
        selection: CampaignSelection,
        now: DateTime<Utc>,
        report: &mut DrainReport,
        to_drain: &mut Vec<DrainedLead>,
        missing: &mut Vec<DrainedLead>,
        queued: &mut HashSet<String>,
    ) {
        let CampaignSelection {
            leads,
            missing: gone,
            unresolved,
            api_errors,
            errors,
            report: mut campaign_report,
        } = selection;

        let mut checked: Vec<String> = Vec::with_capacity(leads.len() + gone.len());
        for lead in &leads {
            let verdict = self.classifier.classify(lead, now);
            report.count_reason(verdict.reason);
            self.metrics.record_classification(verdict.reason.as_str());
            debug!(
                lead_id = %lead.id,
                email = %lead.email,
                reason = %verdict.reason,
                drain = verdict.should_drain,
                detail = %verdict.detail,
                "classified lead"
            );
            if verdict.should_drain && queued.insert(lead.id.clone()) {
                to_drain.push(DrainedLead::from_lead(lead, verdict.reason));
            }
            checked.push(lead.id.clone());
        }

        for candidate in gone {
            report.count_reason(ReasonCode::Missing);
            self.metrics.record_classification(ReasonCode::Missing.as_str());
            report.missing += 1;
            checked.push(candidate.platform_lead_id.clone());
            missing.push(DrainedLead {
                lead_id: candidate.platform_lead_id,
                email: candidate.email,
                campaign_id: candidate.campaign_id,
                reason: ReasonCode::Missing,
            });
        }

        campaign_report.evaluated = leads.len();
        report.analyzed += leads.len();
        report.skipped_recently_checked += campaign_report.skipped;
        report.unresolved += unresolved.len();
        report.api_errors += api_errors;
        report.errors.extend(errors);

        if !self.config.dry_run && !checked.is_empty() {
            match self.store.touch_drain_checks(&checked, now).await {
                Ok(touched) => debug!(touched, "stamped drain checks"),
                Err(err) => {
                    warn!(leads = checked.len(), error = %err, "failed to stamp drain checks");
                    self.metrics.record_sync_failure("touch_drain_checks");
                    report.sync_failures += 1;
                    report.errors.push(format!(
                        "campaign {}: touch_drain_checks: {err}",
                        campaign_report.campaign_id
                    ));
                }
            }
        }

        info!(
            evaluated = campaign_report.evaluated,
            skipped = campaign_report.skipped,
            pages = campaign_report.pages,
            abandoned = campaign_report.abandoned,
            "campaign evaluated"
        );
        report.campaigns.push(campaign_report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::InMemoryCampaignApi;
    use crate::config::CampaignTarget;
    use crate::store::InMemoryStateStore;

    #[test]
    fn rejects_invalid_config() {
        let api: Arc<dyn CampaignApi> = Arc::new(InMemoryCampaignApi::new());
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let config = DrainConfig::new(vec![CampaignTarget::new("c1", "SMB")]).with_page_size(0);
        assert!(DrainOrchestrator::new(config, api, store).is_err());
    }

    #[tokio::test]
    async fn empty_campaign_produces_empty_report() {
        let api: Arc<dyn CampaignApi> = Arc::new(InMemoryCampaignApi::new());
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let config = DrainConfig::new(vec![CampaignTarget::new("c1", "SMB")]).without_delays();
        let orchestrator = DrainOrchestrator::new(config, api, store).unwrap();
        orchestrator.preflight().await.unwrap();
        let report = orchestrator.run().await;
        assert_eq!(report.analyzed, 0);
        assert_eq!(report.to_drain, 0);
        assert_eq!(report.campaigns.len(), 1);
        assert_eq!(report.campaigns[0].stop_reason.as_deref(), Some("empty_page"));
    }
}
