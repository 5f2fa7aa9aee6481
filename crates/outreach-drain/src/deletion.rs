//! Batched lead deletion with per-item retries and a circuit breaker.
//!
//! Leads are deleted in batches of `batch_size`, with a pause between items
//! and a longer pause between batches. Either pause stretches to the adaptive
//! limiter delay when the platform has been pushing back.
//!
//! Each lead is retried on 429 and 5xx with exponential backoff. A 404 counts
//! as success: the lead is already gone, which is the goal.
//!
//! ## Circuit breaker
//!
//! Final per-lead outcomes feed a sliding window. The breaker opens when
//!
//! - the window is full and the share of failures exceeds `breaker_failure_ratio`
//! - `breaker_consecutive_rate_limits` leads in a row ended rate-limited
//!
//! Once open, no further deletes are attempted this run. Leads left over are
//! reported as not processed and picked up by a later run.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::campaign::{CampaignApi, DeletionOutcome};
use crate::config::DeletionConfig;
use crate::metrics::DrainMetrics;
use crate::rate_limit::AdaptiveRateLimiter;
use crate::report::{BreakerState, DeletionFailure, DeletionSummary, TripReason};
use crate::store::{write_dead_letter_best_effort, DeadLetter, DeadLetterPhase, StateStore};
use crate::sync::{StateSynchronizer, SyncResult};
use crate::verdict::DrainedLead;

/// Halts deletions when the platform is clearly unhealthy.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    window: usize,
    failure_ratio: f64,
    max_consecutive_rate_limits: u32,
    recent: VecDeque<bool>,
    consecutive_rate_limits: u32,
    tripped: Option<TripReason>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(config: &DeletionConfig) -> Self {
        Self {
            window: config.breaker_window.max(1),
            failure_ratio: config.breaker_failure_ratio,
            max_consecutive_rate_limits: config.breaker_consecutive_rate_limits.max(1),
            recent: VecDeque::with_capacity(config.breaker_window.max(1)),
            consecutive_rate_limits: 0,
            tripped: None,
        }
    }

    /// Records a lead's final outcome. Returns the trip reason if this outcome
    /// opened the breaker.
    pub fn record(&mut self, outcome: DeletionOutcome) -> Option<TripReason> {
        if self.tripped.is_some() {
            return None;
        }

        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(!outcome.is_success());

        if outcome == DeletionOutcome::RateLimited {
            self.consecutive_rate_limits += 1;
        } else {
            self.consecutive_rate_limits = 0;
        }

        let reason = if self.consecutive_rate_limits >= self.max_consecutive_rate_limits {
            Some(TripReason::ConsecutiveRateLimits {
                count: self.consecutive_rate_limits,
            })
        } else if self.recent.len() == self.window {
            let failures = self.recent.iter().filter(|failed| **failed).count();
            #[allow(clippy::cast_precision_loss)]
            let ratio = failures as f64 / self.window as f64;
            (ratio > self.failure_ratio).then_some(TripReason::FailureRatio {
                failures,
                window: self.window,
            })
        } else {
            None
        };

        self.tripped = reason;
        reason
    }

    /// Current position.
    #[must_use]
    pub const fn state(&self) -> BreakerState {
        if self.tripped.is_some() {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    /// Why the breaker opened, if it did.
    #[must_use]
    pub const fn trip_reason(&self) -> Option<TripReason> {
        self.tripped
    }
}

/// Deletes drained leads from the platform and records the results.
pub struct DeletionExecutor<'a> {
    api: &'a dyn CampaignApi,
    store: &'a dyn StateStore,
    config: &'a DeletionConfig,
    dry_run: bool,
    metrics: DrainMetrics,
}

impl<'a> DeletionExecutor<'a> {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        api: &'a dyn CampaignApi,
        store: &'a dyn StateStore,
        config: &'a DeletionConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            api,
            store,
            config,
            dry_run,
            metrics: DrainMetrics::new(),
        }
    }

    /// Deletes `leads` in batches.
    ///
    /// After each batch, deleted leads are synced to the state store and
    /// failures are recorded there. In dry-run mode nothing is deleted.
    pub async fn execute(
        &self,
        leads: &[DrainedLead],
        limiter: &mut AdaptiveRateLimiter,
        now: DateTime<Utc>,
    ) -> (DeletionSummary, SyncResult) {
        let mut summary = DeletionSummary {
            requested: leads.len(),
            ..DeletionSummary::default()
        };
        let mut sync_result = SyncResult::default();
        if leads.is_empty() {
            return (summary, sync_result);
        }
        if self.dry_run {
            info!(leads = leads.len(), "dry run, skipping deletions");
            return (summary, sync_result);
        }

        let synchronizer = StateSynchronizer::new(self.store, false);
        let mut breaker = CircuitBreaker::new(self.config);
        let batch_size = self.config.batch_size.max(1);
        let batch_count = leads.len().div_ceil(batch_size);

        'batches: for (batch_index, batch) in leads.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                pause(self.config.batch_delay, limiter).await;
            }
            debug!(batch = batch_index + 1, batch_count, size = batch.len(), "deleting batch");

            let mut deleted: Vec<DrainedLead> = Vec::new();
            let mut failed_ids: Vec<String> = Vec::new();
            let mut halted = false;

            for (item_index, lead) in batch.iter().enumerate() {
                if item_index > 0 {
                    pause(self.config.item_delay, limiter).await;
                }

                let (outcome, attempts) = self.delete_with_retries(lead, limiter).await;
                summary.attempted += 1;
                self.metrics.record_deletion(outcome.as_str());
                self.metrics.set_rate_limit_delay(limiter.current_delay());

                if outcome.is_success() {
                    summary.succeeded += 1;
                    if outcome == DeletionOutcome::NotFound {
                        summary.already_gone += 1;
                    }
                    deleted.push(lead.clone());
                } else {
                    summary.failed += 1;
                    failed_ids.push(lead.lead_id.clone());
                    summary.failures.push(DeletionFailure {
                        lead_id: lead.lead_id.clone(),
                        email: lead.email.clone(),
                        outcome,
                        attempts,
                    });
                    warn!(
                        lead_id = %lead.lead_id,
                        email = %lead.email,
                        outcome = outcome.as_str(),
                        attempts,
                        "lead deletion failed"
                    );
                    let letter = DeadLetter::new(
                        DeadLetterPhase::DrainDelete,
                        now,
                        format!("delete failed: {} after {attempts} attempts", outcome.as_str()),
                        json!({
                            "lead_id": lead.lead_id,
                            "campaign_id": lead.campaign_id,
                            "reason": lead.reason,
                            "attempts": attempts,
                        }),
                    )
                    .with_email(lead.email.clone())
                    .with_http_status(outcome.http_status());
                    write_dead_letter_best_effort(self.store, letter).await;
                }

                if let Some(reason) = breaker.record(outcome) {
                    error!(%reason, "circuit breaker opened, halting deletions");
                    self.metrics.record_breaker_trip(reason.as_str());
                    halted = true;
                    break;
                }
            }

            sync_result.merge(synchronizer.sync(&deleted, true, now).await);
            if !failed_ids.is_empty() {
                if let Err(err) = self.store.record_deletion_failures(&failed_ids, now).await {
                    error!(leads = failed_ids.len(), error = %err, "failed to record deletion failures");
                    self.metrics.record_sync_failure("record_deletion_failures");
                    sync_result.failures += 1;
                    sync_result
                        .errors
                        .push(format!("record_deletion_failures: {err}"));
                }
            }

            if halted {
                break 'batches;
            }
        }

        summary.not_processed = summary.requested - summary.attempted;
        summary.breaker_state = breaker.state();
        summary.trip_reason = breaker.trip_reason();
        info!(
            requested = summary.requested,
            succeeded = summary.succeeded,
            already_gone = summary.already_gone,
            failed = summary.failed,
            not_processed = summary.not_processed,
            "deletion phase finished"
        );
        (summary, sync_result)
    }

    async fn delete_with_retries(
        &self,
        lead: &DrainedLead,
        limiter: &mut AdaptiveRateLimiter,
    ) -> (DeletionOutcome, u32) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = self.api.delete_lead(&lead.lead_id).await;
            limiter.record(outcome.call_outcome());
            if !outcome.is_retryable() || attempts > self.config.max_retries {
                return (outcome, attempts);
            }
            self.metrics.record_retry("delete_lead");
            let backoff = self.config.backoff_for(attempts).max(limiter.current_delay());
            debug!(
                lead_id = %lead.lead_id,
                attempt = attempts,
                outcome = outcome.as_str(),
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "retrying delete"
            );
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn pause(configured: Duration, limiter: &AdaptiveRateLimiter) {
    let delay = configured.max(limiter.current_delay());
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::InMemoryCampaignApi;
    use crate::config::{DrainConfig, RateLimitConfig};
    use crate::store::InMemoryStateStore;
    use crate::verdict::ReasonCode;

    fn deletion_config() -> DeletionConfig {
        DrainConfig::new(Vec::new()).without_delays().deletion
    }

    fn drained(id: &str) -> DrainedLead {
        DrainedLead {
            lead_id: id.into(),
            email: format!("{id}@example.com"),
            campaign_id: "c1".into(),
            reason: ReasonCode::Completed,
        }
    }

    fn limiter() -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(RateLimitConfig::immediate())
    }

    #[test]
    fn breaker_needs_a_full_window() {
        let mut breaker = CircuitBreaker::new(&deletion_config());
        for _ in 0..9 {
            assert!(breaker
                .record(DeletionOutcome::ClientError { status: 400 })
                .is_none());
        }
        assert_eq!(
            breaker.record(DeletionOutcome::ClientError { status: 400 }),
            Some(TripReason::FailureRatio {
                failures: 10,
                window: 10
            })
        );
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn breaker_ratio_is_strict() {
        let mut breaker = CircuitBreaker::new(&deletion_config());
        breaker.record(DeletionOutcome::Success);
        breaker.record(DeletionOutcome::NotFound);
        for _ in 0..8 {
            assert!(breaker
                .record(DeletionOutcome::ServerError { status: Some(500) })
                .is_none());
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_trips_on_rate_limit_streak() {
        let mut breaker = CircuitBreaker::new(&deletion_config());
        breaker.record(DeletionOutcome::RateLimited);
        breaker.record(DeletionOutcome::Success);
        breaker.record(DeletionOutcome::RateLimited);
        breaker.record(DeletionOutcome::RateLimited);
        assert_eq!(
            breaker.record(DeletionOutcome::RateLimited),
            Some(TripReason::ConsecutiveRateLimits { count: 3 })
        );
    }

    #[tokio::test]
    async fn deletes_and_syncs_each_batch() {
        let api = InMemoryCampaignApi::new();
        let store = InMemoryStateStore::new();
        let config = deletion_config();
        let leads: Vec<_> = (0..7).map(|i| drained(&format!("l{i}"))).collect();
        api.script_deletes("l0", [DeletionOutcome::Success]).unwrap();
        let executor = DeletionExecutor::new(&api, &store, &config, false);

        let (summary, sync) = executor.execute(&leads, &mut limiter(), Utc::now()).await;
        assert_eq!(summary.attempted, 7);
        assert_eq!(summary.succeeded, 7);
        assert_eq!(summary.already_gone, 6);
        assert_eq!(summary.breaker_state, BreakerState::Closed);
        assert_eq!(sync.upserted, 7);
        assert_eq!(sync.history, 7);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let api = InMemoryCampaignApi::new();
        let store = InMemoryStateStore::new();
        let config = deletion_config();
        api.script_deletes(
            "l0",
            [
                DeletionOutcome::RateLimited,
                DeletionOutcome::ServerError { status: Some(502) },
                DeletionOutcome::Success,
            ],
        )
        .unwrap();
        let executor = DeletionExecutor::new(&api, &store, &config, false);
        let (summary, _) = executor
            .execute(&[drained("l0")], &mut limiter(), Utc::now())
            .await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(api.delete_calls(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let api = InMemoryCampaignApi::new();
        let store = InMemoryStateStore::new();
        let config = deletion_config();
        api.set_default_delete(DeletionOutcome::ClientError { status: 400 })
            .unwrap();
        let executor = DeletionExecutor::new(&api, &store, &config, false);
        let (summary, _) = executor
            .execute(&[drained("l0")], &mut limiter(), Utc::now())
            .await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].attempts, 1);
        assert_eq!(api.delete_calls(), 1);
        let letters = store.dead_letters().unwrap();
        assert_eq!(letters[0].phase, DeadLetterPhase::DrainDelete);
        assert_eq!(letters[0].http_status, Some(400));
    }

    #[tokio::test]
    async fn dry_run_deletes_nothing() {
        let api = InMemoryCampaignApi::new();
        let store = InMemoryStateStore::new();
        let config = deletion_config();
        let executor = DeletionExecutor::new(&api, &store, &config, true);
        let (summary, _) = executor
            .execute(&[drained("l0")], &mut limiter(), Utc::now())
            .await;
        assert_eq!(summary.requested, 1);
        assert_eq!(summary.attempted, 0);
        assert_eq!(api.delete_calls(), 0);
    }
}
