//! End-to-end drain runs over the in-memory platform and state store.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use outreach_core::lead::{DeliveryCode, EnrolledLead, LifecycleStatus};
use outreach_core::state::{DeletionStatus, TrackedLeadState};
use outreach_drain::campaign::{CampaignApi, DeletionOutcome, InMemoryCampaignApi};
use outreach_drain::config::{CampaignTarget, DrainConfig, RateLimitConfig};
use outreach_drain::deletion::DeletionExecutor;
use outreach_drain::orchestrator::DrainOrchestrator;
use outreach_drain::rate_limit::AdaptiveRateLimiter;
use outreach_drain::report::{BreakerState, TargetingPath};
use outreach_drain::selector::TargetingSelector;
use outreach_drain::store::{DeadLetterPhase, InMemoryStateStore, StateStore};
use outreach_drain::verdict::{DrainedLead, ReasonCode};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn lead(id: &str, campaign: &str, status: LifecycleStatus, replies: u32, age_days: i64) -> EnrolledLead {
    EnrolledLead {
        id: id.into(),
        email: format!("{id}@example.com"),
        campaign_id: campaign.into(),
        lifecycle_status: status,
        reply_count: replies,
        delivery_code: DeliveryCode::None,
        created_at: Some(now() - Duration::days(age_days)),
        updated_at: Some(now() - Duration::hours(1)),
        pause_until: None,
        status_text: None,
        status_summary: None,
    }
}

fn config(campaigns: &[&str]) -> DrainConfig {
    DrainConfig::new(
        campaigns
            .iter()
            .map(|id| CampaignTarget::new(*id, format!("{id} sequence")))
            .collect(),
    )
    .with_page_size(3)
    .without_delays()
}

fn orchestrator(
    config: DrainConfig,
    api: &Arc<InMemoryCampaignApi>,
    store: &Arc<InMemoryStateStore>,
) -> DrainOrchestrator {
    let api: Arc<dyn CampaignApi> = api.clone();
    let store: Arc<dyn StateStore> = store.clone();
    DrainOrchestrator::new(config, api, store).expect("orchestrator")
}

fn mixed_campaign(api: &InMemoryCampaignApi) {
    let mut unsubscribed = lead("unsub", "c1", LifecycleStatus::InProgress, 0, 5);
    unsubscribed.status_text = Some("Lead Unsubscribed".into());
    let mut bounced = lead("bounce", "c1", LifecycleStatus::InProgress, 0, 12);
    bounced.delivery_code = DeliveryCode::HardBounce(550);
    api.add_leads([
        lead("replied", "c1", LifecycleStatus::Finished, 2, 10),
        lead("done", "c1", LifecycleStatus::Finished, 0, 20),
        lead("fresh", "c1", LifecycleStatus::InProgress, 0, 4),
        lead("stale", "c1", LifecycleStatus::InProgress, 0, 95),
        unsubscribed,
        bounced,
    ])
    .unwrap();
}

#[tokio::test]
async fn selector_targets_only_never_checked_rows() {
    let api = InMemoryCampaignApi::new();
    let store = InMemoryStateStore::new();
    let mut rows = Vec::new();
    for i in 0..10 {
        let id = format!("l{i}");
        let row = TrackedLeadState::enrolled(format!("{id}@example.com"), "c1", id.clone(), now());
        rows.push(if i < 3 {
            row
        } else {
            row.with_last_drain_check(now() - Duration::hours(1))
        });
        api.add_leads([lead(&id, "c1", LifecycleStatus::InProgress, 0, 3)]).unwrap();
    }
    store.insert_rows(rows).unwrap();

    let config = config(&["c1"]);
    let selector = TargetingSelector::new(&api, &store, &config);
    let plan = selector.plan(now()).await;
    assert_eq!(plan.path, TargetingPath::StateStore);
    assert_eq!(plan.candidate_count(), 3);

    let mut limiter = AdaptiveRateLimiter::new(RateLimitConfig::immediate());
    let selection = selector
        .select(&plan, &config.campaigns[0], now(), &mut limiter, None)
        .await;
    let ids: Vec<_> = selection.leads.iter().map(|l| l.id.as_str()).collect();
    assert_eq!(ids, ["l0", "l1", "l2"]);
}

#[tokio::test]
async fn full_run_drains_and_records_outcomes() {
    let api = Arc::new(InMemoryCampaignApi::new());
    let store = Arc::new(InMemoryStateStore::new());
    mixed_campaign(&api);

    let report = orchestrator(config(&["c1"]), &api, &store).run_at(now()).await;

    assert_eq!(report.targeting, TargetingPath::FullScan);
    assert_eq!(report.analyzed, 6);
    assert_eq!(report.reason_count(ReasonCode::Replied), 1);
    assert_eq!(report.reason_count(ReasonCode::Completed), 1);
    assert_eq!(report.reason_count(ReasonCode::StaleActive), 1);
    assert_eq!(report.reason_count(ReasonCode::Unsubscribed), 1);
    assert_eq!(report.reason_count(ReasonCode::BouncedHard), 1);
    assert_eq!(report.reason_count(ReasonCode::KeptActive), 1);
    assert_eq!(report.to_drain, 5);
    assert_eq!(report.deletion.succeeded, 5);
    assert_eq!(report.deletion.breaker_state, BreakerState::Closed);
    assert!(!report.is_partial());

    assert!(api.contains("fresh").unwrap());
    assert_eq!(api.deleted_ids().unwrap().len(), 5);

    let done = store.get("done@example.com", "c1").unwrap().expect("row");
    assert_eq!(done.status.as_str(), "completed");
    assert_eq!(done.deletion_status, Some(DeletionStatus::Done));
    assert_eq!(store.history().unwrap().len(), 2);
    assert_eq!(store.do_not_contact().unwrap(), ["unsub@example.com"]);
    assert!(store.dead_letters().unwrap().is_empty());
}

#[tokio::test]
async fn targeted_run_records_missing_leads_without_deleting() {
    let api = Arc::new(InMemoryCampaignApi::new());
    let store = Arc::new(InMemoryStateStore::new());
    api.add_leads([lead("done", "c1", LifecycleStatus::Finished, 0, 20)])
        .unwrap();
    store
        .insert_rows([
            TrackedLeadState::enrolled("done@example.com", "c1", "done", now() - Duration::days(20)),
            TrackedLeadState::enrolled("gone@example.com", "c1", "gone", now() - Duration::days(20)),
        ])
        .unwrap();

    let report = orchestrator(config(&["c1"]), &api, &store).run_at(now()).await;

    assert_eq!(report.targeting, TargetingPath::StateStore);
    assert_eq!(report.missing, 1);
    assert_eq!(report.reason_count(ReasonCode::Missing), 1);
    assert_eq!(report.to_drain, 1);
    assert_eq!(api.deleted_ids().unwrap(), ["done"]);

    let gone = store.get("gone@example.com", "c1").unwrap().expect("row");
    assert_eq!(gone.status.as_str(), "missing");
    assert_eq!(gone.last_drain_check_at, Some(now()));
    assert_eq!(gone.deletion_status, None);
}

#[tokio::test]
async fn evaluated_leads_are_not_rechecked_within_the_window() {
    let api = Arc::new(InMemoryCampaignApi::new());
    let store = Arc::new(InMemoryStateStore::new());
    api.add_leads([lead("fresh", "c1", LifecycleStatus::InProgress, 0, 4)])
        .unwrap();
    store
        .insert_rows([TrackedLeadState::enrolled("fresh@example.com", "c1", "fresh", now())])
        .unwrap();
    let orchestrator = orchestrator(config(&["c1"]), &api, &store);

    let first = orchestrator.run_at(now()).await;
    assert_eq!(first.analyzed, 1);

    let second = orchestrator.run_at(now() + Duration::hours(2)).await;
    assert_eq!(second.targeting, TargetingPath::FullScan);
    assert_eq!(second.analyzed, 0);
    assert_eq!(second.skipped_recently_checked, 1);

    let third = orchestrator.run_at(now() + Duration::hours(25)).await;
    assert_eq!(third.targeting, TargetingPath::StateStore);
    assert_eq!(third.analyzed, 1);
}

#[tokio::test]
async fn same_email_in_two_campaigns_is_drained_per_enrollment() {
    let api = Arc::new(InMemoryCampaignApi::new());
    let store = Arc::new(InMemoryStateStore::new());
    let mut first = lead("a1", "c1", LifecycleStatus::Finished, 0, 20);
    first.email = "shared@example.com".into();
    let mut second = lead("a2", "c2", LifecycleStatus::Finished, 0, 20);
    second.email = "shared@example.com".into();
    api.add_leads([first, second]).unwrap();

    let report = orchestrator(config(&["c1", "c2"]), &api, &store).run_at(now()).await;

    assert_eq!(report.to_drain, 2);
    let mut deleted = api.deleted_ids().unwrap();
    deleted.sort();
    assert_eq!(deleted, ["a1", "a2"]);
    assert!(store.get("shared@example.com", "c1").unwrap().is_some());
    assert!(store.get("shared@example.com", "c2").unwrap().is_some());
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let api = Arc::new(InMemoryCampaignApi::new());
    let store = Arc::new(InMemoryStateStore::new());
    mixed_campaign(&api);

    let report = orchestrator(config(&["c1"]).with_dry_run(true), &api, &store)
        .run_at(now())
        .await;

    assert!(report.dry_run);
    assert_eq!(report.to_drain, 5);
    assert_eq!(report.deletion.attempted, 0);
    assert_eq!(api.delete_calls(), 0);
    assert!(store.rows().unwrap().is_empty());
    assert!(store.history().unwrap().is_empty());
    assert!(store.do_not_contact().unwrap().is_empty());
}

#[tokio::test]
async fn max_leads_caps_evaluation_across_campaigns() {
    let api = Arc::new(InMemoryCampaignApi::new());
    let store = Arc::new(InMemoryStateStore::new());
    api.add_leads((0..4).map(|i| lead(&format!("a{i}"), "c1", LifecycleStatus::InProgress, 0, 2)))
        .unwrap();
    api.add_leads((0..4).map(|i| lead(&format!("b{i}"), "c2", LifecycleStatus::InProgress, 0, 2)))
        .unwrap();

    let report = orchestrator(config(&["c1", "c2"]).with_max_leads(Some(5)), &api, &store)
        .run_at(now())
        .await;

    assert_eq!(report.analyzed, 5);
    assert_eq!(report.campaigns[0].evaluated, 4);
    assert_eq!(report.campaigns[1].evaluated, 1);
}

#[tokio::test]
async fn breaker_halts_before_the_eleventh_delete() {
    let api = InMemoryCampaignApi::new();
    let store = InMemoryStateStore::new();
    api.set_default_delete(DeletionOutcome::ClientError { status: 403 })
        .unwrap();
    api.script_deletes("l0", [DeletionOutcome::Success]).unwrap();
    let leads: Vec<_> = (0..15)
        .map(|i| DrainedLead {
            lead_id: format!("l{i}"),
            email: format!("l{i}@example.com"),
            campaign_id: "c1".into(),
            reason: ReasonCode::Completed,
        })
        .collect();
    let config = config(&["c1"]);
    let executor = DeletionExecutor::new(&api, &store, &config.deletion, false);
    let mut limiter = AdaptiveRateLimiter::new(RateLimitConfig::immediate());

    let (summary, _) = executor.execute(&leads, &mut limiter, now()).await;

    assert_eq!(api.delete_calls(), 10);
    assert_eq!(summary.attempted, 10);
    assert_eq!(summary.failed, 9);
    assert_eq!(summary.not_processed, 5);
    assert_eq!(summary.breaker_state, BreakerState::Open);
    assert!(summary.trip_reason.is_some());
    assert_eq!(
        store
            .dead_letters()
            .unwrap()
            .iter()
            .filter(|l| l.phase == DeadLetterPhase::DrainDelete)
            .count(),
        9
    );
}

#[tokio::test]
async fn rate_limit_streak_opens_the_breaker_in_a_run() {
    let api = Arc::new(InMemoryCampaignApi::new());
    let store = Arc::new(InMemoryStateStore::new());
    api.add_leads((0..6).map(|i| lead(&format!("l{i}"), "c1", LifecycleStatus::Finished, 0, 20)))
        .unwrap();
    api.set_default_delete(DeletionOutcome::RateLimited).unwrap();
    store
        .insert_rows((0..6).map(|i| {
            TrackedLeadState::enrolled(format!("l{i}@example.com"), "c1", format!("l{i}"), now())
        }))
        .unwrap();

    let report = orchestrator(config(&["c1"]), &api, &store).run_at(now()).await;

    assert_eq!(report.targeting, TargetingPath::StateStore);
    assert_eq!(report.deletion.attempted, 3);
    assert_eq!(report.deletion.not_processed, 3);
    assert!(report.is_partial());
    // One initial attempt plus two retries per lead.
    assert_eq!(api.delete_calls(), 9);
    let failed: Vec<_> = store
        .rows()
        .unwrap()
        .into_iter()
        .filter(|row| row.deletion_status == Some(DeletionStatus::Failed))
        .collect();
    assert_eq!(failed.len(), 3);
    assert!(failed.iter().all(|row| row.deletion_attempts == 1));
}

#[tokio::test]
async fn deleting_twice_succeeds_both_times() {
    let api = InMemoryCampaignApi::new();
    let store = InMemoryStateStore::new();
    api.add_leads([lead("l0", "c1", LifecycleStatus::Finished, 0, 20)])
        .unwrap();
    let drained = [DrainedLead::from_lead(
        &lead("l0", "c1", LifecycleStatus::Finished, 0, 20),
        ReasonCode::Completed,
    )];
    let config = config(&["c1"]);
    let executor = DeletionExecutor::new(&api, &store, &config.deletion, false);
    let mut limiter = AdaptiveRateLimiter::new(RateLimitConfig::immediate());

    let (first, _) = executor.execute(&drained, &mut limiter, now()).await;
    let (second, _) = executor.execute(&drained, &mut limiter, now()).await;

    assert_eq!(first.succeeded, 1);
    assert_eq!(second.succeeded, 1);
    assert_eq!(second.already_gone, 1);
}

#[tokio::test]
async fn store_outage_is_absorbed_into_the_report() {
    let api = Arc::new(InMemoryCampaignApi::new());
    let store = Arc::new(InMemoryStateStore::new());
    mixed_campaign(&api);
    store.set_fail_reads(true);
    store.set_fail_writes(true);

    let report = orchestrator(config(&["c1"]), &api, &store).run_at(now()).await;

    assert_eq!(report.targeting, TargetingPath::FullScan);
    assert_eq!(report.deletion.succeeded, 5);
    assert!(report.sync_failures > 0);
    assert!(!report.errors.is_empty());
    assert!(store
        .dead_letters()
        .unwrap()
        .iter()
        .any(|l| l.phase == DeadLetterPhase::StateSync));
}

#[tokio::test]
async fn abandoned_campaign_is_dead_lettered() {
    let api = Arc::new(InMemoryCampaignApi::new());
    let store = Arc::new(InMemoryStateStore::new());
    mixed_campaign(&api);
    api.fail_list_calls("c1", 10).unwrap();

    let report = orchestrator(config(&["c1"]), &api, &store).run_at(now()).await;

    assert!(report.campaigns[0].abandoned);
    assert_eq!(report.api_errors, 1);
    assert_eq!(report.to_drain, 0);
    let letters = store.dead_letters().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].phase, DeadLetterPhase::ListLeads);
    assert_eq!(letters[0].payload["campaign_id"], "c1");
}
