//! Drain command - run one drain pass over the configured campaigns.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Args};
use owo_colors::OwoColorize;
use tracing::warn;

use outreach_drain::campaign::HttpCampaignApi;
use outreach_drain::config::{BigQueryConfig, CampaignApiConfig, CampaignTarget, DrainConfig};
use outreach_drain::notify::{notify_best_effort, LogNotifier, WebhookNotifier};
use outreach_drain::orchestrator::DrainOrchestrator;
use outreach_drain::report::{BreakerState, DrainReport};
use outreach_drain::store::bigquery::GcpTokenSource;
use outreach_drain::store::BigQueryStateStore;

use crate::secrets::{resolve_api_key, DEFAULT_SECRETS_FILE};
use crate::OutputFormat;

/// Arguments for the drain command.
#[derive(Debug, Args)]
pub struct DrainArgs {
    /// Campaign platform base URL.
    #[arg(long, env = "OUTREACH_API_URL", default_value = CampaignApiConfig::DEFAULT_BASE_URL)]
    pub api_url: String,

    /// Campaign platform API key.
    #[arg(long, env = "INSTANTLY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Secret file read when no API key is given.
    #[arg(long, env = "OUTREACH_SECRETS_FILE", default_value = DEFAULT_SECRETS_FILE)]
    pub secrets_file: PathBuf,

    /// GCP project holding the state dataset.
    #[arg(long, env = "GCP_PROJECT_ID")]
    pub project_id: String,

    /// BigQuery dataset holding the state tables.
    #[arg(long, env = "BIGQUERY_DATASET", default_value = "outreach")]
    pub dataset: String,

    /// BigQuery API endpoint override (emulators).
    #[arg(long, env = "BIGQUERY_ENDPOINT")]
    pub bigquery_endpoint: Option<String>,

    /// Campaigns to drain, as `name=id` pairs or bare ids.
    #[arg(
        long = "campaign",
        env = "OUTREACH_CAMPAIGNS",
        value_delimiter = ',',
        required = true
    )]
    pub campaigns: Vec<String>,

    /// State rows targeted per run.
    #[arg(long, env = "DRAIN_BATCH_SIZE", default_value = "50")]
    pub batch_size: usize,

    /// Classify and report without writing state or deleting leads.
    #[arg(long, env = "DRY_RUN", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    pub dry_run: bool,

    /// Ignore the re-check window and sweep every campaign.
    #[arg(long = "force", env = "FORCE_DRAIN_CHECK", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    pub force: bool,

    /// Stop evaluating after this many leads (testing cap).
    #[arg(long, env = "MAX_LEADS_TO_EVALUATE")]
    pub max_leads: Option<usize>,

    /// Page cap per campaign walk.
    #[arg(long, env = "MAX_PAGES_TO_PROCESS")]
    pub max_pages: Option<usize>,

    /// Webhook receiving the end-of-run report.
    #[arg(long, env = "OUTREACH_NOTIFY_URL")]
    pub notify_url: Option<String>,
}

/// Parses a `name=id` pair; a bare id is its own name.
///
/// # Errors
///
/// Returns an error if the id is empty.
pub fn parse_campaign(raw: &str) -> Result<CampaignTarget> {
    let (name, id) = match raw.split_once('=') {
        Some((name, id)) => (name.trim(), id.trim()),
        None => (raw.trim(), raw.trim()),
    };
    if id.is_empty() {
        anyhow::bail!("Invalid campaign '{raw}': expected name=id");
    }
    let name = if name.is_empty() { id } else { name };
    Ok(CampaignTarget::new(id, name))
}

/// Builds the engine configuration from command arguments.
///
/// # Errors
///
/// Returns an error if a campaign is malformed or the resulting
/// configuration is invalid.
pub fn build_config(args: &DrainArgs) -> Result<DrainConfig> {
    let campaigns = args
        .campaigns
        .iter()
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| parse_campaign(raw))
        .collect::<Result<Vec<_>>>()?;

    let mut config = DrainConfig::new(campaigns)
        .with_drain_batch_size(args.batch_size)
        .with_max_leads(args.max_leads)
        .with_dry_run(args.dry_run)
        .with_force_recheck(args.force);
    if let Some(pages) = args.max_pages {
        config = config.with_max_pages(pages);
    }
    config.validate().context("Invalid drain configuration")?;
    Ok(config)
}

/// Execute the drain command.
///
/// # Errors
///
/// Returns an error if configuration is invalid, credentials are missing,
/// or the startup connectivity check fails. Errors during the run itself
/// are summarized in the report.
pub async fn execute(args: DrainArgs, format: OutputFormat) -> Result<()> {
    let config = build_config(&args)?;
    let api_key = resolve_api_key(args.api_key.as_deref(), &args.secrets_file)?;

    let api = HttpCampaignApi::new(CampaignApiConfig::new(api_key).with_base_url(&args.api_url))
        .context("Failed to create campaign API client")?;

    let tokens = GcpTokenSource::from_environment()
        .await
        .context("Failed to load GCP credentials")?;
    let mut bigquery = BigQueryConfig::new(&args.project_id, &args.dataset);
    if let Some(endpoint) = &args.bigquery_endpoint {
        bigquery = bigquery.with_endpoint(endpoint);
    }
    let names: HashMap<String, String> = config
        .campaigns
        .iter()
        .map(|c| (c.id.clone(), c.name.clone()))
        .collect();
    let store = BigQueryStateStore::new(bigquery, Arc::new(tokens))
        .context("Failed to create state store")?
        .with_campaign_names(names);

    let orchestrator = DrainOrchestrator::new(config, Arc::new(api), Arc::new(store))?;
    orchestrator
        .preflight()
        .await
        .context("Startup connectivity check failed")?;

    let report = orchestrator.run().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => println!("{}", render_text(&report)),
        OutputFormat::Table => println!("{}", render_table(&report)),
    }

    notify_best_effort(&LogNotifier, &report).await;
    if let Some(url) = &args.notify_url {
        match WebhookNotifier::new(url, Duration::from_secs(10)) {
            Ok(webhook) => notify_best_effort(&webhook, &report).await,
            Err(e) => warn!(error = %e, "webhook notifier unavailable"),
        }
    }

    Ok(())
}

/// Renders the report as colored text.
#[must_use]
pub fn render_text(report: &DrainReport) -> String {
    let mut lines = Vec::new();

    let mode = if report.dry_run { " (dry run)" } else { "" };
    lines.push(format!("Drain run {}{mode}", report.run_id));
    lines.push(format!(
        "Targeting: {}  Duration: {:.1}s",
        report.targeting,
        Duration::from_millis(report.duration_ms).as_secs_f64()
    ));
    lines.push(String::new());

    lines.push(format!(
        "Analyzed {} leads ({} skipped as recently checked)",
        report.analyzed, report.skipped_recently_checked
    ));
    for (reason, count) in &report.by_reason {
        let label = if reason.is_drain() {
            format!("{}", "drain".yellow())
        } else {
            format!("{}", "keep".dimmed())
        };
        lines.push(format!("  {:<24} {count:>6}  {label}", reason.as_str()));
    }
    if report.missing > 0 || report.unresolved > 0 {
        lines.push(format!(
            "  Missing: {}  Unresolved: {}",
            report.missing, report.unresolved
        ));
    }
    lines.push(String::new());

    let deletion = &report.deletion;
    lines.push(format!(
        "Deletions: {}/{} succeeded ({} already gone), {} failed, {} not processed",
        deletion.succeeded,
        deletion.requested,
        deletion.already_gone,
        deletion.failed,
        deletion.not_processed
    ));
    match (deletion.breaker_state, deletion.trip_reason) {
        (BreakerState::Open, Some(reason)) => {
            lines.push(format!("Circuit breaker: {} ({reason})", "OPEN".red()));
        }
        (BreakerState::Open, None) => lines.push(format!("Circuit breaker: {}", "OPEN".red())),
        (BreakerState::Closed, _) => {}
    }
    if report.sync_failures > 0 || report.api_errors > 0 {
        lines.push(format!(
            "Sync failures: {}  API errors: {}",
            report.sync_failures, report.api_errors
        ));
    }

    let status = if report.is_partial() {
        format!("{}", "PARTIAL".yellow())
    } else {
        format!("{}", "COMPLETE".green())
    };
    lines.push(format!("Status: {status}"));

    if !report.errors.is_empty() {
        lines.push(String::new());
        lines.push("Errors:".to_string());
        for error in &report.errors {
            lines.push(format!("  {}", error.red()));
        }
    }

    lines.join("\n")
}

/// Renders the report as reason and campaign tables.
#[must_use]
pub fn render_table(report: &DrainReport) -> String {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct ReasonRow {
        #[tabled(rename = "Reason")]
        reason: String,
        #[tabled(rename = "Count")]
        count: usize,
        #[tabled(rename = "Action")]
        action: &'static str,
    }

    #[derive(Tabled)]
    struct CampaignRow {
        #[tabled(rename = "Campaign")]
        name: String,
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Pages")]
        pages: usize,
        #[tabled(rename = "Evaluated")]
        evaluated: usize,
        #[tabled(rename = "Skipped")]
        skipped: usize,
        #[tabled(rename = "Stop")]
        stop: String,
    }

    let reasons: Vec<_> = report
        .by_reason
        .iter()
        .map(|(reason, count)| ReasonRow {
            reason: reason.to_string(),
            count: *count,
            action: if reason.is_drain() { "drain" } else { "keep" },
        })
        .collect();

    let campaigns: Vec<_> = report
        .campaigns
        .iter()
        .map(|c| CampaignRow {
            name: c.name.clone(),
            id: c.campaign_id.clone(),
            pages: c.pages,
            evaluated: c.evaluated,
            skipped: c.skipped,
            stop: c.stop_reason.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut sections = Vec::new();
    if reasons.is_empty() {
        sections.push("No leads evaluated".to_string());
    } else {
        sections.push(Table::new(reasons).to_string());
    }
    if !campaigns.is_empty() {
        sections.push(Table::new(campaigns).to_string());
    }
    sections.push(format!(
        "Deleted {}/{} (breaker {})",
        report.deletion.succeeded,
        report.deletion.requested,
        match report.deletion.breaker_state {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
        }
    ));
    sections.join("\n\n")
}
