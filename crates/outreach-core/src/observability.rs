//! Observability helpers shared by the outreach binaries.
//!
//! Structured logging with consistent spans: every drain log line carries the
//! run id, and campaign-scoped work carries the campaign id as well.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for scheduled runs).
    Json,
    /// Pretty-printed logs (for local runs).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `outreach_drain=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_target(false))
                    .init();
            }
        }
    });
}

/// Creates a span for one phase of a drain run.
///
/// # Example
///
/// ```rust
/// use outreach_core::observability::drain_span;
///
/// let span = drain_span("01J0000000000000000000000", "evaluate");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn drain_span(run_id: &str, phase: &str) -> Span {
    tracing::info_span!("drain", run_id = run_id, phase = phase)
}

/// Creates a span for campaign-scoped drain work.
#[must_use]
pub fn campaign_span(run_id: &str, campaign_id: &str, campaign_name: &str) -> Span {
    tracing::info_span!(
        "campaign",
        run_id = run_id,
        campaign_id = campaign_id,
        campaign = campaign_name,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = drain_span("run-1", "delete");
        let _guard = span.enter();
        let inner = campaign_span("run-1", "camp-1", "SMB");
        let _inner = inner.enter();
        tracing::info!("inside campaign span");
    }
}
