//! # outreach-drain
//!
//! Drain engine for cold-outreach campaigns: decides which enrolled leads have
//! reached a terminal outcome, records that outcome, and removes them from the
//! sending platform.
//!
//! ## Components
//!
//! - **Classifier**: pure, priority-ordered rules from lead to [`verdict::DrainVerdict`]
//! - **Targeting**: tracked leads due for a check, or a full campaign scan
//! - **Synchronizer**: status rows, history, and do-not-contact entries
//! - **Deletion**: batched deletes with retries and a circuit breaker
//! - **Orchestrator**: runs all of the above and returns a [`report::DrainReport`]
//!
//! ## Guarantees
//!
//! - **Fail-closed**: a lead that cannot be evaluated is kept
//! - **Idempotent**: deletes treat 404 as success; state writes are upserts
//! - **Bounded**: page caps, lead caps, and the breaker limit every run
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use outreach_drain::prelude::*;
//!
//! # async fn demo() -> Result<()> {
//! let api = Arc::new(InMemoryCampaignApi::new());
//! let store = Arc::new(InMemoryStateStore::new());
//! let config = DrainConfig::new(vec![CampaignTarget::new("c-1", "SMB")])
//!     .with_dry_run(true)
//!     .without_delays();
//!
//! let orchestrator = DrainOrchestrator::new(config, api, store)?;
//! orchestrator.preflight().await?;
//! let report = orchestrator.run().await;
//! assert_eq!(report.to_drain, 0);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod campaign;
pub mod classifier;
pub mod config;
pub mod deletion;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod rate_limit;
pub mod report;
pub mod selector;
pub mod store;
pub mod sync;
pub mod verdict;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::campaign::{
        CampaignApi, DeletionOutcome, HttpCampaignApi, InMemoryCampaignApi, LeadPage,
    };
    pub use crate::classifier::LeadClassifier;
    pub use crate::config::{
        BigQueryConfig, CampaignApiConfig, CampaignTarget, ClassifierConfig, DeletionConfig,
        DrainConfig, RateLimitConfig, UnsubscribeSignal,
    };
    pub use crate::deletion::{CircuitBreaker, DeletionExecutor};
    pub use crate::error::{ApiErrorKind, Error, Result};
    pub use crate::metrics::DrainMetrics;
    pub use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
    pub use crate::orchestrator::DrainOrchestrator;
    pub use crate::rate_limit::{AdaptiveRateLimiter, CallOutcome};
    pub use crate::report::{BreakerState, DeletionSummary, DrainReport, TargetingPath};
    pub use crate::selector::{TargetingPlan, TargetingSelector};
    pub use crate::store::{
        BigQueryStateStore, DeadLetter, DeadLetterPhase, InMemoryStateStore, StateStore,
    };
    pub use crate::sync::{StateSynchronizer, SyncResult};
    pub use crate::verdict::{DrainVerdict, DrainedLead, ReasonCode};
}
