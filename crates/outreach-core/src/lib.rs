//! # outreach-core
//!
//! Shared primitives for the outreach drain pipeline:
//!
//! - **Lead records**: [`lead::EnrolledLead`], validated once at the API boundary
//! - **Tracking rows**: [`state::TrackedLeadState`] and the re-check window
//! - **Identifiers**: ULID-backed run and dead-letter ids
//! - **Observability**: logging initialisation and span helpers
//!
//! ## Example
//!
//! ```rust
//! use outreach_core::prelude::*;
//! use serde_json::json;
//!
//! let lead = EnrolledLead::from_value(
//!     json!({"id": "l-1", "email": "a@example.com", "status": 1}),
//!     Some("campaign-1"),
//! )
//! .unwrap();
//! assert_eq!(lead.lifecycle_status, LifecycleStatus::InProgress);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lead;
pub mod observability;
pub mod state;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{DeadLetterId, DrainRunId};
    pub use crate::lead::{DeliveryCode, EnrolledLead, LifecycleStatus, RawLead, StatusSummary};
    pub use crate::state::{
        is_due_for_check, DeletionStatus, TrackedKey, TrackedLeadState, TrackedStatus,
    };
}
