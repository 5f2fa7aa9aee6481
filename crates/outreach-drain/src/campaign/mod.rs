//! Campaign platform API.
//!
//! [`CampaignApi`] is the seam between the drain engine and the sending
//! platform. Implementations make a single attempt per call; pacing and
//! retries belong to the caller, which owns the shared rate limiter.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use outreach_core::lead::EnrolledLead;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rate_limit::CallOutcome;

pub use http::HttpCampaignApi;
pub use memory::InMemoryCampaignApi;

/// A record on a list page that could not be turned into a lead.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRecord {
    /// Lead id, if the record had one.
    pub lead_id: Option<String>,
    /// Why it was rejected.
    pub error: String,
    /// The raw record.
    pub raw: serde_json::Value,
}

/// One page of a campaign's enrolled leads.
#[derive(Debug, Clone, Default)]
pub struct LeadPage {
    /// Leads parsed successfully, in platform order.
    pub leads: Vec<EnrolledLead>,
    /// Records rejected at the boundary.
    pub malformed: Vec<MalformedRecord>,
    /// Cursor for the next page; `None` at the end of the campaign.
    pub next_cursor: Option<String>,
}

impl LeadPage {
    /// Number of records on the page, parsed or not.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.leads.len() + self.malformed.len()
    }

    /// Returns true if the page holds no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }
}

/// Result of a single delete attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DeletionOutcome {
    /// 2xx.
    Success,
    /// 404; the lead is already gone.
    NotFound,
    /// 429.
    RateLimited,
    /// Any other 4xx.
    ClientError {
        /// HTTP status.
        status: u16,
    },
    /// 5xx, timeout, or transport failure.
    ServerError {
        /// HTTP status, absent for timeouts and transport failures.
        status: Option<u16>,
    },
}

impl DeletionOutcome {
    /// Maps an HTTP status from a delete response.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            404 => Self::NotFound,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError {
                status: Some(status),
            },
            _ => Self::ClientError { status },
        }
    }

    /// Returns true if the lead is gone from the platform.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::NotFound)
    }

    /// Returns true if the attempt may be retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::ServerError { .. })
    }

    /// HTTP status, where one applies.
    #[must_use]
    pub const fn http_status(self) -> Option<u16> {
        match self {
            Self::Success => Some(200),
            Self::NotFound => Some(404),
            Self::RateLimited => Some(429),
            Self::ClientError { status } => Some(status),
            Self::ServerError { status } => status,
        }
    }

    /// How the rate limiter should see this attempt.
    #[must_use]
    pub const fn call_outcome(self) -> CallOutcome {
        match self {
            Self::Success | Self::NotFound => CallOutcome::Success,
            Self::RateLimited => CallOutcome::RateLimited,
            Self::ClientError { .. } | Self::ServerError { .. } => CallOutcome::Failure,
        }
    }

    /// Short label used in metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::ClientError { .. } => "client_error",
            Self::ServerError { .. } => "server_error",
        }
    }
}

/// Operations the drain engine needs from the campaign platform.
#[async_trait]
pub trait CampaignApi: Send + Sync {
    /// Fetches one page of a campaign's leads.
    ///
    /// Individual records that fail validation are returned in
    /// [`LeadPage::malformed`] instead of failing the page.
    ///
    /// # Errors
    ///
    /// Returns an API error for non-success responses and transport failures.
    async fn list_leads(
        &self,
        campaign_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<LeadPage>;

    /// Fetches a single lead by id. Returns `Ok(None)` when the platform answers 404.
    ///
    /// # Errors
    ///
    /// Returns an API error for any other failure.
    async fn get_lead(&self, lead_id: &str) -> Result<Option<EnrolledLead>>;

    /// Attempts to delete a lead once. Never fails; every result is an outcome.
    async fn delete_lead(&self, lead_id: &str) -> DeletionOutcome;

    /// Verifies connectivity and credentials.
    ///
    /// # Errors
    ///
    /// Returns the error of the probe call.
    async fn probe(&self, campaign_id: &str) -> Result<()> {
        self.list_leads(campaign_id, 1, None).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_outcome_mapping() {
        assert_eq!(DeletionOutcome::from_status(204), DeletionOutcome::Success);
        assert_eq!(DeletionOutcome::from_status(404), DeletionOutcome::NotFound);
        assert_eq!(DeletionOutcome::from_status(429), DeletionOutcome::RateLimited);
        assert_eq!(
            DeletionOutcome::from_status(422),
            DeletionOutcome::ClientError { status: 422 }
        );
        assert_eq!(
            DeletionOutcome::from_status(503),
            DeletionOutcome::ServerError { status: Some(503) }
        );
    }

    #[test]
    fn only_transient_outcomes_retry() {
        assert!(DeletionOutcome::RateLimited.is_retryable());
        assert!(DeletionOutcome::ServerError { status: None }.is_retryable());
        for status in [400, 401, 403, 422] {
            assert!(!DeletionOutcome::from_status(status).is_retryable());
        }
        assert!(DeletionOutcome::NotFound.is_success());
        assert!(!DeletionOutcome::NotFound.is_retryable());
    }
}
