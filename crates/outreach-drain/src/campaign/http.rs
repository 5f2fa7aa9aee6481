//! HTTP client for the campaign platform's v2 lead endpoints.
//!
//! - `POST {base}/api/v2/leads/list` with `{ "campaign", "limit", "starting_after" }`
//! - `GET {base}/api/v2/leads/{id}`
//! - `DELETE {base}/api/v2/leads/{id}`
//!
//! Every request carries `Authorization: Bearer <key>` and a fixed timeout.

use std::time::Duration;

use async_trait::async_trait;
use outreach_core::lead::EnrolledLead;
use serde::{Deserialize, Serialize};

use super::{CampaignApi, DeletionOutcome, LeadPage, MalformedRecord};
use crate::config::CampaignApiConfig;
use crate::error::{ApiErrorKind, Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ERROR_BODY_LIMIT: usize = 500;

#[derive(Debug, Serialize)]
struct ListRequest<'a> {
    campaign: &'a str,
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    starting_after: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    next_starting_after: Option<String>,
}

/// Campaign API backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpCampaignApi {
    client: reqwest::Client,
    config: CampaignApiConfig,
}

impl HttpCampaignApi {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is empty or the HTTP client cannot be built.
    pub fn new(config: CampaignApiConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::configuration("campaign API key is empty"));
        }
        reqwest::Url::parse(&config.base_url)
            .map_err(|e| Error::configuration(format!("invalid campaign API URL: {e}")))?;

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.config.api_key)
    }

    async fn error_from_response(resp: reqwest::Response, context: &str) -> Error {
        let status = resp.status().as_u16();
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Error::api_status(status, format!("{context} failed (status={status}): {body}"))
    }
}

#[async_trait]
impl CampaignApi for HttpCampaignApi {
    async fn list_leads(
        &self,
        campaign_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<LeadPage> {
        let resp = self
            .client
            .post(self.url("leads/list"))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .timeout(self.config.read_timeout)
            .json(&ListRequest {
                campaign: campaign_id,
                limit,
                starting_after: cursor,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp, "list leads").await);
        }

        let body: ListResponse = resp.json().await.map_err(|e| {
            Error::api(ApiErrorKind::Decode, format!("invalid list response: {e}"))
        })?;

        let mut page = LeadPage {
            next_cursor: body.next_starting_after.filter(|c| !c.is_empty()),
            ..LeadPage::default()
        };
        for raw in body.items {
            match EnrolledLead::from_value(raw.clone(), Some(campaign_id)) {
                Ok(lead) => page.leads.push(lead),
                Err(err) => page.malformed.push(MalformedRecord {
                    lead_id: raw.get("id").and_then(|v| v.as_str()).map(str::to_string),
                    error: err.to_string(),
                    raw,
                }),
            }
        }
        Ok(page)
    }

    async fn get_lead(&self, lead_id: &str) -> Result<Option<EnrolledLead>> {
        let resp = self
            .client
            .get(self.url(&format!("leads/{lead_id}")))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .timeout(self.config.read_timeout)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp, "get lead").await);
        }

        let value: serde_json::Value = resp.json().await.map_err(|e| {
            Error::api(ApiErrorKind::Decode, format!("invalid lead response: {e}"))
        })?;
        let lead = EnrolledLead::from_value(value, None)?;
        Ok(Some(lead))
    }

    async fn delete_lead(&self, lead_id: &str) -> DeletionOutcome {
        let result = self
            .client
            .delete(self.url(&format!("leads/{lead_id}")))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .timeout(self.config.delete_timeout)
            .send()
            .await;

        match result {
            Ok(resp) => {
                let outcome = DeletionOutcome::from_status(resp.status().as_u16());
                if !outcome.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    tracing::debug!(lead_id, status = ?outcome.http_status(), body = %body, "delete rejected");
                }
                outcome
            }
            Err(err) => {
                tracing::debug!(lead_id, error = %err, timeout = err.is_timeout(), "delete request failed");
                DeletionOutcome::ServerError { status: None }
            }
        }
    }
}
