//! BigQuery-backed state store.
//!
//! Talks to the BigQuery REST API (`jobs.query` / `jobs.getQueryResults`)
//! with named, typed parameters only; values are never interpolated into SQL.
//! Bulk writes zip parallel `ARRAY<STRING>` parameters by offset so each
//! operation is one round-trip.
//!
//! ## Tables
//!
//! | Table | Use |
//! |-------|-----|
//! | `ops_inst_state` | tracked lead rows, keyed by `(LOWER(email), campaign_id)` |
//! | `ops_lead_history` | append-only cooldown history |
//! | `dnc_list` | permanent do-not-contact list |
//! | `ops_dead_letters` | failed operations |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use outreach_core::lead::parse_timestamp;
use outreach_core::state::TrackedStatus;
use serde::{Deserialize, Serialize};

use super::{DeadLetter, DrainCandidate, StateStore};
use crate::config::BigQueryConfig;
use crate::error::{Error, Result};
use crate::verdict::DrainedLead;

const MAX_POLLS: usize = 20;
const POLL_TIMEOUT_MS: u64 = 10_000;
const DEAD_LETTER_TEXT_LIMIT: usize = 500;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%E6SZ";

/// Supplies OAuth2 access tokens for BigQuery.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// Returns a bearer token valid for the BigQuery scope.
    ///
    /// # Errors
    ///
    /// Returns an error if no token can be obtained.
    async fn access_token(&self) -> Result<String>;
}

/// A fixed token, for tests and local emulators.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wraps a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken([REDACTED])")
    }
}

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[cfg(feature = "gcp")]
pub use gcp::GcpTokenSource;

#[cfg(feature = "gcp")]
mod gcp {
    use std::sync::Arc;

    use async_trait::async_trait;
    use gcp_auth::TokenProvider;

    use super::AccessTokenSource;
    use crate::error::{Error, Result};

    const BIGQUERY_SCOPES: &[&str] = &["https://www.googleapis.com/auth/bigquery"];

    /// Application-default credentials discovered from the environment.
    pub struct GcpTokenSource {
        provider: Arc<dyn TokenProvider>,
    }

    impl GcpTokenSource {
        /// Discovers credentials (service account file, metadata server, gcloud).
        ///
        /// # Errors
        ///
        /// Returns an error if no credentials are available.
        pub async fn from_environment() -> Result<Self> {
            let provider = gcp_auth::provider().await.map_err(|e| {
                Error::configuration(format!("failed to initialize GCP auth: {e}"))
            })?;
            Ok(Self { provider })
        }
    }

    impl std::fmt::Debug for GcpTokenSource {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("GcpTokenSource").finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl AccessTokenSource for GcpTokenSource {
        async fn access_token(&self) -> Result<String> {
            let token = self
                .provider
                .token(BIGQUERY_SCOPES)
                .await
                .map_err(|e| Error::storage(format!("failed to get BigQuery token: {e}")))?;
            Ok(token.as_str().to_string())
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct QueryParameter {
    name: String,
    parameter_type: ParameterType,
    parameter_value: ParameterValue,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ParameterType {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    array_type: Option<Box<ParameterType>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ParameterValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    array_values: Option<Vec<ParameterValue>>,
}

impl QueryParameter {
    fn scalar(name: &str, kind: &'static str, value: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType {
                kind,
                array_type: None,
            },
            parameter_value: ParameterValue {
                value,
                array_values: None,
            },
        }
    }

    fn string(name: &str, value: impl Into<String>) -> Self {
        Self::scalar(name, "STRING", Some(value.into()))
    }

    fn int64(name: &str, value: i64) -> Self {
        Self::scalar(name, "INT64", Some(value.to_string()))
    }

    fn bool(name: &str, value: bool) -> Self {
        Self::scalar(name, "BOOL", Some(value.to_string()))
    }

    fn timestamp(name: &str, value: DateTime<Utc>) -> Self {
        Self::scalar(
            name,
            "TIMESTAMP",
            Some(value.to_rfc3339_opts(SecondsFormat::Micros, true)),
        )
    }

    fn string_array<I, S>(name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType {
                kind: "ARRAY",
                array_type: Some(Box::new(ParameterType {
                    kind: "STRING",
                    array_type: None,
                })),
            },
            parameter_value: ParameterValue {
                value: None,
                array_values: Some(
                    values
                        .into_iter()
                        .map(|v| ParameterValue {
                            value: Some(v.into()),
                            array_values: None,
                        })
                        .collect(),
                ),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: &'a [QueryParameter],
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SchemaField {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct Schema {
    #[serde(default)]
    fields: Vec<SchemaField>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(default)]
    f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    schema: Option<Schema>,
    #[serde(default)]
    rows: Vec<Row>,
    #[serde(default)]
    num_dml_affected_rows: Option<String>,
}

/// Rows of a completed query, addressable by column name.
#[derive(Debug)]
struct ResultSet {
    columns: HashMap<String, usize>,
    rows: Vec<Row>,
    affected: usize,
}

impl ResultSet {
    fn from_response(resp: QueryResponse) -> Self {
        let columns = resp
            .schema
            .unwrap_or_default()
            .fields
            .into_iter()
            .enumerate()
            .map(|(i, f)| (f.name, i))
            .collect();
        let affected = resp
            .num_dml_affected_rows
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        Self {
            columns,
            rows: resp.rows,
            affected,
        }
    }

    fn get<'a>(&self, row: &'a Row, column: &str) -> Option<&'a str> {
        let idx = *self.columns.get(column)?;
        row.f.get(idx)?.v.as_str()
    }

    fn required<'a>(&self, row: &'a Row, column: &str) -> Result<&'a str> {
        self.get(row, column)
            .ok_or_else(|| Error::serialization(format!("BigQuery row is missing {column}")))
    }
}

/// Parses a BigQuery timestamp cell: RFC 3339, or epoch seconds as a float string.
#[must_use]
pub fn parse_bigquery_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Some(ts) = parse_timestamp(value) {
        return Some(ts);
    }
    let seconds: f64 = value.trim().parse().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let micros = (seconds * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros)
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

// ============================================================================
// Store
// ============================================================================

/// [`StateStore`] backed by BigQuery.
pub struct BigQueryStateStore {
    client: reqwest::Client,
    config: BigQueryConfig,
    tokens: Arc<dyn AccessTokenSource>,
    campaign_names: HashMap<String, String>,
}

impl fmt::Debug for BigQueryStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryStateStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BigQueryStateStore {
    /// Creates a store.
    ///
    /// # Errors
    ///
    /// Returns an error if the project or dataset is empty or the HTTP client
    /// cannot be built.
    pub fn new(config: BigQueryConfig, tokens: Arc<dyn AccessTokenSource>) -> Result<Self> {
        if config.project_id.trim().is_empty() {
            return Err(Error::configuration("BigQuery project_id cannot be empty"));
        }
        if config.dataset_id.trim().is_empty() {
            return Err(Error::configuration("BigQuery dataset_id cannot be empty"));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            tokens,
            campaign_names: HashMap::new(),
        })
    }

    /// Sets the campaign names written as `sequence_name` in history rows.
    #[must_use]
    pub fn with_campaign_names(mut self, names: HashMap<String, String>) -> Self {
        self.campaign_names = names;
        self
    }

    fn table(&self, name: &str) -> String {
        self.config.table(name)
    }

    fn queries_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/queries",
            self.config.endpoint.trim_end_matches('/'),
            self.config.project_id
        )
    }

    async fn query(&self, sql: &str, params: &[QueryParameter]) -> Result<ResultSet> {
        let token = self.tokens.access_token().await?;
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            parameter_mode: "NAMED",
            query_parameters: params,
            timeout_ms: POLL_TIMEOUT_MS,
        };

        let resp = self
            .client
            .post(self.queries_url())
            .bearer_auth(&token)
            .timeout(self.config.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::storage_with_source("BigQuery request failed", e))?;
        let mut body = Self::decode(resp).await?;

        let mut polls = 0;
        while !body.job_complete {
            polls += 1;
            if polls > MAX_POLLS {
                return Err(Error::storage("BigQuery job did not complete in time"));
            }
            let job = body
                .job_reference
                .as_ref()
                .ok_or_else(|| Error::storage("incomplete BigQuery job has no reference"))?;
            tracing::debug!(job_id = %job.job_id, polls, "waiting for BigQuery job");

            let mut request = self
                .client
                .get(format!("{}/{}", self.queries_url(), job.job_id))
                .bearer_auth(&token)
                .timeout(self.config.timeout)
                .query(&[("timeoutMs", POLL_TIMEOUT_MS.to_string())]);
            if let Some(location) = job.location.as_deref() {
                request = request.query(&[("location", location)]);
            }
            let resp = request
                .send()
                .await
                .map_err(|e| Error::storage_with_source("BigQuery poll failed", e))?;
            body = Self::decode(resp).await?;
        }

        Ok(ResultSet::from_response(body))
    }

    async fn decode(resp: reqwest::Response) -> Result<QueryResponse> {
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::storage(format!(
                "BigQuery query failed (status={status}): {}",
                truncate(&text, DEAD_LETTER_TEXT_LIMIT)
            )));
        }
        resp.json()
            .await
            .map_err(|e| Error::storage_with_source("invalid BigQuery response", e))
    }

    fn sequence_name<'a>(&'a self, campaign_id: &'a str) -> &'a str {
        self.campaign_names
            .get(campaign_id)
            .map_or(campaign_id, String::as_str)
    }
}

#[async_trait]
impl StateStore for BigQueryStateStore {
    async fn probe(&self) -> Result<()> {
        self.query("SELECT 1 AS ok", &[]).await.map(|_| ())
    }

    async fn drain_candidates(
        &self,
        campaign_ids: &[String],
        now: DateTime<Utc>,
        recheck_after: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<DrainCandidate>> {
        if campaign_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT instantly_lead_id, campaign_id, email, status, \
             FORMAT_TIMESTAMP('{TIMESTAMP_FORMAT}', last_drain_check) AS last_drain_check \
             FROM {table} \
             WHERE status IN ('active', 'pending') \
             AND campaign_id IN UNNEST(@campaign_ids) \
             AND instantly_lead_id IS NOT NULL \
             AND (last_drain_check IS NULL \
                  OR last_drain_check <= TIMESTAMP_SUB(@now, INTERVAL @recheck_seconds SECOND)) \
             ORDER BY last_drain_check ASC NULLS FIRST, email ASC \
             LIMIT @limit",
            table = self.table(&self.config.state_table)
        );
        let params = [
            QueryParameter::string_array("campaign_ids", campaign_ids.iter().cloned()),
            QueryParameter::timestamp("now", now),
            QueryParameter::int64("recheck_seconds", recheck_after.num_seconds()),
            QueryParameter::int64("limit", i64::try_from(limit).unwrap_or(i64::MAX)),
        ];
        let result = self.query(&sql, &params).await?;

        result
            .rows
            .iter()
            .map(|row| {
                Ok(DrainCandidate {
                    platform_lead_id: result.required(row, "instantly_lead_id")?.to_string(),
                    email: result.required(row, "email")?.to_string(),
                    campaign_id: result.required(row, "campaign_id")?.to_string(),
                    status: TrackedStatus::from(result.required(row, "status")?.to_string()),
                    last_drain_check_at: result
                        .get(row, "last_drain_check")
                        .and_then(parse_bigquery_timestamp),
                })
            })
            .collect()
    }

    async fn last_drain_checks(
        &self,
        lead_ids: &[String],
    ) -> Result<HashMap<String, Option<DateTime<Utc>>>> {
        if lead_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT instantly_lead_id, \
             FORMAT_TIMESTAMP('{TIMESTAMP_FORMAT}', MAX(last_drain_check)) AS last_drain_check \
             FROM {table} \
             WHERE instantly_lead_id IN UNNEST(@lead_ids) \
             GROUP BY instantly_lead_id",
            table = self.table(&self.config.state_table)
        );
        let params = [QueryParameter::string_array("lead_ids", lead_ids.iter().cloned())];
        let result = self.query(&sql, &params).await?;

        let mut checks = HashMap::with_capacity(result.rows.len());
        for row in &result.rows {
            let id = result.required(row, "instantly_lead_id")?.to_string();
            let at = result
                .get(row, "last_drain_check")
                .and_then(parse_bigquery_timestamp);
            checks.insert(id, at);
        }
        Ok(checks)
    }

    async fn touch_drain_checks(&self, lead_ids: &[String], now: DateTime<Utc>) -> Result<usize> {
        if lead_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {table} \
             SET last_drain_check = @now, updated_at = @now \
             WHERE instantly_lead_id IN UNNEST(@lead_ids) \
             AND (last_drain_check IS NULL OR last_drain_check < @now)",
            table = self.table(&self.config.state_table)
        );
        let params = [
            QueryParameter::string_array("lead_ids", lead_ids.iter().cloned()),
            QueryParameter::timestamp("now", now),
        ];
        Ok(self.query(&sql, &params).await?.affected)
    }

    async fn upsert_statuses(
        &self,
        leads: &[DrainedLead],
        deleted: bool,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if leads.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "MERGE {table} T \
             USING ( \
               SELECT e AS email, \
                 @campaign_ids[OFFSET(pos)] AS campaign_id, \
                 @statuses[OFFSET(pos)] AS status, \
                 @lead_ids[OFFSET(pos)] AS instantly_lead_id \
               FROM UNNEST(@emails) AS e WITH OFFSET AS pos \
             ) S \
             ON LOWER(T.email) = LOWER(S.email) AND T.campaign_id = S.campaign_id \
             WHEN MATCHED THEN UPDATE SET \
               status = S.status, \
               updated_at = @now, \
               deletion_status = IF(@deleted, 'done', T.deletion_status) \
             WHEN NOT MATCHED THEN \
               INSERT (email, campaign_id, status, instantly_lead_id, added_at, updated_at, deletion_status) \
               VALUES (S.email, S.campaign_id, S.status, S.instantly_lead_id, @now, @now, \
                       IF(@deleted, 'done', NULL))",
            table = self.table(&self.config.state_table)
        );
        let params = [
            QueryParameter::string_array("emails", leads.iter().map(|l| l.email.clone())),
            QueryParameter::string_array(
                "campaign_ids",
                leads.iter().map(|l| l.campaign_id.clone()),
            ),
            QueryParameter::string_array("statuses", leads.iter().map(|l| l.reason.as_str())),
            QueryParameter::string_array("lead_ids", leads.iter().map(|l| l.lead_id.clone())),
            QueryParameter::bool("deleted", deleted),
            QueryParameter::timestamp("now", now),
        ];
        self.query(&sql, &params).await?;
        Ok(leads.len())
    }

    async fn append_history(&self, leads: &[DrainedLead], now: DateTime<Utc>) -> Result<usize> {
        if leads.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO {table} \
             (email, campaign_id, sequence_name, status_final, completed_at, attempt_num) \
             SELECT e, @campaign_ids[OFFSET(pos)], @sequence_names[OFFSET(pos)], \
               @statuses[OFFSET(pos)], @now, 1 \
             FROM UNNEST(@emails) AS e WITH OFFSET AS pos",
            table = self.table(&self.config.history_table)
        );
        let params = [
            QueryParameter::string_array("emails", leads.iter().map(|l| l.email.clone())),
            QueryParameter::string_array(
                "campaign_ids",
                leads.iter().map(|l| l.campaign_id.clone()),
            ),
            QueryParameter::string_array(
                "sequence_names",
                leads.iter().map(|l| self.sequence_name(&l.campaign_id).to_string()),
            ),
            QueryParameter::string_array("statuses", leads.iter().map(|l| l.reason.as_str())),
            QueryParameter::timestamp("now", now),
        ];
        self.query(&sql, &params).await?;
        Ok(leads.len())
    }

    async fn insert_do_not_contact(
        &self,
        leads: &[DrainedLead],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if leads.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO {table} \
             (id, email, domain, source, reason, added_date, added_by, is_active) \
             SELECT GENERATE_UUID(), email, \
               IFNULL(NULLIF(SPLIT(email, '@')[SAFE_OFFSET(1)], ''), 'unknown'), \
               'instantly_drain', 'unsubscribe_via_api', @now, 'outreach_drain', TRUE \
             FROM (SELECT DISTINCT LOWER(TRIM(e)) AS email FROM UNNEST(@emails) AS e) \
             WHERE email NOT IN (SELECT LOWER(d.email) FROM {table} d WHERE d.email IS NOT NULL)",
            table = self.table(&self.config.do_not_contact_table)
        );
        let params = [
            QueryParameter::string_array("emails", leads.iter().map(|l| l.email.clone())),
            QueryParameter::timestamp("now", now),
        ];
        Ok(self.query(&sql, &params).await?.affected)
    }

    async fn record_deletion_failures(
        &self,
        lead_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if lead_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {table} \
             SET deletion_status = 'failed', \
                 deletion_attempts = IFNULL(deletion_attempts, 0) + 1, \
                 updated_at = @now \
             WHERE instantly_lead_id IN UNNEST(@lead_ids)",
            table = self.table(&self.config.state_table)
        );
        let params = [
            QueryParameter::string_array("lead_ids", lead_ids.iter().cloned()),
            QueryParameter::timestamp("now", now),
        ];
        Ok(self.query(&sql, &params).await?.affected)
    }

    async fn write_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} \
             (id, occurred_at, phase, email, http_status, error_text, retry_count) \
             VALUES (@id, @occurred_at, @phase, @email, @http_status, @error_text, 1)",
            table = self.table(&self.config.dead_letter_table)
        );
        let payload = letter.payload.to_string();
        let error_text = format!(
            "{} | Payload: {}",
            truncate(&letter.error_text, DEAD_LETTER_TEXT_LIMIT),
            truncate(&payload, DEAD_LETTER_TEXT_LIMIT)
        );
        let params = [
            QueryParameter::string("id", letter.id.to_string()),
            QueryParameter::timestamp("occurred_at", letter.occurred_at),
            QueryParameter::string("phase", letter.phase.as_str()),
            QueryParameter::scalar("email", "STRING", letter.email.clone()),
            QueryParameter::scalar(
                "http_status",
                "INT64",
                letter.http_status.map(|s| s.to_string()),
            ),
            QueryParameter::string("error_text", error_text),
        ];
        self.query(&sql, &params).await.map(|_| ())
    }
}
