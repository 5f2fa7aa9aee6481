//! Enrolled lead records as reported by the campaign platform.
//!
//! The platform returns loosely-typed JSON. [`RawLead`] mirrors that wire shape
//! with every field optional; [`EnrolledLead`] is the validated record the rest
//! of the pipeline works with. Conversion happens once, at the API boundary.
//!
//! ## Vendor codes
//!
//! | Code | [`LifecycleStatus`] |
//! |------|---------------------|
//! | 0 | `NotStarted` |
//! | 1 | `InProgress` |
//! | 2 | `Paused` |
//! | 3 | `Finished` |
//! | 4 | `Replied` |
//! | -1 | `Bounced` |
//! | -2 | `Unsubscribed` |
//!
//! Delivery (ESP) codes 550/551/553 are hard bounces, 421/450/451 soft bounces.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// ESP codes the platform reports for permanent delivery failures.
pub const HARD_BOUNCE_CODES: [u16; 3] = [550, 551, 553];

/// ESP codes the platform reports for transient delivery failures.
pub const SOFT_BOUNCE_CODES: [u16; 3] = [421, 450, 451];

/// ESP code for a clean handoff to the recipient server.
pub const CLEAN_DELIVERY_CODE: u16 = 250;

/// The platform's own state-machine value for a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    /// Enrolled but no step has been sent yet.
    NotStarted,
    /// Sequence is actively sending.
    InProgress,
    /// Sequence is paused and may resume.
    Paused,
    /// Sequence ran to its end.
    Finished,
    /// The platform recorded a reply and stopped the sequence.
    Replied,
    /// The platform marked the address as bounced.
    Bounced,
    /// The recipient unsubscribed.
    Unsubscribed,
    /// A code this crate does not know about.
    Other(i64),
}

impl LifecycleStatus {
    /// Maps a vendor numeric status code.
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::NotStarted,
            1 => Self::InProgress,
            2 => Self::Paused,
            3 => Self::Finished,
            4 => Self::Replied,
            -1 => Self::Bounced,
            -2 => Self::Unsubscribed,
            other => Self::Other(other),
        }
    }

    /// Returns the vendor numeric code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::NotStarted => 0,
            Self::InProgress => 1,
            Self::Paused => 2,
            Self::Finished => 3,
            Self::Replied => 4,
            Self::Bounced => -1,
            Self::Unsubscribed => -2,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Paused => write!(f, "paused"),
            Self::Finished => write!(f, "finished"),
            Self::Replied => write!(f, "replied"),
            Self::Bounced => write!(f, "bounced"),
            Self::Unsubscribed => write!(f, "unsubscribed"),
            Self::Other(code) => write!(f, "status_{code}"),
        }
    }
}

/// Transport-layer outcome for the last delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryCode {
    /// No delivery attempt recorded.
    None,
    /// Accepted by the recipient server.
    Clean,
    /// Transient failure; the platform retries on its own.
    SoftBounce(u16),
    /// Permanent failure.
    HardBounce(u16),
    /// Any other ESP code.
    Other(u16),
}

impl DeliveryCode {
    /// Maps a raw ESP code. Zero, negative, and out-of-range values mean no attempt.
    #[must_use]
    pub fn from_esp_code(code: i64) -> Self {
        let Ok(code) = u16::try_from(code) else {
            return Self::None;
        };
        match code {
            0 => Self::None,
            CLEAN_DELIVERY_CODE => Self::Clean,
            c if HARD_BOUNCE_CODES.contains(&c) => Self::HardBounce(c),
            c if SOFT_BOUNCE_CODES.contains(&c) => Self::SoftBounce(c),
            c => Self::Other(c),
        }
    }

    /// Returns true for a permanent delivery failure.
    #[must_use]
    pub const fn is_hard_bounce(self) -> bool {
        matches!(self, Self::HardBounce(_))
    }

    /// Returns true for a transient delivery failure.
    #[must_use]
    pub const fn is_soft_bounce(self) -> bool {
        matches!(self, Self::SoftBounce(_))
    }

    /// Returns the raw ESP code, if any.
    #[must_use]
    pub const fn esp_code(self) -> Option<u16> {
        match self {
            Self::None => None,
            Self::Clean => Some(CLEAN_DELIVERY_CODE),
            Self::SoftBounce(c) | Self::HardBounce(c) | Self::Other(c) => Some(c),
        }
    }
}

/// Structured status counters some platform versions attach to a lead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    /// Whether the platform recorded an unsubscribe.
    pub unsubscribed: bool,
}

impl StatusSummary {
    fn from_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let unsubscribed = match obj.get("unsubscribed") {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            Some(serde_json::Value::String(s)) => {
                matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
            }
            _ => false,
        };
        Some(Self { unsubscribed })
    }
}

/// Wire shape of a lead returned by the campaign platform.
///
/// Every field is optional so that a single odd record never fails a whole page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLead {
    /// Platform identifier.
    #[serde(default)]
    pub id: Option<String>,
    /// Contact address.
    #[serde(default)]
    pub email: Option<String>,
    /// Campaign the lead belongs to.
    #[serde(default)]
    pub campaign: Option<String>,
    /// Legacy campaign field name.
    #[serde(default)]
    pub campaign_id: Option<String>,
    /// Vendor lifecycle status code.
    #[serde(default)]
    pub status: Option<i64>,
    /// Number of detected replies.
    #[serde(default)]
    pub email_reply_count: Option<i64>,
    /// Last ESP delivery code.
    #[serde(default)]
    pub esp_code: Option<i64>,
    /// Enrollment timestamp (RFC 3339).
    #[serde(default)]
    pub timestamp_created: Option<String>,
    /// Last platform-side update (RFC 3339).
    #[serde(default)]
    pub timestamp_updated: Option<String>,
    /// Free-form payload; `pause_until` lives here.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Free-text status description.
    #[serde(default)]
    pub status_text: Option<String>,
    /// Structured status counters.
    #[serde(default)]
    pub status_summary: Option<serde_json::Value>,
}

/// A lead currently enrolled in a remote campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolledLead {
    /// Platform identifier, stable for the lead's lifetime in the campaign.
    pub id: String,
    /// Contact address, unique within a campaign only.
    pub email: String,
    /// Campaign the lead belongs to.
    pub campaign_id: String,
    /// Platform lifecycle status.
    pub lifecycle_status: LifecycleStatus,
    /// Count of detected replies.
    pub reply_count: u32,
    /// Last delivery outcome.
    pub delivery_code: DeliveryCode,
    /// Enrollment timestamp.
    pub created_at: Option<DateTime<Utc>>,
    /// Last platform-side update.
    pub updated_at: Option<DateTime<Utc>>,
    /// Auto-reply suppression marker. Presence is the signal; the value is kept for audit.
    pub pause_until: Option<String>,
    /// Free-text status description.
    pub status_text: Option<String>,
    /// Structured status counters, when the platform sends them.
    pub status_summary: Option<StatusSummary>,
}

impl EnrolledLead {
    /// Builds a typed lead from a raw JSON value.
    ///
    /// `fallback_campaign` is used when the payload does not name its campaign
    /// (the list endpoint is already scoped to one).
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a lead object or lacks an id, email,
    /// or status.
    pub fn from_value(value: serde_json::Value, fallback_campaign: Option<&str>) -> Result<Self> {
        let raw: RawLead = serde_json::from_value(value)?;
        Self::from_raw(raw, fallback_campaign)
    }

    /// Builds a typed lead from its wire shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the id, email, lifecycle status, or campaign is missing.
    pub fn from_raw(raw: RawLead, fallback_campaign: Option<&str>) -> Result<Self> {
        let id = non_empty(raw.id).ok_or_else(|| Error::invalid_lead("missing id"))?;
        let email = non_empty(raw.email)
            .ok_or_else(|| Error::invalid_lead(format!("lead {id} has no email")))?;
        let status = raw
            .status
            .ok_or_else(|| Error::invalid_lead(format!("lead {id} has no status")))?;
        let campaign_id = non_empty(raw.campaign)
            .or_else(|| non_empty(raw.campaign_id))
            .or_else(|| fallback_campaign.map(str::to_string))
            .ok_or_else(|| Error::invalid_lead(format!("lead {id} has no campaign")))?;

        let reply_count = raw
            .email_reply_count
            .map_or(0, |c| u32::try_from(c.max(0)).unwrap_or(u32::MAX));

        let pause_until = raw.payload.as_ref().and_then(pause_marker);

        Ok(Self {
            id,
            email,
            campaign_id,
            lifecycle_status: LifecycleStatus::from_code(status),
            reply_count,
            delivery_code: DeliveryCode::from_esp_code(raw.esp_code.unwrap_or(0)),
            created_at: raw.timestamp_created.as_deref().and_then(parse_timestamp),
            updated_at: raw.timestamp_updated.as_deref().and_then(parse_timestamp),
            pause_until,
            status_text: non_empty(raw.status_text),
            status_summary: raw.status_summary.as_ref().and_then(StatusSummary::from_value),
        })
    }

    /// Whole days elapsed since enrollment. Unknown or future creation counts as zero.
    #[must_use]
    pub fn days_since_created(&self, now: DateTime<Utc>) -> i64 {
        self.created_at
            .map_or(0, |created| (now - created).num_days().max(0))
    }

    /// Returns true if the platform's auto-reply suppression is active.
    #[must_use]
    pub const fn is_suppressed(&self) -> bool {
        self.pause_until.is_some()
    }
}

impl TryFrom<RawLead> for EnrolledLead {
    type Error = Error;

    fn try_from(raw: RawLead) -> Result<Self> {
        Self::from_raw(raw, None)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Reads `payload.pause_until`. Null, `false`, zero, and empty strings,
/// arrays, or objects mean no suppression.
fn pause_marker(payload: &serde_json::Value) -> Option<String> {
    use serde_json::Value;

    match payload.get("pause_until")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.as_f64().is_some_and(|v| v.abs() < f64::EPSILON) => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(fields) if fields.is_empty() => None,
        other => Some(other.to_string()),
    }
}

/// Parses an RFC 3339 timestamp, returning `None` for anything else.
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn parses_full_vendor_payload() {
        let lead = EnrolledLead::from_value(
            json!({
                "id": "lead-1",
                "email": "a@example.com",
                "campaign": "camp-1",
                "status": 3,
                "email_reply_count": 2,
                "esp_code": 550,
                "timestamp_created": "2025-01-01T00:00:00Z",
                "timestamp_updated": "2025-01-05T12:00:00.000Z",
                "payload": {"pause_until": "2025-01-09T00:00:00Z"},
                "status_text": "Completed",
                "status_summary": {"unsubscribed": 1}
            }),
            None,
        )
        .unwrap();

        assert_eq!(lead.id, "lead-1");
        assert_eq!(lead.campaign_id, "camp-1");
        assert_eq!(lead.lifecycle_status, LifecycleStatus::Finished);
        assert_eq!(lead.reply_count, 2);
        assert_eq!(lead.delivery_code, DeliveryCode::HardBounce(550));
        assert_eq!(
            lead.created_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
        );
        assert!(lead.updated_at.is_some());
        assert!(lead.is_suppressed());
        assert_eq!(lead.status_summary, Some(StatusSummary { unsubscribed: true }));
    }

    #[test]
    fn falls_back_to_requested_campaign() {
        let lead =
            EnrolledLead::from_value(json!({"id": "x", "email": "x@example.com", "status": 0}), Some("camp-9"))
                .unwrap();
        assert_eq!(lead.campaign_id, "camp-9");
        assert_eq!(lead.lifecycle_status, LifecycleStatus::NotStarted);
        assert_eq!(lead.delivery_code, DeliveryCode::None);
        assert!(!lead.is_suppressed());
    }

    #[test]
    fn missing_id_is_rejected() {
        let err = EnrolledLead::from_value(json!({"email": "x@example.com"}), Some("c")).unwrap_err();
        assert!(err.to_string().contains("missing id"));
    }

    #[test]
    fn try_from_requires_campaign() {
        let raw = RawLead {
            id: Some("x".into()),
            email: Some("x@example.com".into()),
            status: Some(1),
            ..RawLead::default()
        };
        assert!(EnrolledLead::try_from(raw.clone()).is_err());
        let raw = RawLead {
            campaign: Some("c".into()),
            ..raw
        };
        assert_eq!(EnrolledLead::try_from(raw).unwrap().campaign_id, "c");
    }

    #[test]
    fn wrong_field_type_is_rejected() {
        let result = EnrolledLead::from_value(json!({"id": "x", "status": "three"}), Some("c"));
        assert!(result.is_err());
    }

    #[test]
    fn empty_pause_marker_is_not_suppression() {
        let lead = EnrolledLead::from_value(
            json!({"id": "x", "email": "x@example.com", "status": 3, "payload": {"pause_until": ""}}),
            Some("c"),
        )
        .unwrap();
        assert!(!lead.is_suppressed());
    }

    #[test]
    fn falsy_pause_markers_are_not_suppression() {
        for marker in [json!(false), json!(0), json!(0.0), json!({}), json!([]), json!(null)] {
            let lead = EnrolledLead::from_value(
                json!({"id": "x", "email": "x@example.com", "status": 3, "payload": {"pause_until": marker}}),
                Some("c"),
            )
            .unwrap();
            assert!(!lead.is_suppressed(), "{marker} should not suppress");
        }

        let lead = EnrolledLead::from_value(
            json!({"id": "x", "email": "x@example.com", "status": 3, "payload": {"pause_until": true}}),
            Some("c"),
        )
        .unwrap();
        assert!(lead.is_suppressed());
    }

    #[test]
    fn missing_status_is_rejected() {
        let err = EnrolledLead::from_value(
            json!({"id": "x", "email": "x@example.com", "status_text": "Lead unsubscribed"}),
            Some("c"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("lead x has no status"));
    }

    #[test]
    fn unparseable_created_at_counts_as_zero_days() {
        let lead = EnrolledLead::from_value(
            json!({"id": "x", "email": "x@example.com", "status": 1, "timestamp_created": "yesterday"}),
            Some("c"),
        )
        .unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(lead.days_since_created(now), 0);
    }

    #[test]
    fn delivery_code_mapping() {
        assert_eq!(DeliveryCode::from_esp_code(0), DeliveryCode::None);
        assert_eq!(DeliveryCode::from_esp_code(-5), DeliveryCode::None);
        assert_eq!(DeliveryCode::from_esp_code(250), DeliveryCode::Clean);
        assert!(DeliveryCode::from_esp_code(553).is_hard_bounce());
        assert!(DeliveryCode::from_esp_code(421).is_soft_bounce());
        assert_eq!(DeliveryCode::from_esp_code(554), DeliveryCode::Other(554));
    }

    #[test]
    fn lifecycle_codes_roundtrip() {
        for code in [-2, -1, 0, 1, 2, 3, 4, 17] {
            assert_eq!(LifecycleStatus::from_code(code).code(), code);
        }
    }
}
