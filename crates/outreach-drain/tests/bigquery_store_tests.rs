//! BigQuery state store tests against a fake `jobs.query` endpoint.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};

use outreach_core::state::TrackedStatus;
use outreach_drain::config::BigQueryConfig;
use outreach_drain::store::bigquery::StaticToken;
use outreach_drain::store::{BigQueryStateStore, DeadLetter, DeadLetterPhase, StateStore};
use outreach_drain::verdict::{DrainedLead, ReasonCode};

#[derive(Default)]
struct Warehouse {
    requests: Vec<Value>,
    polls: usize,
    fail: bool,
}

type Shared = Arc<Mutex<Warehouse>>;

fn rows(fields: &[&str], values: &[&[Value]]) -> Value {
    json!({
        "jobComplete": true,
        "schema": {"fields": fields.iter().map(|f| json!({"name": f})).collect::<Vec<_>>()},
        "rows": values
            .iter()
            .map(|row| json!({"f": row.iter().map(|v| json!({"v": v})).collect::<Vec<_>>()}))
            .collect::<Vec<_>>(),
    })
}

fn candidate_rows() -> Value {
    rows(
        &["instantly_lead_id", "campaign_id", "email", "status", "last_drain_check"],
        &[
            &[json!("l1"), json!("c1"), json!("a@example.com"), json!("active"), Value::Null],
            &[
                json!("l2"),
                json!("c1"),
                json!("b@example.com"),
                json!("pending"),
                json!("2025-05-30T10:00:00.000000Z"),
            ],
        ],
    )
}

async fn query_handler(
    State(warehouse): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if auth != Some("Bearer bq-token") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "auth"})));
    }
    let mut warehouse = warehouse.lock().unwrap();
    if warehouse.fail {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"message": "backend error"}})),
        );
    }
    let sql = body["query"].as_str().unwrap_or_default().to_string();
    warehouse.requests.push(body);

    let response = if sql.contains("ORDER BY last_drain_check") {
        json!({"jobComplete": false, "jobReference": {"jobId": "job-1", "location": "US"}})
    } else if sql.contains("GROUP BY instantly_lead_id") {
        rows(
            &["instantly_lead_id", "last_drain_check"],
            &[
                &[json!("l1"), Value::Null],
                &[json!("l2"), json!("1748599200.0")],
            ],
        )
    } else if sql.starts_with("UPDATE") || sql.contains("dnc_list") {
        json!({"jobComplete": true, "numDmlAffectedRows": "2"})
    } else {
        json!({"jobComplete": true})
    };
    (StatusCode::OK, Json(response))
}

async fn poll_handler(
    State(warehouse): State<Shared>,
    Path((_project, job_id)): Path<(String, String)>,
) -> (StatusCode, Json<Value>) {
    let mut warehouse = warehouse.lock().unwrap();
    warehouse.polls += 1;
    if job_id != "job-1" {
        return (StatusCode::NOT_FOUND, Json(json!({})));
    }
    (StatusCode::OK, Json(candidate_rows()))
}

async fn start_warehouse() -> (String, Shared, tokio::task::JoinHandle<()>) {
    let shared: Shared = Arc::new(Mutex::new(Warehouse::default()));
    let app = Router::new()
        .route("/bigquery/v2/projects/:project/queries", post(query_handler))
        .route("/bigquery/v2/projects/:project/queries/:job_id", get(poll_handler))
        .with_state(shared.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr: SocketAddr = listener.local_addr().expect("listener addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve fake warehouse");
    });
    (format!("http://{addr}"), shared, handle)
}

fn store(endpoint: &str) -> BigQueryStateStore {
    let config = BigQueryConfig::new("proj", "outreach").with_endpoint(endpoint);
    BigQueryStateStore::new(config, Arc::new(StaticToken::new("bq-token"))).expect("store")
}

fn drained(id: &str, reason: ReasonCode) -> DrainedLead {
    DrainedLead {
        lead_id: id.into(),
        email: format!("{id}@example.com"),
        campaign_id: "c1".into(),
        reason,
    }
}

#[tokio::test]
async fn candidates_poll_until_the_job_completes() {
    let (endpoint, shared, _handle) = start_warehouse().await;
    let store = store(&endpoint);
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

    let candidates = store
        .drain_candidates(&["c1".to_string()], now, Duration::hours(24), 50)
        .await
        .expect("candidates");

    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].platform_lead_id, "l1");
    assert!(candidates[0].last_drain_check_at.is_none());
    assert_eq!(candidates[1].status, TrackedStatus::Pending);
    assert_eq!(
        candidates[1].last_drain_check_at,
        Some(Utc.with_ymd_and_hms(2025, 5, 30, 10, 0, 0).unwrap())
    );

    let warehouse = shared.lock().unwrap();
    assert_eq!(warehouse.polls, 1);
    let request = &warehouse.requests[0];
    assert_eq!(request["useLegacySql"], false);
    assert_eq!(request["parameterMode"], "NAMED");
    assert!(request["query"]
        .as_str()
        .unwrap()
        .contains("`proj.outreach.ops_inst_state`"));
    let params = request["queryParameters"].as_array().unwrap();
    let recheck = params.iter().find(|p| p["name"] == "recheck_seconds").unwrap();
    assert_eq!(recheck["parameterValue"]["value"], "86400");
}

#[tokio::test]
async fn last_checks_accept_epoch_seconds() {
    let (endpoint, _shared, _handle) = start_warehouse().await;
    let store = store(&endpoint);

    let checks = store
        .last_drain_checks(&["l1".to_string(), "l2".to_string(), "l3".to_string()])
        .await
        .expect("checks");
    assert_eq!(checks.len(), 2);
    assert_eq!(checks["l1"], None);
    assert_eq!(
        checks["l2"],
        Some(Utc.with_ymd_and_hms(2025, 5, 30, 10, 0, 0).unwrap())
    );
    assert!(!checks.contains_key("l3"));
}

#[tokio::test]
async fn writes_send_parallel_arrays() {
    let (endpoint, shared, _handle) = start_warehouse().await;
    let store = store(&endpoint);
    let now = Utc::now();
    let leads = [
        drained("l1", ReasonCode::Completed),
        drained("l2", ReasonCode::Unsubscribed),
    ];

    assert_eq!(store.upsert_statuses(&leads, true, now).await.unwrap(), 2);
    assert_eq!(store.touch_drain_checks(&["l1".into(), "l2".into()], now).await.unwrap(), 2);
    assert_eq!(store.insert_do_not_contact(&leads[1..], now).await.unwrap(), 2);
    assert_eq!(store.record_deletion_failures(&["l9".into()], now).await.unwrap(), 2);

    let warehouse = shared.lock().unwrap();
    let merge = &warehouse.requests[0];
    assert!(merge["query"].as_str().unwrap().starts_with("MERGE"));
    let statuses = merge["queryParameters"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["name"] == "statuses")
        .unwrap();
    let values: Vec<_> = statuses["parameterValue"]["arrayValues"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["value"].as_str().unwrap())
        .collect();
    assert_eq!(values, ["completed", "unsubscribed"]);
}

#[tokio::test]
async fn dead_letters_carry_payload_in_error_text() {
    let (endpoint, shared, _handle) = start_warehouse().await;
    let store = store(&endpoint);
    let letter = DeadLetter::new(
        DeadLetterPhase::DrainDelete,
        Utc::now(),
        "delete failed",
        json!({"lead_id": "l1"}),
    )
    .with_email("a@example.com")
    .with_http_status(Some(422));

    store.write_dead_letter(&letter).await.expect("dead letter");

    let warehouse = shared.lock().unwrap();
    let params = warehouse.requests[0]["queryParameters"].as_array().unwrap();
    let text = params.iter().find(|p| p["name"] == "error_text").unwrap();
    assert_eq!(
        text["parameterValue"]["value"],
        r#"delete failed | Payload: {"lead_id":"l1"}"#
    );
    let status = params.iter().find(|p| p["name"] == "http_status").unwrap();
    assert_eq!(status["parameterValue"]["value"], "422");
}

#[tokio::test]
async fn server_errors_surface_as_storage_errors() {
    let (endpoint, shared, _handle) = start_warehouse().await;
    shared.lock().unwrap().fail = true;
    let store = store(&endpoint);

    let err = store.probe().await.expect_err("500");
    assert!(err.to_string().contains("500"));
    assert!(!err.is_retryable());
}
