//! HTTP API tests
//!
//! Coverage includes:
//! - Bearer authentication on `POST /track-subscription`
//! - Request validation
//! - `GET /health-check` status codes
//! - Authenticated, redacted job inspection

mod common;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use common::{key, quote_body, test_config, ScriptedProvider, TestHarness, TEST_TOKEN};
use http_body_util::BodyExt;
use refreshq_common::DataType;
use refreshq_server::{
    api::create_router,
    config::ProviderConfig,
    provider::{HttpProvider, ProviderResponse},
    refresh::{
        health::{LEASE_REAPER_JOB, REFRESH_WORKER_JOB, STALENESS_SWEEP_JOB},
        JobHealthRecord, JobRun, RefreshWorker, SUBSCRIPTION_PRIORITY,
    },
    services::Services,
    store::{JobHealthStore, MemoryStore},
};
use serde_json::{json, Value};
use tower::ServiceExt;

fn harness() -> TestHarness {
    TestHarness::new(ScriptedProvider::new(ProviderResponse::new(
        200,
        quote_body("AAPL", 1_700_000_000, 200),
        None,
    )))
}

fn app(harness: &TestHarness) -> Router {
    create_router(harness.services.feature_state(), &harness.config)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn track_request(token: Option<&str>, body: String) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/track-subscription")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body)).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn authed_get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_track_subscription_enqueues_stale_types() {
    let harness = harness();
    let app = app(&harness);

    let body = json!({ "entityKey": "aapl", "dataTypes": ["quote", "company_profile"] });
    let (status, json) = send(&app, track_request(Some(TEST_TOKEN), body.to_string())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "success": true }));

    let jobs = harness
        .services
        .queue
        .list_jobs(Some(&key("AAPL")), None)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job.priority == SUBSCRIPTION_PRIORITY));
}

#[tokio::test]
async fn test_track_subscription_requires_token() {
    let harness = harness();
    let app = app(&harness);
    let body = json!({ "entityKey": "AAPL", "dataTypes": ["quote"] }).to_string();

    let (status, json) = send(&app, track_request(None, body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"]["code"], "unauthorized");

    let (status, _) = send(&app, track_request(Some("wrong-token"), body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let jobs = harness.services.queue.list_jobs(None, None).await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn test_auth_is_checked_before_body() {
    let harness = harness();
    let app = app(&harness);

    let (status, _) = send(&app, track_request(None, "not json".to_string())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_token_configuration_is_server_error() {
    let mut config = test_config();
    config.auth.api_tokens.clear();
    let harness = TestHarness::with_config(
        config,
        ScriptedProvider::new(ProviderResponse::new(200, "[]", None)),
    );
    let app = app(&harness);

    let body = json!({ "entityKey": "AAPL", "dataTypes": ["quote"] }).to_string();
    let (status, json) = send(&app, track_request(Some(TEST_TOKEN), body)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"]["code"], "config_error");
    assert_eq!(json["error"]["message"], "Server configuration error");
}

#[tokio::test]
async fn test_invalid_bodies_are_rejected() {
    let harness = harness();
    let app = app(&harness);

    let cases = [
        "not json".to_string(),
        json!({ "entityKey": "AAPL", "dataTypes": ["dividends"] }).to_string(),
        json!({ "entityKey": "   ", "dataTypes": ["quote"] }).to_string(),
        json!({ "dataTypes": ["quote"] }).to_string(),
    ];

    for body in cases {
        let (status, json) = send(&app, track_request(Some(TEST_TOKEN), body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {}", body);
        assert_eq!(json["error"]["code"], "bad_request");
    }
}

#[tokio::test]
async fn test_empty_data_types_is_a_no_op() {
    let harness = harness();
    let app = app(&harness);

    let body = json!({ "entityKey": "AAPL", "dataTypes": [] }).to_string();
    let (status, _) = send(&app, track_request(Some(TEST_TOKEN), body)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(harness.services.queue.list_jobs(None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_health_check_reports_never_run_jobs_as_unhealthy() {
    let harness = harness();
    let app = app(&harness);

    let (status, json) = send(&app, get("/health-check")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "unhealthy");
    assert_eq!(json["staleJobs"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_health_check_healthy_when_all_jobs_on_schedule() {
    let harness = harness();
    let now = Utc::now();

    for name in [STALENESS_SWEEP_JOB, LEASE_REAPER_JOB, REFRESH_WORKER_JOB] {
        harness
            .store
            .record_run(&JobHealthRecord {
                job_name: name.to_string(),
                last_run: Some(now - Duration::seconds(10)),
                expected_interval_minutes: 5,
            })
            .await
            .unwrap();
    }

    let (status, json) = send(&app(&harness), get("/health-check")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["jobs"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_job_inspection() {
    let harness = harness();
    let app = app(&harness);

    harness
        .services
        .queue
        .enqueue_if_stale(&key("AAPL"), DataType::Quote, SUBSCRIPTION_PRIORITY)
        .await
        .unwrap();

    let (status, json) = send(&app, authed_get("/jobs?entityKey=aapl&dataType=quote")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 1);

    let id = json["jobs"][0]["id"].as_str().unwrap().to_string();
    let (status, job) = send(&app, authed_get(&format!("/jobs/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "pending");
    assert_eq!(job["entity_key"], "AAPL");

    let (status, json) =
        send(&app, authed_get(&format!("/jobs/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_job_inspection_requires_token() {
    let harness = harness();
    let app = app(&harness);

    let (status, json) = send(&app, get("/jobs?entityKey=AAPL")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"]["code"], "unauthorized");

    let (status, _) = send(&app, get(&format!("/jobs/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_failed_job_never_exposes_provider_key() {
    const PROVIDER_KEY: &str = "SECRET-PROVIDER-KEY";

    let config = test_config();
    let provider = HttpProvider::new(&ProviderConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        api_key: Some(PROVIDER_KEY.to_string()),
        timeout_secs: 2,
    })
    .unwrap();
    let services = Services::build(&config, Arc::new(MemoryStore::new()), Arc::new(provider));

    services
        .queue
        .enqueue_if_stale(&key("AAPL"), DataType::Quote, SUBSCRIPTION_PRIORITY)
        .await
        .unwrap();
    let run = RefreshWorker::new(services.worker_deps.clone())
        .run_once()
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(run, JobRun::Failed { category: "transient_network_error", .. }));

    let app = create_router(services.feature_state(), &config);
    let (status, json) = send(&app, authed_get("/jobs?entityKey=AAPL")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["jobs"][0]["last_error"], "transient_network_error");
    assert!(!json.to_string().contains(PROVIDER_KEY));
}

#[tokio::test]
async fn test_root_reports_service_info() {
    let harness = harness();
    let (status, json) = send(&app(&harness), get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["name"], "refreshq");
}
