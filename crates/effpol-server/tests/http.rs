//! End-to-end tests: the effpol router in front of a local mock of the
//! Org Policy v2 API and metadata token endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use effpol_core::{BatchResolver, FanOutExecutor, RateLimiter, WireResponse};
use effpol_server::orgpolicy::{CLOUD_PLATFORM_SCOPE, OrgPolicyProvider, TokenSource};
use effpol_server::{AppState, serve};
use serde_json::{Value, json};
use tokio::net::TcpListener;

const TOKEN: &str = "ya29.mock";

async fn effective_policy(Path(rest): Path<String>, headers: HeaderMap) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(format!("Bearer {TOKEN}").as_str());
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "missing credentials").into_response();
    }

    let Some(name) = rest.trim_start_matches('/').strip_suffix(":getEffectivePolicy") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let name = name.to_string();

    if name.contains("denied") {
        return (StatusCode::FORBIDDEN, "permission denied").into_response();
    }
    if name.contains("slow") {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }

    Json(json!({
        "name": name,
        "spec": {"etag": name, "rules": [{"enforce": true}]}
    }))
    .into_response()
}

async fn metadata_token(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Response {
    if headers.get("Metadata-Flavor").and_then(|v| v.to_str().ok()) != Some("Google") {
        return StatusCode::FORBIDDEN.into_response();
    }
    if params.get("scopes").map(String::as_str) != Some(CLOUD_PLATFORM_SCOPE) {
        return (StatusCode::BAD_REQUEST, "wrong scope").into_response();
    }
    Json(json!({"access_token": TOKEN, "expires_in": 3599, "token_type": "Bearer"})).into_response()
}

async fn broken_token() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "metadata unavailable").into_response()
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn mock_org_policy() -> SocketAddr {
    spawn(
        Router::new()
            .route("/v2/*rest", get(effective_policy))
            .route("/token", get(metadata_token))
            .route("/broken-token", get(broken_token)),
    )
    .await
}

async fn effpol(mock: SocketAddr, tokens: TokenSource) -> SocketAddr {
    let provider = OrgPolicyProvider::new(format!("http://{mock}/v2"), tokens, Duration::from_secs(60)).unwrap();
    let limiter = Arc::new(RateLimiter::new(100.0, 10).unwrap());
    let resolver = BatchResolver::new(Arc::new(provider), FanOutExecutor::new(limiter));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, AppState::new(resolver), std::future::pending()));
    addr
}

async fn metadata_effpol() -> SocketAddr {
    let mock = mock_org_policy().await;
    effpol(
        mock,
        TokenSource::Metadata {
            url: format!("http://{mock}/token"),
            scope: CLOUD_PLATFORM_SCOPE.into(),
        },
    )
    .await
}

async fn post(addr: SocketAddr, body: impl Into<reqwest::Body>) -> (StatusCode, WireResponse) {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
    (status, resp.json().await.unwrap())
}

fn batch(calls: Value) -> String {
    json!({
        "requestId": "124ab1c",
        "caller": "//bigquery.googleapis.com/projects/p/jobs/j",
        "sessionUser": "analyst@example.com",
        "userDefinedContext": {"purpose": "audit"},
        "calls": calls,
    })
    .to_string()
}

#[tokio::test]
async fn resolves_batch_in_order_with_metadata_token() {
    let addr = metadata_effpol().await;
    let names = [
        "projects/p/policies/compute.requireOsLogin",
        "folders/1/policies/gcp.resourceLocations",
        "organizations/2/policies/iam.disableServiceAccountKeyCreation",
    ];

    let (status, response) = post(addr, batch(json!(names.map(|n| [n])))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response.error_message, None);
    let expected: Vec<String> = names
        .iter()
        .map(|n| json!({"etag": n, "rules": [{"enforce": true}]}).to_string())
        .collect();
    assert_eq!(response.replies, Some(expected));
}

#[tokio::test]
async fn static_token_is_presented() {
    let mock = mock_org_policy().await;
    let addr = effpol(mock, TokenSource::Static(TOKEN.into())).await;

    let (_, response) = post(addr, batch(json!([["projects/p/policies/a"]]))).await;
    assert_eq!(response.replies.map(|r| r.len()), Some(1));
}

#[tokio::test]
async fn failing_lookup_reports_its_row() {
    let addr = metadata_effpol().await;

    let (status, response) = post(
        addr,
        batch(json!([["projects/p/policies/a"], ["projects/denied/policies/b"]])),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(response.replies.is_none());
    let message = response.error_message.unwrap();
    assert!(message.contains("row 1"), "{message}");
    assert!(message.contains("403"), "{message}");
}

#[tokio::test]
async fn failure_cancels_in_flight_lookups() {
    let addr = metadata_effpol().await;
    let start = Instant::now();

    let (_, response) = post(
        addr,
        batch(json!([["projects/slow/policies/a"], ["projects/denied/policies/b"]])),
    )
    .await;

    assert!(response.error_message.unwrap().contains("row 1"));
    assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
}

#[tokio::test]
async fn invalid_argument_type_is_rejected() {
    let addr = metadata_effpol().await;

    let (status, response) = post(addr, batch(json!([[42]]))).await;

    assert_eq!(status, StatusCode::OK);
    assert!(response.replies.is_none());
    assert!(response.error_message.unwrap().contains("Invalid resource type"));
}

#[tokio::test]
async fn malformed_body_is_a_domain_error() {
    let addr = metadata_effpol().await;

    let (status, response) = post(addr, "{not json").await;

    assert_eq!(status, StatusCode::OK);
    assert!(response.replies.is_none());
    assert!(
        response
            .error_message
            .unwrap()
            .starts_with("External Function error: can't read POST body")
    );
}

#[tokio::test]
async fn empty_batch_returns_empty_replies() {
    let addr = metadata_effpol().await;
    let (_, response) = post(addr, batch(json!([]))).await;
    assert_eq!(response.replies, Some(vec![]));
    assert_eq!(response.error_message, None);
}

#[tokio::test]
async fn token_failure_is_reported_per_batch() {
    let mock = mock_org_policy().await;
    let addr = effpol(
        mock,
        TokenSource::Metadata {
            url: format!("http://{mock}/broken-token"),
            scope: CLOUD_PLATFORM_SCOPE.into(),
        },
    )
    .await;

    let (status, response) = post(addr, batch(json!([["projects/p/policies/a"]]))).await;

    assert_eq!(status, StatusCode::OK);
    let message = response.error_message.unwrap();
    assert!(message.contains("Error creating policy client"), "{message}");
    assert!(message.contains("500"), "{message}");
}

#[tokio::test]
async fn health_and_metrics_endpoints() {
    let addr = metadata_effpol().await;
    post(addr, batch(json!([["projects/p/policies/a"]]))).await;

    let health = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(health.text().await.unwrap(), "ok");

    let metrics: Value = reqwest::get(format!("http://{addr}/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["batches_started"], 1);
    assert_eq!(metrics["batches_succeeded"], 1);
    assert_eq!(metrics["lookups_started"], 1);
}
