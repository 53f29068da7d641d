use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use effpol_core::{BatchRequest, BatchResolver, MetricsSnapshot, WireResponse, aggregate};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    resolver: Arc<BatchResolver>,
}

impl AppState {
    pub fn new(resolver: BatchResolver) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(resolve_batch))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Remote-function endpoint. Domain failures, including an unreadable body,
/// come back as `200` with `errorMessage`; only a response that cannot be
/// encoded is a server error.
async fn resolve_batch(State(state): State<AppState>, body: Bytes) -> Response {
    let response = match serde_json::from_slice::<BatchRequest>(&body) {
        Ok(request) => {
            // Request scope: a dropped handler (client went away) cancels the batch.
            let scope = CancellationToken::new();
            let _cancel_on_drop = scope.clone().drop_guard();
            aggregate(state.resolver.resolve(&request, &scope).await)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not decode request body");
            WireResponse::decode_error(e)
        }
    };

    encode(&response)
}

fn encode(response: &WireResponse) -> Response {
    match serde_json::to_vec(response) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Could not encode response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("can't convert response to JSON {e}"),
            )
                .into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.resolver.metrics().snapshot())
}
