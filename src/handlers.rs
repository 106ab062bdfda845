use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::envelope::validate_envelope;
use crate::metrics::Metrics;
use crate::queue::FailureQueue;

/// Largest accepted request body; larger bodies are rejected with 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub environment: String,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<FailureQueue>,
    pub metrics: Metrics,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/events", post(ingest_event))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": "Welcome to plexer",
        "environment": state.environment
    }))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Delivery report: live in-flight count plus the counters maintained by the
/// failure queue and the retry worker.
async fn status(State(state): State<AppState>) -> Json<Value> {
    let counters = state.queue.counters_snapshot();
    Json(json!({
        "type": "plexer.delivery.report.v1",
        "source": "plexer",
        "payload": {
            "counts": {
                "pending": state.dispatcher.pending(),
                "failed": counters.failed
            },
            "last_error": counters.last_error,
            "last_retry_at": counters.last_retry_at,
            "retryable_now": counters.retryable_now,
            "next_due_at": counters.next_due_at
        }
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Ingress: validate the envelope, answer 202, and fan out asynchronously.
async fn ingest_event(State(state): State<AppState>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            state
                .metrics
                .events_received_total
                .with_label_values(&["rejected"])
                .inc();
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": "Invalid JSON"})),
            )
                .into_response();
        }
    };

    let event = match validate_envelope(&value) {
        Ok(event) => event,
        Err(e) => {
            state
                .metrics
                .events_received_total
                .with_label_values(&["rejected"])
                .inc();
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": e.to_string()})),
            )
                .into_response();
        }
    };

    state
        .metrics
        .events_received_total
        .with_label_values(&["accepted"])
        .inc();
    tracing::info!(
        event_type = %event.event_type,
        source = %event.source,
        "Event accepted"
    );

    state.dispatcher.dispatch(event);

    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted"})),
    )
        .into_response()
}

async fn not_found(method: Method, uri: Uri) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "status": "error",
            "message": "Not Found",
            "path": uri.path(),
            "method": method.as_str()
        })),
    )
}
