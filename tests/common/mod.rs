#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use serde_json::Value;

use plexer_rs::consumers::{AuthKind, ConsumerDescriptor};

/// One request captured by a stub consumer
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// A local HTTP listener standing in for a downstream consumer
#[derive(Clone)]
pub struct StubConsumer {
    pub url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubConsumer {
    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct StubState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    status: u16,
    delay: Option<Duration>,
}

async fn record(
    State(state): State<StubState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(delay) = state.delay {
        tokio::time::sleep(delay).await;
    }

    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);

    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers,
        body,
    });

    StatusCode::from_u16(state.status).unwrap()
}

/// Spawn a stub consumer answering every request with `status`.
pub async fn spawn_stub_consumer(status: u16) -> StubConsumer {
    spawn_stub_with_delay(status, None).await
}

/// Spawn a stub consumer that sleeps before answering.
pub async fn spawn_stub_with_delay(status: u16, delay: Option<Duration>) -> StubConsumer {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = StubState {
        requests: Arc::clone(&requests),
        status,
        delay,
    };
    let app = Router::new().fallback(record).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StubConsumer {
        url: format!("http://{addr}/events"),
        requests,
    }
}

/// URL on a local port that refuses connections.
pub async fn refused_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/events")
}

pub fn consumer(
    key: &str,
    label: &str,
    url: &str,
    token: Option<&str>,
    auth_kind: AuthKind,
) -> ConsumerDescriptor {
    ConsumerDescriptor {
        key: key.to_string(),
        label: label.to_string(),
        url: url.to_string(),
        token: token.map(str::to_string),
        auth_kind,
    }
}
