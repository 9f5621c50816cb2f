//! HTTP gossip transport: an axum server surface and a reqwest client.
//!
//! The server exposes the two gossip exchanges plus a small read-only API
//! for operators and the local operation submission endpoint. The client
//! maps transport failures into the gossip error taxonomy, preserving
//! HTTP status codes.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::node::{LocalApi, SubmitError};
use crate::store::EventStore;

use super::{GossipError, GossipServer, GossipTransport, NotifyRequest, PullReply, PullRequest};

/// Shared HTTP state.
#[derive(Clone)]
pub struct HttpState {
    pub gossip: Arc<GossipServer>,
    pub store: Arc<EventStore>,
    pub api: Option<Arc<LocalApi>>,
}

/// Build the gossip router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/gossip/pull", post(handle_pull))
        .route("/gossip/notify", post(handle_notify))
        .route("/operations", post(submit_operation))
        .route("/blocks/latest", get(latest_block))
        .route("/blocks/{height}", get(block_at))
        .route("/health", get(health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(crate::constants::MAX_WIRE_MESSAGE_BYTES))
}

/// Serve the router until the listener fails or the task is dropped.
pub async fn serve(listener: tokio::net::TcpListener, state: HttpState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

async fn handle_pull(
    State(state): State<HttpState>,
    Json(request): Json<PullRequest>,
) -> Json<PullReply> {
    Json(state.gossip.handle_pull(&request))
}

async fn handle_notify(
    State(state): State<HttpState>,
    Json(request): Json<NotifyRequest>,
) -> StatusCode {
    if state.gossip.handle_notify(&request) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn submit_operation(
    State(state): State<HttpState>,
    Json(payload): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(api) = &state.api else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "operations disabled" })),
        );
    };
    match api.submit(payload) {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "ok": true }))),
        Err(SubmitError::Overloaded) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "operation queue full" })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn latest_block(State(state): State<HttpState>) -> Json<serde_json::Value> {
    let block = state.store.latest_block();
    Json(serde_json::to_value(&block).unwrap_or(serde_json::Value::Null))
}

async fn block_at(
    State(state): State<HttpState>,
    Path(height): Path<u64>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.block_at(height) {
        Ok(Some(block)) => (
            StatusCode::OK,
            Json(serde_json::to_value(&block).unwrap_or(serde_json::Value::Null)),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown block" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn health(State(state): State<HttpState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ledger": state.store.ledger().to_multibase(),
        "blockHeight": state.store.latest_block().height,
        "events": state.store.event_count(),
    }))
}

/// HTTP client side of the gossip protocol.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .expect("reqwest client construction cannot fail");
        HttpTransport { client }
    }

    fn network_error(address: &str, e: reqwest::Error) -> GossipError {
        GossipError::Network {
            address: address.to_string(),
            detail: e.to_string(),
            http_status: e.status().map(|s| s.as_u16()),
        }
    }
}

#[async_trait]
impl GossipTransport for HttpTransport {
    async fn pull(&self, address: &str, request: PullRequest) -> Result<PullReply, GossipError> {
        let response = self
            .client
            .post(format!("{address}/gossip/pull"))
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::network_error(address, e))?;
        let status = response.status();
        if !status.is_success() {
            // HTTP 404 (and any other transport-level status) surfaces as
            // a network error with the status preserved; "ledger unknown"
            // arrives in-band as PullReply::NotFound.
            return Err(GossipError::Network {
                address: address.to_string(),
                detail: format!("unexpected status {status}"),
                http_status: Some(status.as_u16()),
            });
        }
        response
            .json::<PullReply>()
            .await
            .map_err(|e| GossipError::Validation {
                address: address.to_string(),
                detail: format!("malformed pull reply: {e}"),
            })
    }

    async fn notify(&self, address: &str, request: NotifyRequest) -> Result<(), GossipError> {
        self.client
            .post(format!("{address}/gossip/notify"))
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::network_error(address, e))?;
        Ok(())
    }
}
