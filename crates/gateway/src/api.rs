//! HTTP API handlers and routes using axum.
//!
//! Routes:
//! - GET /health - Health check
//! - GET /entries - List all entries
//! - GET /entries/{key} - Read one entry
//! - POST /entries/{key} - Write an entry and fan the change out
//! - GET /ws - Push channel (see `ws_server`)

use crate::config::GatewayConfig;
use crate::sequencer::ChangeEvent;
use crate::service::GatewayService;
use crate::ws_server::ws_handler;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use store_client::{Entry, StoreError};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

/// Shared application state.
pub struct AppState {
    pub service: Arc<GatewayService>,
    pub config: GatewayConfig,
}

/// Create the HTTP + WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/entries", get(list_entries_handler))
        .route("/entries/{key}", get(get_entry_handler).post(set_entry_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub subscribers: usize,
    pub sequence: u64,
}

/// Health check endpoint.
/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let hub = state.service.hub();
    Json(HealthResponse {
        status: "ok".to_string(),
        subscribers: hub.registry().len(),
        sequence: hub.current_sequence(),
    })
}

/// List all entries.
/// GET /entries
async fn list_entries_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    let entries = state.service.list().await?;
    Ok(Json(entries))
}

/// Read one entry.
/// GET /entries/{key}
async fn get_entry_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Entry>, ApiError> {
    let value = state.service.get(&key).await?;
    Ok(Json(Entry { key, value }))
}

/// Body of a write request.
#[derive(Debug, Deserialize)]
pub struct SetEntryRequest {
    pub value: String,
}

/// Write an entry.
/// POST /entries/{key}
async fn set_entry_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<SetEntryRequest>,
) -> Result<Json<ChangeEvent>, ApiError> {
    let event = state.service.set(&key, &req.value).await?;
    Ok(Json(event))
}

// ============================================================================
// Error Handling
// ============================================================================

/// API error: a store failure mapped onto an HTTP status.
#[derive(Debug)]
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub retryable: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Config(_) => {
                error!("Store client misconfigured: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
            retryable: self.0.is_retryable(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::FanoutHub;
    use crate::protocol::{decode_frame, ServerMessage};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use store_client::MemoryStore;
    use tower::ServiceExt;

    fn app(store: Arc<MemoryStore>) -> (Router, Arc<GatewayService>) {
        let service = Arc::new(GatewayService::new(store, Arc::new(FanoutHub::new(16, 16))));
        let state = Arc::new(AppState {
            service: service.clone(),
            config: GatewayConfig::default(),
        });
        (create_router(state), service)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(key: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/entries/{}", key))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_post_then_get_and_list() {
        let (app, service) = app(Arc::new(MemoryStore::new()));
        let mut conn = service.hub().connect(None);

        let response = app
            .clone()
            .oneshot(post("a", serde_json::json!({ "value": "1" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let event: ChangeEvent = body_json(response).await;
        assert_eq!(event.sequence, 1);
        assert_eq!(event.key, "a");

        let response = app.clone().oneshot(get_req("/entries/a")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let entry: Entry = body_json(response).await;
        assert_eq!(entry, Entry::new("a", "1"));

        let response = app.clone().oneshot(get_req("/entries")).await.unwrap();
        let entries: Vec<Entry> = body_json(response).await;
        assert_eq!(entries, vec![Entry::new("a", "1")]);

        let frames: Vec<ServerMessage> = std::iter::from_fn(|| conn.frames.try_recv().ok())
            .map(decode_frame)
            .collect();
        assert_eq!(
            frames.last(),
            Some(&ServerMessage::Change { sequence: 1, key: "a".into(), value: "1".into() })
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_404() {
        let (app, _) = app(Arc::new(MemoryStore::new()));

        let response = app.oneshot(get_req("/entries/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.code, "NOT_FOUND");
        assert!(!body.retryable);
    }

    #[tokio::test]
    async fn test_rejected_write_is_422_and_not_sequenced() {
        let store = Arc::new(MemoryStore::new());
        store.reject_value("bad");
        let (app, service) = app(store);

        let response = app
            .oneshot(post("a", serde_json::json!({ "value": "bad" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.code, "STORE_REJECTED");
        assert_eq!(service.hub().current_sequence(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_retryable_503() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(1);
        let (app, _) = app(store);

        let response = app.oneshot(get_req("/entries")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: ErrorResponse = body_json(response).await;
        assert!(body.retryable);
    }

    #[tokio::test]
    async fn test_health_reports_sequence_and_subscribers() {
        let (app, service) = app(Arc::new(MemoryStore::new()));
        let _conn = service.hub().connect(None);
        service.set("a", "1").await.unwrap();

        let response = app.oneshot(get_req("/health")).await.unwrap();
        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.subscribers, 1);
        assert_eq!(health.sequence, 1);
    }
}
