//! HTTP status API served on the queue's listening port.
//!
//! Provides endpoints for:
//! - Health check (`/health`)
//! - Queue statistics (`/v1/stats`)
//! - Worker slot list (`/v1/workers`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::state::PoolState;

/// Response for a single worker slot.
#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    pub id: usize,
    pub status: String,
    pub current_task: Option<u64>,
    pub tasks_done: u64,
    pub last_change: String,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<PoolState>) -> Router {
    Router::new()
        .route("/v1/stats", get(stats_json))
        .route("/v1/workers", get(list_workers_json))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Queue statistics as JSON.
async fn stats_json(State(state): State<Arc<PoolState>>) -> impl IntoResponse {
    let stats = state.snapshot().await;
    Json(serde_json::json!({
        "session": state.session.as_str(),
        "started_at": state.started_at.to_rfc3339(),
        "stats": stats,
    }))
}

/// List worker slots as JSON.
async fn list_workers_json(State(state): State<Arc<PoolState>>) -> impl IntoResponse {
    let workers = state.workers.read().await;
    let response: Vec<WorkerResponse> = workers
        .iter()
        .map(|w| WorkerResponse {
            id: w.id,
            status: format!("{:?}", w.status).to_uppercase(),
            current_task: w.current_task.map(|t| t.get()),
            tasks_done: w.tasks_done,
            last_change: w.last_change.to_rfc3339(),
        })
        .collect();
    Json(response)
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(state): State<Arc<PoolState>>) -> impl IntoResponse {
    let stats = state.snapshot().await;
    let body = crate::metrics::render_metrics(&stats);
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use findr_core::SessionId;
    use tower::ServiceExt;

    async fn get_body(state: Arc<PoolState>, uri: &str) -> (StatusCode, String) {
        let response = create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_body(PoolState::new(SessionId::generate(), 1), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_stats_and_workers() {
        let state = PoolState::new(SessionId::generate(), 2);
        state.task_submitted().await;

        let (status, body) = get_body(state.clone(), "/v1/stats").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["session"], state.session.as_str());
        assert_eq!(json["stats"]["tasks_submitted"], 1);
        assert_eq!(json["stats"]["workers_idle"], 2);

        let (_, body) = get_body(state, "/v1/workers").await;
        let workers: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(workers.as_array().unwrap().len(), 2);
        assert_eq!(workers[0]["status"], "IDLE");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (status, body) = get_body(PoolState::new(SessionId::generate(), 1), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("# TYPE"));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (status, _) = get_body(PoolState::new(SessionId::generate(), 1), "/v2/nothing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
