//! Health check handlers for AMQP workers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`), backed by connection readiness
//! - Prometheus metrics (`/metrics`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connection::ConnectionManager;
use crate::metrics;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Connection whose readiness backs `/ready`.
    pub manager: ConnectionManager,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
}

impl HealthState {
    /// Create a new health state.
    pub fn new(
        manager: ConnectionManager,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: String,
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running. A broker outage must not
/// restart the pod; the reconnection actor heals it.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// 200 while a connection generation is live, 503 while reconnecting or
/// after the client was closed.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let snapshot = state.manager.snapshot();
    let generation = snapshot.generation.as_ref().map(|g| g.id);

    match snapshot.current() {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": {
                    "amqp": "ok",
                    "generation": generation,
                }
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {
                    "amqp": if snapshot.closed { "closed" } else { "reconnecting" },
                    "generation": generation,
                    "error": e.to_string(),
                }
            })),
        ),
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

/// Create a standard health router.
///
/// Routes: `/health`, `/healthz`, `/ready`, `/readyz`, `/metrics`.
pub fn health_router(state: HealthState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
