//! HTTP surface of the worker
//!
//! Routes:
//! - `GET /health` - liveness, unauthenticated
//! - `POST /projects` - provision a project's host
//! - `DELETE /projects/{namespace}/{name}` - tear a host down
//! - `GET /metrics` - Prometheus text exposition
//!
//! Everything except `/health` sits behind [`auth::require_shared_secret`].

pub mod auth;
pub mod projects;

use std::any::Any;
use std::sync::Arc;

use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::health::HealthRegistry;
use crate::metrics;
use crate::provision::ProvisioningOrchestrator;
use crate::Error;

/// Shared state of the handlers
#[derive(Clone)]
pub struct AppState {
    /// Provisioning pipeline
    pub orchestrator: Arc<ProvisioningOrchestrator>,
    /// Health registry, also the source of the shared secret
    pub health: HealthRegistry,
}

impl AppState {
    /// State around an orchestrator and its health registry
    pub fn new(orchestrator: Arc<ProvisioningOrchestrator>) -> Self {
        let health = orchestrator.health().clone();
        Self {
            orchestrator,
            health,
        }
    }
}

/// Build the worker's router
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/projects", post(projects::create_project))
        .route(
            "/projects/{namespace}/{name}",
            delete(projects::delete_project),
        )
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_shared_secret,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "apiVersion": "v1",
        "message": "cool and well",
    }))
}

async fn metrics_handler() -> Result<Response, Error> {
    let body = metrics::render().map_err(|e| Error::internal(e.to_string()))?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %detail, "Request handler panicked");
    Error::internal("request handler panicked").into_response()
}
