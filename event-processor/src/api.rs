//! HTTP control surface: health, start/stop, failure injection tuning, recent activity.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::cache::RecentActivityCache;
use crate::fault::FailureInjectionPolicy;
use crate::health::{HealthRegistry, HealthStatus};
use crate::supervisor::{ProcessingSupervisor, SupervisorError};
use crate::SERVICE_NAME;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ProcessingSupervisor>,
    pub cache: Option<RecentActivityCache>,
    pub liveness: HealthRegistry,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::AlreadyRunning => ApiError::Conflict(err.to_string()),
            SupervisorError::InvalidPolicy(_) => ApiError::BadRequest(err.to_string()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(liveness))
        .route("/health", routing::get(health))
        .route("/start-processing", routing::post(start_processing))
        .route("/stop-processing", routing::post(stop_processing))
        .route(
            "/failure-injection",
            routing::get(get_failure_injection).post(set_failure_injection),
        )
        .route("/recent-events/:event_type", routing::get(recent_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn index() -> &'static str {
    SERVICE_NAME
}

async fn liveness(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let status = state.supervisor.status();
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "timestamp": status.timestamp,
        "running": status.running,
    }))
}

async fn start_processing(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.supervisor.start().await?;
    Ok(Json(json!({ "message": "Event processing started" })))
}

async fn stop_processing(State(state): State<AppState>) -> Json<Value> {
    let stopped = state.supervisor.stop().await;
    let message = if stopped {
        "Event processing stopped"
    } else {
        "Event processing was not running"
    };
    Json(json!({ "message": message, "stopped": stopped }))
}

async fn get_failure_injection(State(state): State<AppState>) -> Json<Value> {
    let current = state.supervisor.failure_injection();
    Json(json!({
        "enabled": current.policy.enabled,
        "latency_probability": current.policy.latency_probability,
        "error_probability": current.policy.error_probability,
        "service": SERVICE_NAME,
        "last_updated": current.last_updated,
    }))
}

async fn set_failure_injection(
    State(state): State<AppState>,
    Json(policy): Json<FailureInjectionPolicy>,
) -> Result<Json<Value>, ApiError> {
    let updated = state.supervisor.set_failure_injection(policy)?;
    Ok(Json(json!({
        "message": "Failure injection configuration updated",
        "config": updated.policy,
        "timestamp": Utc::now(),
    })))
}

async fn recent_events(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(cache) = &state.cache else {
        return Err(ApiError::NotFound(
            "recent activity cache is not configured".to_string(),
        ));
    };

    let events = cache.recent(&event_type).await.map_err(|e| {
        error!(%event_type, error = %e, "Failed to read recent events");
        ApiError::Internal("failed to read recent events".to_string())
    })?;

    Ok(Json(json!({
        "event_type": event_type,
        "count": events.len(),
        "events": events,
    })))
}
