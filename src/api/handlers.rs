//! Research API handlers

use crate::error::ResearchError;
use crate::metrics::METRICS;
use crate::research::{Confirmation, ResearchOrchestrator, SessionStatus, StartRequest};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Application state shared by the handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ResearchOrchestrator>,
}

/// Error payload
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

fn status_code(err: &ResearchError) -> StatusCode {
    match err {
        ResearchError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        ResearchError::SessionBusy(_)
        | ResearchError::InvalidTransition { .. }
        | ResearchError::Cancelled(_) => StatusCode::CONFLICT,
        ResearchError::InvalidRequest(_) | ResearchError::InvalidConfirmation(_) => {
            StatusCode::BAD_REQUEST
        }
        ResearchError::PlanDecode(_) | ResearchError::Model(_) | ResearchError::Search(_) => {
            StatusCode::BAD_GATEWAY
        }
        ResearchError::Configuration(_) | ResearchError::Prompt(_) | ResearchError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ResearchError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        (status, Json(ApiError::new(self.kind(), self.to_string()))).into_response()
    }
}

/// Start a research session
///
/// POST /api/research/start
pub async fn start_research(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<SessionStatus>, ResearchError> {
    info!("Research start request: topic={:?}", request.topic);
    let status = state.orchestrator.start_session(request).await?;
    Ok(Json(status))
}

/// Confirm or revise the proposed plan
///
/// POST /api/research/confirm-plan
pub async fn confirm_plan(
    State(state): State<AppState>,
    Json(confirmation): Json<Confirmation>,
) -> Result<Json<SessionStatus>, ResearchError> {
    info!(
        "Plan decision for session {}: {}",
        confirmation.session_id, confirmation.user_confirm
    );
    let status = state.orchestrator.resume_detached(confirmation).await?;
    Ok(Json(status))
}

/// GET /api/research/status/:session_id
pub async fn research_status(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionStatus>, ResearchError> {
    Ok(Json(state.orchestrator.status(session_id).await?))
}

/// POST /api/research/:session_id/cancel
pub async fn cancel_research(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionStatus>, ResearchError> {
    Ok(Json(state.orchestrator.cancel(session_id).await?))
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.export_prometheus(),
    )
}
