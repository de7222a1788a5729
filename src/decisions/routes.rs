//! REST endpoints for listing suspended runs and resuming them.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Error};
use crate::store::Checkpoint;
use crate::workflow::{Engine, HumanDecision, RunStatus};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct DecisionState {
    pub engine: Arc<Engine>,
}

/// Build the Axum router for the decision channel.
pub fn decision_routes(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/runs/suspended", get(list_suspended))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/resume", post(resume_run))
        .layer(CorsLayer::permissive())
        .with_state(DecisionState { engine })
}

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn error_response(err: Error) -> ApiResponse {
    let status = match &err {
        Error::Engine(EngineError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Engine(EngineError::InvalidState { .. }) => StatusCode::CONFLICT,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "Decision request failed");
    }
    error_body(status, err.to_string())
}

fn parse_run_id(id: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(id).map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid run ID"))
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-inbox"
    }))
}

// ── Runs ────────────────────────────────────────────────────────────

/// What a reviewer needs to decide on a suspended run.
#[derive(Debug, Serialize, Deserialize)]
pub struct PendingReview {
    pub run_id: Uuid,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub draft: Option<String>,
    pub revision: u32,
    pub suspended_at: DateTime<Utc>,
}

impl From<Checkpoint> for PendingReview {
    fn from(checkpoint: Checkpoint) -> Self {
        let state = checkpoint.state;
        Self {
            run_id: checkpoint.run_id,
            message_id: state.message.id,
            sender: state.message.sender,
            subject: state.message.subject,
            draft: state.draft,
            revision: state.revision,
            suspended_at: checkpoint.suspended_at,
        }
    }
}

async fn list_suspended(State(state): State<DecisionState>) -> impl IntoResponse {
    match state.engine.list_suspended().await {
        Ok(checkpoints) => {
            let pending: Vec<PendingReview> =
                checkpoints.into_iter().map(PendingReview::from).collect();
            (StatusCode::OK, Json(serde_json::json!(pending)))
        }
        Err(e) => error_response(e),
    }
}

async fn get_run(State(state): State<DecisionState>, Path(id): Path<String>) -> impl IntoResponse {
    let run_id = match parse_run_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.get_state(run_id).await {
        Ok(run) => (StatusCode::OK, Json(serde_json::json!(run))),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    decision: HumanDecision,
    #[serde(default)]
    edited_draft: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResumeResponse {
    run_id: Uuid,
    status: RunStatus,
}

async fn resume_run(
    State(state): State<DecisionState>,
    Path(id): Path<String>,
    Json(body): Json<ResumeRequest>,
) -> impl IntoResponse {
    let run_id = match parse_run_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    info!(run_id = %run_id, decision = %body.decision, "Decision received");
    match state
        .engine
        .resume(run_id, body.decision, body.edited_draft)
        .await
    {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::json!(ResumeResponse { run_id, status })),
        ),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DatabaseError, ValidationError};

    #[test]
    fn errors_map_to_status_codes() {
        let id = Uuid::new_v4();
        let cases = [
            (
                Error::from(EngineError::NotFound { id }),
                StatusCode::NOT_FOUND,
            ),
            (
                Error::from(EngineError::InvalidState {
                    id,
                    status: RunStatus::Completed,
                    operation: "resume".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                Error::from(ValidationError::MissingField("body")),
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::from(DatabaseError::Query("locked".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::from(EngineError::InvariantViolation {
                    id,
                    reason: "bad".into(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(err).0, expected);
        }
    }

    #[test]
    fn resume_request_accepts_missing_draft() {
        let body: ResumeRequest = serde_json::from_str(r#"{"decision": "accept"}"#).unwrap();
        assert_eq!(body.decision, HumanDecision::Accept);
        assert!(body.edited_draft.is_none());
        assert!(serde_json::from_str::<ResumeRequest>(r#"{"decision": "maybe"}"#).is_err());
    }
}
