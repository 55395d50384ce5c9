//! REST handlers under `/api`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use loom_core::{ErrorKind, Event, PromptId, SessionId};
use loom_engine::{CancelOutcome, CloseReason, SessionSnapshot, SubmitOutcome, SubmitRequest};
use loom_store::{MoveDirection, QueuedPrompt, ReadOrder, Session, SessionStatus};

use crate::error::ApiError;
use crate::server::AppState;

type ApiResult<T> = Result<T, ApiError>;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "connections": state.hub.count(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub workspace_ref: String,
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    if body.workspace_ref.trim().is_empty() {
        return Err(ApiError::invalid("workspace_ref is required"));
    }
    let session = state.sessions.create(&body.workspace_ref, body.title.as_deref())?;
    info!(session_id = %session.id, workspace_ref = %session.workspace_ref, "session created");
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub include_archived: bool,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.sessions.list(query.include_archived)?))
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub runtime: SessionSnapshot,
    pub connections: usize,
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    let id = SessionId::from_raw(id);
    let session = state.sessions.get(&id)?;
    let snapshot = state.coordinator.snapshot(&id)?;
    Ok(Json(SessionView {
        session,
        runtime: snapshot,
        connections: state.hub.session_connections(&id).len(),
    }))
}

pub async fn archive_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    let id = SessionId::from_raw(id);
    let session = state.sessions.get(&id)?;
    if session.status == SessionStatus::Archived {
        return Ok(Json(session));
    }
    state.coordinator.close_session(&id, CloseReason::Archived)?;
    state.sessions.set_status(&id, SessionStatus::Archived)?;
    state.hub.close_session(&id, "archived").await;
    info!(session_id = %id, "session archived");
    Ok(Json(state.sessions.get(&id)?))
}

/// Close the session for new work, fail its queue visibly, disconnect its
/// viewers, then remove its rows.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = SessionId::from_raw(id);
    if !state.sessions.exists(&id)? {
        return Err(ApiError::new(ErrorKind::NotFound, format!("session {id} not found")));
    }
    let dropped = state.coordinator.close_session(&id, CloseReason::Deleted)?;
    state.hub.close_session(&id, "deleted").await;
    state.sessions.delete(&id)?;
    state.coordinator.forget(&id);
    info!(session_id = %id, dropped_prompts = dropped.len(), "session deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub since_seq: Option<u64>,
    pub before_seq: Option<u64>,
    pub limit: Option<u32>,
    pub order: Option<ReadOrder>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<Event>>> {
    let id = SessionId::from_raw(id);
    let limit = query
        .limit
        .unwrap_or(state.config.history_default_limit)
        .min(state.config.history_max_limit);
    let order = query.order.unwrap_or_default();
    let events = match (query.since_seq, query.before_seq) {
        (Some(_), Some(_)) => {
            return Err(ApiError::invalid("since_seq and before_seq are mutually exclusive"));
        }
        (_, Some(before)) => state.log.read_before(&id, before, limit, order)?,
        (since, None) => state.log.read(&id, since, Some(limit), order)?,
    };
    Ok(Json(events))
}

pub async fn list_queue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<QueuedPrompt>>> {
    let id = SessionId::from_raw(id);
    Ok(Json(state.coordinator.list_queue(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub text: String,
    #[serde(default)]
    pub prompt_id: Option<PromptId>,
}

/// Same semantics as a WebSocket submit: starts a turn when idle.
pub async fn enqueue(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<(StatusCode, Json<SubmitOutcome>)> {
    let id = SessionId::from_raw(id);
    let mut request = SubmitRequest::new(body.text);
    if let Some(prompt_id) = body.prompt_id {
        request = request.with_prompt_id(prompt_id);
    }
    let outcome = state.coordinator.submit(&id, request)?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

pub async fn remove_queued(
    State(state): State<AppState>,
    Path((id, prompt_id)): Path<(String, String)>,
) -> ApiResult<Json<QueuedPrompt>> {
    let id = SessionId::from_raw(id);
    let removed = state
        .coordinator
        .remove_queued(&id, &PromptId::from_raw(prompt_id))?;
    Ok(Json(removed))
}

#[derive(Debug, Deserialize)]
pub struct MoveBody {
    pub direction: MoveDirection,
}

pub async fn move_queued(
    State(state): State<AppState>,
    Path((id, prompt_id)): Path<(String, String)>,
    Json(body): Json<MoveBody>,
) -> ApiResult<Json<Vec<QueuedPrompt>>> {
    let id = SessionId::from_raw(id);
    state
        .coordinator
        .move_queued(&id, &PromptId::from_raw(prompt_id), body.direction)?;
    Ok(Json(state.coordinator.list_queue(&id)?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = SessionId::from_raw(id);
    let outcome = state.coordinator.cancel(&id)?;
    Ok(Json(json!({ "cancelled": outcome == CancelOutcome::Cancelled })))
}
