//! JSON pull-surface: a plain request/response mirror of the websocket
//! transport for clients that cannot hold a push channel open.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CollabError, ErrorCode};
use crate::hub::HubStats;
use crate::operation::Operation;
use crate::protocol::{OperationRequest, RejectedOp, UserSnapshot};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/documents/:document_id/join", post(join))
        .route("/documents/:document_id/leave/:session_id", post(leave))
        .route("/documents/:document_id/operations", post(submit_op))
        .route("/documents/:document_id/operations/batch", post(submit_batch))
        .route("/documents/:document_id/sync", get(sync))
        .route("/documents/:document_id/cursor/:session_id", post(update_cursor))
        .route("/documents/:document_id/users", get(get_active_users))
        .route("/documents/:document_id/stats", get(get_stats))
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    user_id: Uuid,
}

#[derive(Debug, Serialize)]
struct JoinResponse {
    session_id: Uuid,
    current_version: u64,
    snapshot_text: String,
    active_users: Vec<UserSnapshot>,
}

async fn join(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let hub = state.registry.get_or_create(document_id).await;
    let session = state.sessions.open(document_id, req.user_id);
    let (outbound_tx, _outbound_rx) = tokio::sync::mpsc::channel(state.config.outbound_queue_capacity);

    let joined = hub.join(session.clone(), outbound_tx).await.map_err(CollabError::from)?;

    Ok(Json(JoinResponse {
        session_id: session.session_id,
        current_version: joined.current_version,
        snapshot_text: joined.snapshot_text,
        active_users: joined.active_users,
    }))
}

async fn leave(
    State(state): State<Arc<AppState>>,
    Path((document_id, session_id)): Path<(Uuid, Uuid)>,
) -> StatusCode {
    if let Some(hub) = state.registry.get(document_id) {
        hub.leave(session_id);
    }
    state.sessions.close(session_id);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct SubmitOpRequest {
    author: Uuid,
    base_version: u64,
    op: OperationRequest,
}

async fn submit_op(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
    Json(req): Json<SubmitOpRequest>,
) -> Result<Json<Vec<Operation>>, ApiError> {
    let hub = state
        .registry
        .get(document_id)
        .ok_or(CollabError::UnknownDocument(document_id))?;

    let accepted = hub.submit(req.author, req.op, req.base_version).await.map_err(CollabError::from)?;
    Ok(Json(accepted))
}

#[derive(Debug, Deserialize)]
struct SubmitBatchRequest {
    author: Uuid,
    base_version: u64,
    ops: Vec<OperationRequest>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    batch_id: Uuid,
    accepted: Vec<Operation>,
    rejected: Vec<RejectedOp>,
    final_version: u64,
}

async fn submit_batch(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
    Json(req): Json<SubmitBatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    let hub = state
        .registry
        .get(document_id)
        .ok_or(CollabError::UnknownDocument(document_id))?;

    let outcome = hub.submit_batch(req.author, req.ops, req.base_version).await.map_err(CollabError::from)?;
    Ok(Json(BatchResponse {
        batch_id: outcome.batch_id,
        accepted: outcome.accepted,
        rejected: outcome.rejected,
        final_version: outcome.final_version,
    }))
}

#[derive(Debug, Deserialize)]
struct SyncQuery {
    known_version: u64,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    current_version: u64,
    operations_since: Vec<Operation>,
    active_users: Vec<UserSnapshot>,
}

async fn sync(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
    axum::extract::Query(query): axum::extract::Query<SyncQuery>,
) -> Result<Json<SyncResponse>, ApiError> {
    let hub = state
        .registry
        .get(document_id)
        .ok_or(CollabError::UnknownDocument(document_id))?;

    let outcome = hub.sync(query.known_version).await.map_err(CollabError::from)?;
    Ok(Json(SyncResponse {
        current_version: outcome.current_version,
        operations_since: outcome.operations_since,
        active_users: outcome.active_users,
    }))
}

#[derive(Debug, Deserialize)]
struct CursorRequest {
    position: u64,
    selection_start: u64,
    selection_end: u64,
}

async fn update_cursor(
    State(state): State<Arc<AppState>>,
    Path((document_id, session_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<CursorRequest>,
) -> Result<StatusCode, ApiError> {
    let hub = state
        .registry
        .get(document_id)
        .ok_or(CollabError::UnknownDocument(document_id))?;

    state
        .sessions
        .update_cursor(session_id, req.position, req.selection_start, req.selection_end);
    hub.update_presence(session_id, req.position, req.selection_start, req.selection_end);
    Ok(StatusCode::NO_CONTENT)
}

async fn get_active_users(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<Vec<UserSnapshot>>, ApiError> {
    state
        .registry
        .get(document_id)
        .ok_or(CollabError::UnknownDocument(document_id))?;

    let sessions = state.sessions.active_in_document(document_id);
    Ok(Json(sessions.iter().map(UserSnapshot::from).collect()))
}

async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<HubStats>, ApiError> {
    let hub = state
        .registry
        .get(document_id)
        .ok_or(CollabError::UnknownDocument(document_id))?;

    let stats = hub.stats().await.map_err(CollabError::from)?;
    Ok(Json(stats))
}

/// Maps `CollabError` onto the documented HTTP statuses for the pull surface.
struct ApiError(CollabError);

impl From<CollabError> for ApiError {
    fn from(err: CollabError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            ErrorCode::StaleBase => StatusCode::CONFLICT,
            ErrorCode::InvalidPosition => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::UnknownDocument => StatusCode::NOT_FOUND,
            ErrorCode::SessionClosed => StatusCode::GONE,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "code": code.as_str(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
