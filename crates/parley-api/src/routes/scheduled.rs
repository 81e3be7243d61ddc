use axum::extract::State;
use parley_core::AppState;
use parley_db::scheduled::ScheduledRow;
use parley_models::ChatMessage;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::{AuthUser, RequestDeadline, RpcJson};
use crate::response::Rpc;

#[derive(Deserialize)]
pub struct ScheduleMessageRequest {
    pub message: ChatMessage,
}

#[derive(Deserialize)]
pub struct CancelScheduledRequest {
    pub scheduled_id: String,
}

pub(crate) fn scheduled_json(row: &ScheduledRow) -> Value {
    json!({
        "id": row.id,
        "sender_id": row.sender_id,
        "scheduled_at": row.scheduled_at.to_rfc3339(),
        "created_at": row.created_at.to_rfc3339(),
        "message": row.message,
    })
}

/// Stored only; delivery belongs to the external scheduler.
pub async fn schedule_message(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<ScheduleMessageRequest>,
) -> Result<Rpc, ApiError> {
    let row = state
        .pipeline
        .schedule(&auth.claims, body.message, deadline)
        .await?;
    Ok(Rpc::created(json!({ "scheduled": scheduled_json(&row) })))
}

pub async fn cancel_scheduled_message(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<CancelScheduledRequest>,
) -> Result<Rpc, ApiError> {
    state
        .pipeline
        .cancel_scheduled(&auth.claims, &body.scheduled_id, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "scheduled_id": body.scheduled_id, "cancelled": true })))
}

pub async fn list_scheduled_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
) -> Result<Rpc, ApiError> {
    let rows = state.pipeline.list_scheduled(&auth.claims, deadline).await?;
    let scheduled: Vec<Value> = rows.iter().map(scheduled_json).collect();
    Ok(Rpc::ok(json!({ "scheduled": scheduled })))
}
