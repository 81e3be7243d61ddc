use axum::extract::State;
use parley_core::updates::ChatTarget;
use parley_core::AppState;
use parley_models::ChatMessage;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::middleware::{AuthUser, RequestDeadline, RpcJson};
use crate::response::Rpc;
use crate::routes::scheduled::scheduled_json;

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub message: ChatMessage,
}

#[derive(Deserialize)]
pub struct GetMessagesRequest {
    pub peer_id: Option<String>,
    pub group_id: Option<String>,
    pub before: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct MessageIdRequest {
    pub message_id: String,
}

#[derive(Deserialize)]
pub struct GetThreadRequest {
    pub parent_message_id: String,
}

#[derive(Deserialize)]
pub struct EditMessageRequest {
    pub message_id: String,
    pub content: String,
}

/// `SendMessage`: the stream pipeline without an originating session.
pub async fn send_message(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<SendMessageRequest>,
) -> Result<Rpc, ApiError> {
    let message = body.message;
    if message.is_scheduled || message.scheduled_at.is_some() {
        let row = state
            .pipeline
            .schedule(&auth.claims, message, deadline)
            .await?;
        return Ok(Rpc::created(json!({ "scheduled": scheduled_json(&row) })));
    }
    let saved = state
        .pipeline
        .submit(&auth.claims, None, false, message, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "message": saved })))
}

pub async fn get_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<GetMessagesRequest>,
) -> Result<Rpc, ApiError> {
    let target = ChatTarget::from_ids(body.peer_id.as_deref(), body.group_id.as_deref())?;
    let messages = state
        .ops
        .get_messages(
            &auth.claims,
            &target,
            body.before.as_deref(),
            body.limit,
            deadline,
        )
        .await?;
    Ok(Rpc::ok(json!({ "messages": messages })))
}

pub async fn get_message(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<MessageIdRequest>,
) -> Result<Rpc, ApiError> {
    let message = state
        .ops
        .visible_message(&auth.claims, &body.message_id, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "message": message })))
}

pub async fn get_thread_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<GetThreadRequest>,
) -> Result<Rpc, ApiError> {
    let messages = state
        .ops
        .get_thread(&auth.claims, &body.parent_message_id, deadline)
        .await?;
    Ok(Rpc::ok(json!({
        "parent_message_id": body.parent_message_id,
        "messages": messages,
    })))
}

pub async fn edit_message(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<EditMessageRequest>,
) -> Result<Rpc, ApiError> {
    let message = state
        .ops
        .edit(&auth.claims, &body.message_id, &body.content, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "message": message })))
}

pub async fn delete_message(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<MessageIdRequest>,
) -> Result<Rpc, ApiError> {
    let tombstone = state
        .ops
        .delete(&auth.claims, &body.message_id, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "message": tombstone })))
}

