//! Reactions, likes, pins and read receipts.

use axum::extract::State;
use parley_core::updates::ChatTarget;
use parley_core::AppState;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::middleware::{AuthUser, RequestDeadline, RpcJson};
use crate::response::Rpc;
use crate::routes::messages::MessageIdRequest;

#[derive(Deserialize)]
pub struct ReactionRequest {
    pub message_id: String,
    pub kind: String,
}

#[derive(Deserialize)]
pub struct PinnedRequest {
    pub peer_id: Option<String>,
    pub group_id: Option<String>,
}

pub async fn add_reaction(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<ReactionRequest>,
) -> Result<Rpc, ApiError> {
    let message = state
        .ops
        .add_reaction(&auth.claims, &body.message_id, &body.kind, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "message": message })))
}

pub async fn remove_reaction(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<ReactionRequest>,
) -> Result<Rpc, ApiError> {
    let message = state
        .ops
        .remove_reaction(&auth.claims, &body.message_id, &body.kind, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "message": message })))
}

pub async fn toggle_like(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<MessageIdRequest>,
) -> Result<Rpc, ApiError> {
    let (liked, message) = state
        .ops
        .toggle_like(&auth.claims, &body.message_id, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "liked": liked, "message": message })))
}

pub async fn pin_message(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<MessageIdRequest>,
) -> Result<Rpc, ApiError> {
    let message = state
        .ops
        .pin(&auth.claims, &body.message_id, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "message": message })))
}

pub async fn unpin_message(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<MessageIdRequest>,
) -> Result<Rpc, ApiError> {
    let message = state
        .ops
        .unpin(&auth.claims, &body.message_id, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "message": message })))
}

pub async fn get_pinned_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<PinnedRequest>,
) -> Result<Rpc, ApiError> {
    let target = ChatTarget::from_ids(body.peer_id.as_deref(), body.group_id.as_deref())?;
    let messages = state
        .ops
        .get_pinned(&auth.claims, &target, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "messages": messages })))
}

pub async fn mark_as_read(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<MessageIdRequest>,
) -> Result<Rpc, ApiError> {
    let message = state
        .ops
        .mark_read(&auth.claims, &body.message_id, deadline)
        .await?;
    Ok(Rpc::ok(json!({ "message": message })))
}
