use axum::extract::State;
use parley_core::AppState;
use parley_db::groups::GroupRow;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::{AuthUser, RequestDeadline, RpcJson};
use crate::response::Rpc;

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct GroupMemberRequest {
    pub group_id: String,
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct GroupIdRequest {
    pub group_id: String,
}

fn group_json(group: &GroupRow) -> Value {
    json!({
        "id": group.id,
        "name": group.name,
        "owner_id": group.owner_id,
        "epoch": group.epoch,
        "created_at": group.created_at.to_rfc3339(),
    })
}

pub async fn create_group(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<CreateGroupRequest>,
) -> Result<Rpc, ApiError> {
    let group = state
        .groups
        .create(&auth.claims, &body.name, &body.member_ids, deadline)
        .await?;
    Ok(Rpc::created(json!({ "group": group_json(&group) })))
}

pub async fn add_group_member(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<GroupMemberRequest>,
) -> Result<Rpc, ApiError> {
    let epoch = state
        .groups
        .add_member(&auth.claims, &body.group_id, &body.user_id, deadline)
        .await?;
    Ok(Rpc::ok(json!({
        "group_id": body.group_id,
        "user_id": body.user_id,
        "epoch": epoch,
    })))
}

pub async fn remove_group_member(
    State(state): State<AppState>,
    auth: AuthUser,
    RequestDeadline(deadline): RequestDeadline,
    RpcJson(body): RpcJson<GroupMemberRequest>,
) -> Result<Rpc, ApiError> {
    let epoch = state
        .groups
        .remove_member(&auth.claims, &body.group_id, &body.user_id, deadline)
        .await?;
    Ok(Rpc::ok(json!({
        "group_id": body.group_id,
        "user_id": body.user_id,
        "epoch": epoch,
    })))
}

pub async fn get_users_in_group(
    State(state): State<AppState>,
    auth: AuthUser,
    RpcJson(body): RpcJson<GroupIdRequest>,
) -> Result<Rpc, ApiError> {
    let members = state
        .groups
        .users_in_group(&auth.claims, &body.group_id)
        .await?;
    Ok(Rpc::ok(json!({
        "group_id": body.group_id,
        "user_ids": members,
    })))
}
