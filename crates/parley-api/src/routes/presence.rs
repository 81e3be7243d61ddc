use axum::extract::State;
use parley_core::AppState;
use parley_models::PresenceStatus;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::middleware::{AuthUser, RpcJson};
use crate::response::Rpc;

const MAX_PRESENCE_LOOKUP: usize = 500;

#[derive(Deserialize)]
pub struct UpdatePresenceRequest {
    pub status: String,
    pub custom_message: Option<String>,
}

#[derive(Deserialize)]
pub struct GetPresenceRequest {
    #[serde(default)]
    pub user_ids: Vec<String>,
}

pub async fn update_presence_status(
    State(state): State<AppState>,
    auth: AuthUser,
    RpcJson(body): RpcJson<UpdatePresenceRequest>,
) -> Result<Rpc, ApiError> {
    let status = PresenceStatus::parse(body.status.trim())
        .ok_or_else(|| ApiError::BadRequest(format!("unknown status {}", body.status)))?;
    let record = state
        .update_presence(&auth.claims, status, body.custom_message)
        .await?;
    Ok(Rpc::ok(json!({ "presence": record })))
}

/// Reads the lock-free snapshot; unknown users come back offline.
pub async fn get_presence(
    State(state): State<AppState>,
    _auth: AuthUser,
    RpcJson(body): RpcJson<GetPresenceRequest>,
) -> Result<Rpc, ApiError> {
    if body.user_ids.len() > MAX_PRESENCE_LOOKUP {
        return Err(ApiError::BadRequest(format!(
            "at most {MAX_PRESENCE_LOOKUP} user_ids per request"
        )));
    }
    let records = state
        .presence
        .get_many(body.user_ids.iter().map(String::as_str));
    Ok(Rpc::ok(json!({ "presences": records })))
}
