use axum::extract::State;
use parley_core::AppState;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::middleware::{AuthUser, RpcJson};
use crate::response::Rpc;

#[derive(Deserialize)]
pub struct ForceDisconnectRequest {
    pub user_id: String,
}

pub async fn force_disconnect(
    State(state): State<AppState>,
    auth: AuthUser,
    RpcJson(body): RpcJson<ForceDisconnectRequest>,
) -> Result<Rpc, ApiError> {
    let closed = state.force_disconnect(&auth.claims, &body.user_id)?;
    Ok(Rpc::ok(json!({
        "user_id": body.user_id.trim(),
        "sessions_closed": closed,
    })))
}
