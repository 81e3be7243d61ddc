use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_models::ResponseEnvelope;
use serde::Serialize;
use serde_json::Value;

/// A successful unary result; the HTTP status follows `status_code`.
pub struct Rpc<T = Value>(pub ResponseEnvelope<T>);

impl<T> Rpc<T> {
    pub fn ok(value: T) -> Self {
        Rpc(ResponseEnvelope::ok(value))
    }

    pub fn created(value: T) -> Self {
        Rpc(ResponseEnvelope::created(value))
    }
}

impl<T: Serialize> IntoResponse for Rpc<T> {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code as u16).unwrap_or(StatusCode::OK);
        (status, Json(self.0)).into_response()
    }
}
