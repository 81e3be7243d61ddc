use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::CoreError;
use parley_models::stream::code;
use parley_models::ResponseEnvelope;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Core(#[from] CoreError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthenticated: {0}")]
    Unauthorized(String),
}

impl ApiError {
    pub fn status_code(&self) -> i32 {
        match self {
            ApiError::Core(err) => err.status_code(),
            ApiError::BadRequest(_) => code::BAD_REQUEST,
            ApiError::Unauthorized(_) => code::UNAUTHENTICATED,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let (message, details) = match &self {
            ApiError::Core(err) if err.is_internal() => {
                let correlation_id = Uuid::new_v4();
                tracing::error!(%correlation_id, error = %err, "RPC internal error");
                (
                    "internal server error".to_string(),
                    vec![format!("correlation_id={correlation_id}")],
                )
            }
            ApiError::Core(CoreError::RateLimited { retry_after_ms }) => (
                self.to_string(),
                vec![format!("retry_after_ms={retry_after_ms}")],
            ),
            ApiError::Core(err) if err.is_retryable() => {
                tracing::warn!(error = %err, "RPC dependency unavailable");
                (self.to_string(), vec!["retryable=true".to_string()])
            }
            _ => (self.to_string(), Vec::new()),
        };
        let status = StatusCode::from_u16(status_code as u16)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(ResponseEnvelope::<()>::error(status_code, message, details)),
        )
            .into_response()
    }
}
