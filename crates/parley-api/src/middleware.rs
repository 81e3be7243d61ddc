use std::time::Duration;

use axum::{
    extract::{FromRequest, FromRequestParts, Request},
    http::{header, request::Parts},
    Json,
};
use parley_core::auth::bearer_token;
use parley_core::{AppState, ClaimSet, Deadline};
use parley_models::stream::REQUEST_TIMEOUT_HEADER;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// Caller identity resolved from the `authorization` header.
pub struct AuthUser {
    pub claims: ClaimSet,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".into()))?;
        let token = bearer_token(auth_header)
            .ok_or_else(|| ApiError::Unauthorized("empty authorization header".into()))?;
        let claims = state.authenticate(token).await?;
        Ok(AuthUser { claims })
    }
}

/// Absolute deadline from `x-request-timeout-ms`, or the configured default.
pub struct RequestDeadline(pub Deadline);

impl FromRequestParts<AppState> for RequestDeadline {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let requested = match parts.headers.get(REQUEST_TIMEOUT_HEADER) {
            None => None,
            Some(value) => {
                let ms = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| {
                        ApiError::BadRequest(format!("invalid {REQUEST_TIMEOUT_HEADER} header"))
                    })?;
                Some(Duration::from_millis(ms))
            }
        };
        Ok(RequestDeadline(state.deadline(requested)))
    }
}

/// JSON body whose rejections are reported in a response envelope.
pub struct RpcJson<T>(pub T);

impl<T> FromRequest<AppState> for RpcJson<T>
where
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
        Ok(RpcJson(value))
    }
}
