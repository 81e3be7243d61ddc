use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// Body of every unary RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub status_code: i32,
    pub message: String,
    pub result: RpcResult<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcResult<T> {
    Value(T),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
    pub timestamp: Timestamp,
}

impl<T> ResponseEnvelope<T> {
    pub fn ok(value: T) -> Self {
        Self::with_status(200, "OK", value)
    }

    pub fn created(value: T) -> Self {
        Self::with_status(201, "Created", value)
    }

    pub fn with_status(status_code: i32, message: impl Into<String>, value: T) -> Self {
        Self {
            status_code,
            message: message.into(),
            result: RpcResult::Value(value),
        }
    }

    pub fn error(status_code: i32, message: impl Into<String>, details: Vec<String>) -> Self {
        let message = message.into();
        Self {
            status_code,
            message: message.clone(),
            result: RpcResult::Error(RpcError {
                code: status_code,
                message,
                details,
                timestamp: Timestamp::now(),
            }),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match &self.result {
            RpcResult::Value(v) => Some(v),
            RpcResult::Error(_) => None,
        }
    }

    pub fn into_value(self) -> Result<T, RpcError> {
        match self.result {
            RpcResult::Value(v) => Ok(v),
            RpcResult::Error(e) => Err(e),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}
