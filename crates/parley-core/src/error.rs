use parley_db::DbError;
use parley_models::stream::code;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("internal error: {0}")]
    Internal(String),
    #[error("slow consumer")]
    SlowConsumer,
    #[error("shutting down")]
    ShuttingDown,
    #[error("database error: {0}")]
    Database(DbError),
}

impl From<DbError> for CoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => CoreError::NotFound("record not found".into()),
            DbError::Conflict(what) => CoreError::Conflict(what.to_string()),
            other if other.is_unavailable() => CoreError::Unavailable(other.to_string()),
            other => CoreError::Database(other),
        }
    }
}

impl CoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CoreError::InvalidArgument(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }

    pub fn denied(message: impl Into<String>) -> Self {
        CoreError::PermissionDenied(message.into())
    }

    /// HTTP-style status code carried in unary responses and `Error` envelopes.
    pub fn status_code(&self) -> i32 {
        match self {
            CoreError::Unauthenticated(_) => code::UNAUTHENTICATED,
            CoreError::InvalidArgument(_) => code::BAD_REQUEST,
            CoreError::NotFound(_) => code::NOT_FOUND,
            CoreError::PermissionDenied(_) => code::FORBIDDEN,
            CoreError::Conflict(_) => code::CONFLICT,
            CoreError::RateLimited { .. } => code::RATE_LIMITED,
            CoreError::Unavailable(_)
            | CoreError::Internal(_)
            | CoreError::SlowConsumer
            | CoreError::ShuttingDown
            | CoreError::Database(_) => code::INTERNAL,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Unavailable(_) | CoreError::ShuttingDown)
    }

    /// Errors whose detail must not reach clients.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            CoreError::Internal(_) | CoreError::Database(_) | CoreError::SlowConsumer
        )
    }
}
