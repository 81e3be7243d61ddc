pub mod groups;
pub mod likes;
pub mod messages;
pub mod pins;
pub mod presence;
pub mod reactions;
pub mod reads;
pub mod scheduled;

use sqlx::any::AnyPoolOptions;
use std::sync::OnceLock;
use thiserror::Error;

pub type DbPool = sqlx::AnyPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    Sqlite,
    Postgres,
}

impl DatabaseEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

static ACTIVE_DB_ENGINE: OnceLock<DatabaseEngine> = OnceLock::new();

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(&'static str),
}

impl DbError {
    /// Connection-level failures the caller may retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            DbError::Sqlx(
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::WorkerCrashed
            )
        )
    }
}

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    let engine = detect_database_engine(database_url)?;
    let _ = ACTIVE_DB_ENGINE.set(engine);

    // Required once before using sqlx::Any.
    sqlx::any::install_default_drivers();

    let connect_url = if matches!(engine, DatabaseEngine::Sqlite) {
        normalize_sqlite_url_for_any(database_url)
    } else {
        database_url.to_string()
    };

    AnyPoolOptions::new()
        .max_connections(max_connections)
        .after_connect(move |conn, _meta| {
            let sqlite_db = matches!(engine, DatabaseEngine::Sqlite);
            Box::pin(async move {
                if sqlite_db {
                    sqlx::query("PRAGMA journal_mode = WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA foreign_keys = ON;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA busy_timeout = 5000;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous = NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                } else {
                    sqlx::query("SET lock_timeout = '10s'")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("SET timezone = 'UTC'")
                        .execute(&mut *conn)
                        .await?;
                }
                Ok(())
            })
        })
        .connect(&connect_url)
        .await
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    run_migrations_for_engine(pool, active_database_engine()).await
}

pub async fn run_migrations_for_engine(
    pool: &DbPool,
    engine: DatabaseEngine,
) -> Result<(), sqlx::Error> {
    match engine {
        DatabaseEngine::Sqlite => sqlx::migrate!("./migrations").run(pool).await?,
        DatabaseEngine::Postgres => sqlx::migrate!("./migrations_pg").run(pool).await?,
    }
    tracing::info!(engine = engine.as_str(), "migrations: applied successfully");
    Ok(())
}

pub fn detect_database_engine(database_url: &str) -> Result<DatabaseEngine, sqlx::Error> {
    let normalized = database_url.trim().to_ascii_lowercase();
    if normalized.starts_with("sqlite:") {
        Ok(DatabaseEngine::Sqlite)
    } else if normalized.starts_with("postgres://") || normalized.starts_with("postgresql://") {
        Ok(DatabaseEngine::Postgres)
    } else {
        Err(sqlx::Error::Configuration(
            format!("unsupported database URL scheme in '{}'", database_url).into(),
        ))
    }
}

pub fn active_database_engine() -> DatabaseEngine {
    *ACTIVE_DB_ENGINE.get().unwrap_or(&DatabaseEngine::Sqlite)
}

fn normalize_sqlite_url_for_any(url: &str) -> String {
    // sqlx::Any expects absolute Windows paths as sqlite:///C:/...
    if !url.starts_with("sqlite://") {
        return url.to_string();
    }
    let rest = &url["sqlite://".len()..];
    if rest.starts_with('/') {
        return url.to_string();
    }
    let bytes = rest.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        format!("sqlite:///{rest}")
    } else {
        url.to_string()
    }
}

/// Fixed-width UTC text so lexical order matches time order.
pub(crate) fn datetime_to_db_text(value: chrono::DateTime<chrono::Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

pub(crate) fn datetime_from_db_text(
    value: &str,
) -> Result<chrono::DateTime<chrono::Utc>, sqlx::Error> {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    Err(sqlx::Error::Protocol(format!(
        "invalid datetime text '{}'",
        value
    )))
}

pub(crate) fn json_from_db_text<T: serde::de::DeserializeOwned>(
    value: &str,
) -> Result<T, sqlx::Error> {
    serde_json::from_str(value)
        .map_err(|e| sqlx::Error::Protocol(format!("invalid json text: {e}")))
}

pub(crate) fn json_to_db_text<T: serde::Serialize>(value: &T) -> Result<String, DbError> {
    serde_json::to_string(value)
        .map_err(|e| DbError::Sqlx(sqlx::Error::Protocol(format!("json encode: {e}"))))
}

pub(crate) fn bool_from_any_row(
    row: &sqlx::any::AnyRow,
    column: &str,
) -> Result<bool, sqlx::Error> {
    use sqlx::Row;
    let first_err = match row.try_get::<bool, _>(column) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    if let Ok(raw) = row.try_get::<i64, _>(column) {
        return Ok(raw != 0);
    }
    if let Ok(raw) = row.try_get::<i32, _>(column) {
        return Ok(raw != 0);
    }
    if let Ok(raw) = row.try_get::<String, _>(column) {
        let normalized = raw.trim().to_ascii_lowercase();
        if matches!(normalized.as_str(), "1" | "true" | "t" | "yes") {
            return Ok(true);
        }
        if matches!(normalized.as_str(), "0" | "false" | "f" | "no") {
            return Ok(false);
        }
    }

    Err(first_err)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> DbPool {
    let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
    run_migrations_for_engine(&pool, DatabaseEngine::Sqlite)
        .await
        .expect("migrations");
    pool
}
