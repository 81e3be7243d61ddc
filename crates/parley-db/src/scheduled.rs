use crate::{
    datetime_from_db_text, datetime_to_db_text, json_from_db_text, json_to_db_text, DbError,
    DbPool,
};
use chrono::{DateTime, Utc};
use parley_models::ChatMessage;
use sqlx::Row;

/// A future-dated message held until the external scheduler delivers it.
#[derive(Debug, Clone)]
pub struct ScheduledRow {
    pub id: String,
    pub sender_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub message: ChatMessage,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ScheduledRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let scheduled_at_raw: String = row.try_get("scheduled_at")?;
        let payload_raw: String = row.try_get("payload")?;
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            sender_id: row.try_get("sender_id")?,
            scheduled_at: datetime_from_db_text(&scheduled_at_raw)?,
            message: json_from_db_text(&payload_raw)?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

pub async fn create_scheduled(
    pool: &DbPool,
    message: &ChatMessage,
    scheduled_at: DateTime<Utc>,
) -> Result<ScheduledRow, DbError> {
    let payload = json_to_db_text(message)?;
    let row = sqlx::query_as::<_, ScheduledRow>(
        "INSERT INTO scheduled_messages (id, sender_id, scheduled_at, payload, created_at)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id, sender_id, scheduled_at, payload, created_at",
    )
    .bind(&message.id)
    .bind(&message.sender_id)
    .bind(datetime_to_db_text(scheduled_at))
    .bind(payload)
    .bind(datetime_to_db_text(Utc::now()))
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_scheduled(pool: &DbPool, id: &str) -> Result<Option<ScheduledRow>, DbError> {
    let row = sqlx::query_as::<_, ScheduledRow>(
        "SELECT id, sender_id, scheduled_at, payload, created_at
         FROM scheduled_messages WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn delete_scheduled(pool: &DbPool, id: &str) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM scheduled_messages WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Pending entries of one sender, soonest first.
pub async fn list_scheduled(pool: &DbPool, sender_id: &str) -> Result<Vec<ScheduledRow>, DbError> {
    let rows = sqlx::query_as::<_, ScheduledRow>(
        "SELECT id, sender_id, scheduled_at, payload, created_at
         FROM scheduled_messages WHERE sender_id = $1
         ORDER BY scheduled_at ASC",
    )
    .bind(sender_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_scheduled(pool: &DbPool) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_messages")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
