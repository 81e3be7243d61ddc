use crate::{datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};

/// Records a read receipt. Returns false when the user had already read it.
pub async fn mark_read(
    pool: &DbPool,
    message_id: &str,
    user_id: &str,
    at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO message_reads (message_id, user_id, read_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (message_id, user_id) DO NOTHING",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(datetime_to_db_text(at))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_readers(pool: &DbPool, message_id: &str) -> Result<Vec<String>, DbError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT user_id FROM message_reads WHERE message_id = $1 ORDER BY read_at")
            .bind(message_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}
