use crate::{datetime_to_db_text, DbError, DbPool};
use chrono::Utc;

/// Flips the like for `user_id`. Returns true when the message is now liked.
pub async fn toggle_like(pool: &DbPool, message_id: &str, user_id: &str) -> Result<bool, DbError> {
    let removed = sqlx::query("DELETE FROM message_likes WHERE message_id = $1 AND user_id = $2")
        .bind(message_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    if removed.rows_affected() > 0 {
        return Ok(false);
    }
    sqlx::query(
        "INSERT INTO message_likes (message_id, user_id, created_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (message_id, user_id) DO NOTHING",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(datetime_to_db_text(Utc::now()))
    .execute(pool)
    .await?;
    Ok(true)
}

pub async fn get_liked_by(pool: &DbPool, message_id: &str) -> Result<Vec<String>, DbError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT user_id FROM message_likes WHERE message_id = $1 ORDER BY created_at, user_id",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    #[tokio::test]
    async fn toggle_like_alternates() {
        let pool = test_pool().await;
        assert!(toggle_like(&pool, "m1", "u1").await.unwrap());
        assert!(toggle_like(&pool, "m1", "u2").await.unwrap());
        assert_eq!(get_liked_by(&pool, "m1").await.unwrap().len(), 2);
        assert!(!toggle_like(&pool, "m1", "u1").await.unwrap());
        assert_eq!(get_liked_by(&pool, "m1").await.unwrap(), vec!["u2".to_string()]);
    }
}
