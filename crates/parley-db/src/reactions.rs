use crate::{datetime_to_db_text, DbError, DbPool};
use chrono::Utc;
use parley_models::Reaction;

/// At most one reaction per (message, user, kind).
pub async fn add_reaction(
    pool: &DbPool,
    message_id: &str,
    user_id: &str,
    kind: &str,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "INSERT INTO reactions (message_id, user_id, kind, created_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (message_id, user_id, kind) DO NOTHING",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(kind)
    .bind(datetime_to_db_text(Utc::now()))
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::Conflict("reaction already exists"));
    }
    Ok(())
}

pub async fn remove_reaction(
    pool: &DbPool,
    message_id: &str,
    user_id: &str,
    kind: &str,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "DELETE FROM reactions WHERE message_id = $1 AND user_id = $2 AND kind = $3",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(kind)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn get_message_reactions(
    pool: &DbPool,
    message_id: &str,
) -> Result<Vec<Reaction>, DbError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT user_id, kind FROM reactions
         WHERE message_id = $1
         ORDER BY created_at, user_id",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(user_id, kind)| Reaction { user_id, kind })
        .collect())
}
