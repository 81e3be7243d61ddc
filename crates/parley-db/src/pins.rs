use crate::{datetime_to_db_text, messages::MessageRow, DbError, DbPool};
use chrono::Utc;

/// Pins are keyed by a chat id: the group id, or `dm:<a>:<b>` with the two
/// user ids in sorted order.
pub fn direct_chat_key(user_a: &str, user_b: &str) -> String {
    if user_a <= user_b {
        format!("dm:{user_a}:{user_b}")
    } else {
        format!("dm:{user_b}:{user_a}")
    }
}

pub fn group_chat_key(group_id: &str) -> String {
    format!("group:{group_id}")
}

pub async fn pin_message(
    pool: &DbPool,
    chat_id: &str,
    message_id: &str,
    pinned_by: &str,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "INSERT INTO pins (chat_id, message_id, pinned_by, created_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (chat_id, message_id) DO NOTHING",
    )
    .bind(chat_id)
    .bind(message_id)
    .bind(pinned_by)
    .bind(datetime_to_db_text(Utc::now()))
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::Conflict("message already pinned"));
    }
    crate::messages::set_pinned(pool, message_id, true).await?;
    Ok(())
}

pub async fn unpin_message(pool: &DbPool, chat_id: &str, message_id: &str) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM pins WHERE chat_id = $1 AND message_id = $2")
        .bind(chat_id)
        .bind(message_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    crate::messages::set_pinned(pool, message_id, false).await?;
    Ok(())
}

/// Pinned messages of a chat, most recently pinned first.
pub async fn get_pinned_messages(pool: &DbPool, chat_id: &str) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT m.seq, m.id, m.sender_id, m.receiver_id, m.group_id, m.content, m.message_type,
                m.status, m.reply_to, m.thread_id, m.parent_message_id, m.pinned, m.file_json,
                m.location_json, m.poll_json, m.edit_history, m.deleted, m.deleted_at, m.created_at
         FROM pins p
         INNER JOIN messages m ON m.id = p.message_id
         WHERE p.chat_id = $1
         ORDER BY p.created_at DESC",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;
    use parley_models::ChatMessage;

    #[test]
    fn direct_key_is_order_independent() {
        assert_eq!(direct_chat_key("u2", "u1"), direct_chat_key("u1", "u2"));
        assert_eq!(direct_chat_key("u1", "u2"), "dm:u1:u2");
    }

    #[tokio::test]
    async fn pin_twice_conflicts_and_unpin_missing_is_not_found() {
        let pool = test_pool().await;
        let mut m = ChatMessage::text("u1", "u2", "pin me");
        m.id = "m1".into();
        crate::messages::create_message(&pool, &m, Utc::now())
            .await
            .unwrap();
        let key = direct_chat_key("u1", "u2");

        pin_message(&pool, &key, "m1", "u1").await.unwrap();
        assert!(matches!(
            pin_message(&pool, &key, "m1", "u2").await,
            Err(DbError::Conflict(_))
        ));
        let pinned = get_pinned_messages(&pool, &key).await.unwrap();
        assert_eq!(pinned.len(), 1);
        assert!(pinned[0].pinned);

        unpin_message(&pool, &key, "m1").await.unwrap();
        assert!(matches!(
            unpin_message(&pool, &key, "m1").await,
            Err(DbError::NotFound)
        ));
        let row = crate::messages::get_message(&pool, "m1").await.unwrap().unwrap();
        assert!(!row.pinned);
    }
}
