use crate::{
    bool_from_any_row, datetime_from_db_text, datetime_to_db_text, json_from_db_text,
    json_to_db_text, DbError, DbPool,
};
use chrono::{DateTime, Utc};
use parley_models::{
    ChatMessage, EditRecord, FileRef, Location, MessageStatus, MessageType, Poll, Reaction,
};
use sqlx::Row;

macro_rules! select_messages {
    ($tail:literal) => {
        concat!(
            "SELECT seq, id, sender_id, receiver_id, group_id, content, message_type, status,
                    reply_to, thread_id, parent_message_id, pinned, file_json, location_json,
                    poll_json, edit_history, deleted, deleted_at, created_at
             FROM messages ",
            $tail
        )
    };
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub group_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub reply_to: Option<String>,
    pub thread_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub pinned: bool,
    pub file: Option<FileRef>,
    pub location: Option<Location>,
    pub poll: Option<Poll>,
    pub edit_history: Vec<EditRecord>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let message_type_raw: String = row.try_get("message_type")?;
        let status_raw: String = row.try_get("status")?;
        let file_raw: Option<String> = row.try_get("file_json")?;
        let location_raw: Option<String> = row.try_get("location_json")?;
        let poll_raw: Option<String> = row.try_get("poll_json")?;
        let history_raw: String = row.try_get("edit_history")?;
        let deleted_at_raw: Option<String> = row.try_get("deleted_at")?;
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            sender_id: row.try_get("sender_id")?,
            receiver_id: row.try_get("receiver_id")?,
            group_id: row.try_get("group_id")?,
            content: row.try_get("content")?,
            message_type: MessageType::parse(&message_type_raw).ok_or_else(|| {
                sqlx::Error::Protocol(format!("invalid message_type '{message_type_raw}'"))
            })?,
            status: MessageStatus::parse(&status_raw).unwrap_or_default(),
            reply_to: row.try_get("reply_to")?,
            thread_id: row.try_get("thread_id")?,
            parent_message_id: row.try_get("parent_message_id")?,
            pinned: bool_from_any_row(row, "pinned")?,
            file: file_raw.as_deref().map(json_from_db_text).transpose()?,
            location: location_raw.as_deref().map(json_from_db_text).transpose()?,
            poll: poll_raw.as_deref().map(json_from_db_text).transpose()?,
            edit_history: json_from_db_text(&history_raw)?,
            deleted: bool_from_any_row(row, "deleted")?,
            deleted_at: deleted_at_raw
                .as_deref()
                .map(datetime_from_db_text)
                .transpose()?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl MessageRow {
    pub fn is_group(&self) -> bool {
        !self.group_id.is_empty()
    }

    pub fn into_message(self, reactions: Vec<Reaction>, liked_by: Vec<String>) -> ChatMessage {
        let is_group = self.is_group();
        ChatMessage {
            id: self.id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            group_id: self.group_id,
            content: self.content,
            message_type: self.message_type,
            timestamp: Some(self.created_at.into()),
            is_group,
            status: self.status,
            reply_to: self.reply_to,
            thread_id: self.thread_id,
            parent_message_id: self.parent_message_id,
            is_pinned: self.pinned,
            is_scheduled: false,
            scheduled_at: None,
            edit_history: self.edit_history,
            reactions,
            liked_by,
            file: self.file,
            location: self.location,
            poll: self.poll,
            deleted: self.deleted,
        }
    }
}

/// Insert a normalized message. The id must already be minted.
pub async fn create_message(
    pool: &DbPool,
    message: &ChatMessage,
    created_at: DateTime<Utc>,
) -> Result<MessageRow, DbError> {
    let file_json = message.file.as_ref().map(json_to_db_text).transpose()?;
    let location_json = message.location.as_ref().map(json_to_db_text).transpose()?;
    let poll_json = message.poll.as_ref().map(json_to_db_text).transpose()?;
    let result = sqlx::query_as::<_, MessageRow>(
        "INSERT INTO messages (id, sender_id, receiver_id, group_id, content, message_type, status,
                               reply_to, thread_id, parent_message_id, pinned, file_json,
                               location_json, poll_json, edit_history, deleted, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, '[]', $15, $16)
         RETURNING seq, id, sender_id, receiver_id, group_id, content, message_type, status,
                   reply_to, thread_id, parent_message_id, pinned, file_json, location_json,
                   poll_json, edit_history, deleted, deleted_at, created_at",
    )
    .bind(&message.id)
    .bind(&message.sender_id)
    .bind(&message.receiver_id)
    .bind(&message.group_id)
    .bind(&message.content)
    .bind(message.message_type.as_str())
    .bind(message.status.as_str())
    .bind(message.reply_to.as_deref())
    .bind(message.thread_id.as_deref())
    .bind(message.parent_message_id.as_deref())
    .bind(false)
    .bind(file_json)
    .bind(location_json)
    .bind(poll_json)
    .bind(false)
    .bind(datetime_to_db_text(created_at))
    .fetch_one(pool)
    .await;

    match result {
        Ok(row) => Ok(row),
        Err(err) if is_unique_violation(&err) => Err(DbError::Conflict("message id already exists")),
        Err(err) => Err(DbError::Sqlx(err)),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };

    let code_binding = db_err.code();
    let code = code_binding.as_deref().unwrap_or_default();
    if code == "23505" || code == "2067" || code == "1555" {
        return true;
    }

    db_err
        .message()
        .to_ascii_lowercase()
        .contains("unique constraint")
}

pub async fn get_message(pool: &DbPool, id: &str) -> Result<Option<MessageRow>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(select_messages!("WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Newest first. `before` is a message id; rows strictly older are returned.
pub async fn get_direct_messages(
    pool: &DbPool,
    user_a: &str,
    user_b: &str,
    before: Option<&str>,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = match before {
        Some(before_id) => {
            sqlx::query_as::<_, MessageRow>(select_messages!(
                "WHERE group_id = ''
                   AND ((sender_id = $1 AND receiver_id = $2) OR (sender_id = $2 AND receiver_id = $1))
                   AND seq < (SELECT seq FROM messages WHERE id = $3)
                 ORDER BY seq DESC LIMIT $4"
            ))
            .bind(user_a)
            .bind(user_b)
            .bind(before_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, MessageRow>(select_messages!(
                "WHERE group_id = ''
                   AND ((sender_id = $1 AND receiver_id = $2) OR (sender_id = $2 AND receiver_id = $1))
                 ORDER BY seq DESC LIMIT $3"
            ))
            .bind(user_a)
            .bind(user_b)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

pub async fn get_group_messages(
    pool: &DbPool,
    group_id: &str,
    before: Option<&str>,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = match before {
        Some(before_id) => {
            sqlx::query_as::<_, MessageRow>(select_messages!(
                "WHERE group_id = $1 AND seq < (SELECT seq FROM messages WHERE id = $2)
                 ORDER BY seq DESC LIMIT $3"
            ))
            .bind(group_id)
            .bind(before_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, MessageRow>(select_messages!(
                "WHERE group_id = $1 ORDER BY seq DESC LIMIT $2"
            ))
            .bind(group_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

/// Replies under a parent, oldest first.
pub async fn get_thread_messages(
    pool: &DbPool,
    parent_message_id: &str,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(select_messages!(
        "WHERE parent_message_id = $1 ORDER BY seq ASC LIMIT $2"
    ))
    .bind(parent_message_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn update_content(
    pool: &DbPool,
    id: &str,
    content: &str,
    edit_history: &[EditRecord],
) -> Result<MessageRow, DbError> {
    let history_json = json_to_db_text(&edit_history)?;
    let row = sqlx::query_as::<_, MessageRow>(
        "UPDATE messages SET content = $2, edit_history = $3
         WHERE id = $1
         RETURNING seq, id, sender_id, receiver_id, group_id, content, message_type, status,
                   reply_to, thread_id, parent_message_id, pinned, file_json, location_json,
                   poll_json, edit_history, deleted, deleted_at, created_at",
    )
    .bind(id)
    .bind(content)
    .bind(history_json)
    .fetch_optional(pool)
    .await?;
    row.ok_or(DbError::NotFound)
}

/// Sets the tombstone. Returns false when the message was absent or already deleted.
pub async fn soft_delete(pool: &DbPool, id: &str, at: DateTime<Utc>) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE messages SET deleted = $2, deleted_at = $3
         WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(true)
    .bind(datetime_to_db_text(at))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_pinned(pool: &DbPool, id: &str, pinned: bool) -> Result<bool, DbError> {
    let result = sqlx::query("UPDATE messages SET pinned = $2 WHERE id = $1")
        .bind(id)
        .bind(pinned)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_status(
    pool: &DbPool,
    id: &str,
    status: MessageStatus,
) -> Result<bool, DbError> {
    let result = sqlx::query("UPDATE messages SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_messages(pool: &DbPool) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    fn msg(id: &str, from: &str, to: &str, content: &str) -> ChatMessage {
        let mut m = ChatMessage::text(from, to, content);
        m.id = id.to_string();
        m
    }

    #[tokio::test]
    async fn create_and_fetch_message() {
        let pool = test_pool().await;
        let mut m = msg("m1", "u1", "u2", "hi");
        m.file = Some(FileRef {
            url: "https://cdn.example.com/a.png".into(),
            ..Default::default()
        });
        let row = create_message(&pool, &m, Utc::now()).await.unwrap();
        assert_eq!(row.id, "m1");
        assert!(!row.pinned);
        assert!(!row.deleted);

        let fetched = get_message(&pool, "m1").await.unwrap().unwrap();
        let message = fetched.into_message(Vec::new(), Vec::new());
        assert_eq!(message.content, "hi");
        assert!(!message.is_group);
        assert_eq!(message.file.unwrap().url, "https://cdn.example.com/a.png");
        assert!(message.timestamp.is_some());
    }

    #[tokio::test]
    async fn duplicate_id_is_conflict() {
        let pool = test_pool().await;
        create_message(&pool, &msg("m1", "u1", "u2", "a"), Utc::now())
            .await
            .unwrap();
        let err = create_message(&pool, &msg("m1", "u1", "u2", "b"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
        assert_eq!(count_messages(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn direct_history_covers_both_directions_and_paginates() {
        let pool = test_pool().await;
        create_message(&pool, &msg("m1", "u1", "u2", "one"), Utc::now())
            .await
            .unwrap();
        create_message(&pool, &msg("m2", "u2", "u1", "two"), Utc::now())
            .await
            .unwrap();
        create_message(&pool, &msg("m3", "u1", "u3", "other chat"), Utc::now())
            .await
            .unwrap();
        create_message(&pool, &msg("m4", "u1", "u2", "three"), Utc::now())
            .await
            .unwrap();

        let rows = get_direct_messages(&pool, "u2", "u1", None, 10).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m2", "m1"]);

        let older = get_direct_messages(&pool, "u1", "u2", Some("m4"), 1)
            .await
            .unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].id, "m2");
    }

    #[tokio::test]
    async fn edit_appends_history_and_delete_tombstones_once() {
        let pool = test_pool().await;
        create_message(&pool, &msg("m1", "u1", "u2", "draft"), Utc::now())
            .await
            .unwrap();
        let history = vec![EditRecord {
            previous_content: "draft".into(),
            edited_at: Utc::now().into(),
        }];
        let row = update_content(&pool, "m1", "final", &history).await.unwrap();
        assert_eq!(row.content, "final");
        assert_eq!(row.edit_history.len(), 1);

        assert!(soft_delete(&pool, "m1", Utc::now()).await.unwrap());
        assert!(!soft_delete(&pool, "m1", Utc::now()).await.unwrap());
        let row = get_message(&pool, "m1").await.unwrap().unwrap();
        assert!(row.deleted);
        assert!(row.deleted_at.is_some());

        assert!(matches!(
            update_content(&pool, "missing", "x", &[]).await,
            Err(DbError::NotFound)
        ));
    }

    #[tokio::test]
    async fn thread_messages_are_oldest_first() {
        let pool = test_pool().await;
        create_message(&pool, &msg("p", "u1", "u2", "parent"), Utc::now())
            .await
            .unwrap();
        for (id, text) in [("r1", "first"), ("r2", "second")] {
            let mut reply = msg(id, "u2", "u1", text);
            reply.parent_message_id = Some("p".into());
            reply.thread_id = Some("p".into());
            create_message(&pool, &reply, Utc::now()).await.unwrap();
        }
        let rows = get_thread_messages(&pool, "p", 50).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }
}
