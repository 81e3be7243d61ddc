//! Chat Repository contract and its relational implementation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_db::groups::{GroupMembers, GroupRow};
use parley_db::messages::MessageRow;
use parley_db::scheduled::ScheduledRow;
use parley_db::DbPool;
use parley_models::{ChatMessage, EditRecord, MessageStatus, PresenceRecord};
use tokio::time::Instant;

use crate::error::CoreError;

/// Absolute point in time by which a call must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    pub fn instant(self) -> Instant {
        self.0
    }

    pub fn remaining(self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(self) -> bool {
        self.remaining().is_zero()
    }
}

/// Bounds `fut` by `deadline`. Expiry is `Unavailable`, which clients may retry.
pub async fn with_deadline<T, F>(deadline: Deadline, fut: F) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, CoreError>>,
{
    match tokio::time::timeout_at(deadline.instant(), fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Unavailable("deadline exceeded".into())),
    }
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    /// Persists a normalized message. A duplicate id is `Conflict`.
    async fn save_message(&self, message: &ChatMessage) -> Result<ChatMessage, CoreError>;
    async fn get_message(&self, id: &str) -> Result<Option<ChatMessage>, CoreError>;
    /// Newest first.
    async fn direct_history(
        &self,
        user_a: &str,
        user_b: &str,
        before: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError>;
    /// Newest first.
    async fn group_history(
        &self,
        group_id: &str,
        before: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError>;
    /// Oldest first.
    async fn thread_messages(&self, parent_id: &str, limit: i64)
        -> Result<Vec<ChatMessage>, CoreError>;
    async fn edit_message(
        &self,
        id: &str,
        content: &str,
        history: &[EditRecord],
    ) -> Result<ChatMessage, CoreError>;
    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> Result<bool, CoreError>;
    async fn set_status(&self, id: &str, status: MessageStatus) -> Result<bool, CoreError>;

    async fn add_reaction(&self, message_id: &str, user_id: &str, kind: &str)
        -> Result<(), CoreError>;
    async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        kind: &str,
    ) -> Result<(), CoreError>;
    /// Returns whether the message is liked after the toggle.
    async fn toggle_like(&self, message_id: &str, user_id: &str) -> Result<bool, CoreError>;
    async fn mark_read(
        &self,
        message_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    async fn pin(&self, chat_key: &str, message_id: &str, pinned_by: &str)
        -> Result<(), CoreError>;
    async fn unpin(&self, chat_key: &str, message_id: &str) -> Result<(), CoreError>;
    async fn pinned(&self, chat_key: &str) -> Result<Vec<ChatMessage>, CoreError>;

    async fn create_group(
        &self,
        id: &str,
        name: &str,
        owner_id: &str,
        member_ids: &[String],
    ) -> Result<GroupRow, CoreError>;
    async fn get_group(&self, id: &str) -> Result<Option<GroupRow>, CoreError>;
    /// Returns the new membership epoch.
    async fn add_member(&self, group_id: &str, user_id: &str) -> Result<i64, CoreError>;
    async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<i64, CoreError>;
    async fn group_members(&self, group_id: &str) -> Result<Option<GroupMembers>, CoreError>;
    async fn user_groups(&self, user_id: &str) -> Result<Vec<String>, CoreError>;

    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), CoreError>;
    async fn load_presence(&self) -> Result<Vec<PresenceRecord>, CoreError>;

    async fn schedule(
        &self,
        message: &ChatMessage,
        at: DateTime<Utc>,
    ) -> Result<ScheduledRow, CoreError>;
    async fn get_scheduled(&self, id: &str) -> Result<Option<ScheduledRow>, CoreError>;
    async fn cancel_scheduled(&self, id: &str) -> Result<bool, CoreError>;
    async fn list_scheduled(&self, sender_id: &str) -> Result<Vec<ScheduledRow>, CoreError>;
}

/// `ChatRepository` over the sqlx pool.
#[derive(Clone)]
pub struct SqlRepository {
    pool: DbPool,
}

impl SqlRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn hydrate(&self, row: MessageRow) -> Result<ChatMessage, CoreError> {
        let reactions = parley_db::reactions::get_message_reactions(&self.pool, &row.id).await?;
        let liked_by = parley_db::likes::get_liked_by(&self.pool, &row.id).await?;
        Ok(row.into_message(reactions, liked_by))
    }

    async fn hydrate_all(&self, rows: Vec<MessageRow>) -> Result<Vec<ChatMessage>, CoreError> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.hydrate(row).await?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ChatRepository for SqlRepository {
    async fn save_message(&self, message: &ChatMessage) -> Result<ChatMessage, CoreError> {
        let created_at = message
            .timestamp
            .and_then(|ts| ts.to_datetime())
            .unwrap_or_else(Utc::now);
        let row = parley_db::messages::create_message(&self.pool, message, created_at).await?;
        Ok(row.into_message(Vec::new(), Vec::new()))
    }

    async fn get_message(&self, id: &str) -> Result<Option<ChatMessage>, CoreError> {
        match parley_db::messages::get_message(&self.pool, id).await? {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn direct_history(
        &self,
        user_a: &str,
        user_b: &str,
        before: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let rows =
            parley_db::messages::get_direct_messages(&self.pool, user_a, user_b, before, limit)
                .await?;
        self.hydrate_all(rows).await
    }

    async fn group_history(
        &self,
        group_id: &str,
        before: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let rows =
            parley_db::messages::get_group_messages(&self.pool, group_id, before, limit).await?;
        self.hydrate_all(rows).await
    }

    async fn thread_messages(
        &self,
        parent_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let rows = parley_db::messages::get_thread_messages(&self.pool, parent_id, limit).await?;
        self.hydrate_all(rows).await
    }

    async fn edit_message(
        &self,
        id: &str,
        content: &str,
        history: &[EditRecord],
    ) -> Result<ChatMessage, CoreError> {
        let row = parley_db::messages::update_content(&self.pool, id, content, history).await?;
        self.hydrate(row).await
    }

    async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> Result<bool, CoreError> {
        Ok(parley_db::messages::soft_delete(&self.pool, id, at).await?)
    }

    async fn set_status(&self, id: &str, status: MessageStatus) -> Result<bool, CoreError> {
        Ok(parley_db::messages::set_status(&self.pool, id, status).await?)
    }

    async fn add_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        kind: &str,
    ) -> Result<(), CoreError> {
        Ok(parley_db::reactions::add_reaction(&self.pool, message_id, user_id, kind).await?)
    }

    async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        kind: &str,
    ) -> Result<(), CoreError> {
        Ok(parley_db::reactions::remove_reaction(&self.pool, message_id, user_id, kind).await?)
    }

    async fn toggle_like(&self, message_id: &str, user_id: &str) -> Result<bool, CoreError> {
        Ok(parley_db::likes::toggle_like(&self.pool, message_id, user_id).await?)
    }

    async fn mark_read(
        &self,
        message_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        Ok(parley_db::reads::mark_read(&self.pool, message_id, user_id, at).await?)
    }

    async fn pin(&self, chat_key: &str, message_id: &str, pinned_by: &str) -> Result<(), CoreError> {
        Ok(parley_db::pins::pin_message(&self.pool, chat_key, message_id, pinned_by).await?)
    }

    async fn unpin(&self, chat_key: &str, message_id: &str) -> Result<(), CoreError> {
        Ok(parley_db::pins::unpin_message(&self.pool, chat_key, message_id).await?)
    }

    async fn pinned(&self, chat_key: &str) -> Result<Vec<ChatMessage>, CoreError> {
        let rows = parley_db::pins::get_pinned_messages(&self.pool, chat_key).await?;
        self.hydrate_all(rows).await
    }

    async fn create_group(
        &self,
        id: &str,
        name: &str,
        owner_id: &str,
        member_ids: &[String],
    ) -> Result<GroupRow, CoreError> {
        Ok(parley_db::groups::create_group(&self.pool, id, name, owner_id, member_ids).await?)
    }

    async fn get_group(&self, id: &str) -> Result<Option<GroupRow>, CoreError> {
        Ok(parley_db::groups::get_group(&self.pool, id).await?)
    }

    async fn add_member(&self, group_id: &str, user_id: &str) -> Result<i64, CoreError> {
        Ok(parley_db::groups::add_member(&self.pool, group_id, user_id).await?)
    }

    async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<i64, CoreError> {
        Ok(parley_db::groups::remove_member(&self.pool, group_id, user_id).await?)
    }

    async fn group_members(&self, group_id: &str) -> Result<Option<GroupMembers>, CoreError> {
        Ok(parley_db::groups::get_members(&self.pool, group_id).await?)
    }

    async fn user_groups(&self, user_id: &str) -> Result<Vec<String>, CoreError> {
        Ok(parley_db::groups::get_user_groups(&self.pool, user_id).await?)
    }

    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), CoreError> {
        Ok(parley_db::presence::upsert_presence(&self.pool, record).await?)
    }

    async fn load_presence(&self) -> Result<Vec<PresenceRecord>, CoreError> {
        Ok(parley_db::presence::load_all(&self.pool).await?)
    }

    async fn schedule(
        &self,
        message: &ChatMessage,
        at: DateTime<Utc>,
    ) -> Result<ScheduledRow, CoreError> {
        Ok(parley_db::scheduled::create_scheduled(&self.pool, message, at).await?)
    }

    async fn get_scheduled(&self, id: &str) -> Result<Option<ScheduledRow>, CoreError> {
        Ok(parley_db::scheduled::get_scheduled(&self.pool, id).await?)
    }

    async fn cancel_scheduled(&self, id: &str) -> Result<bool, CoreError> {
        Ok(parley_db::scheduled::delete_scheduled(&self.pool, id).await?)
    }

    async fn list_scheduled(&self, sender_id: &str) -> Result<Vec<ScheduledRow>, CoreError> {
        Ok(parley_db::scheduled::list_scheduled(&self.pool, sender_id).await?)
    }
}
