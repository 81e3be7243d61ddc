//! Side-channel message operations: history, edits, reactions, pins, reads.
//! Every mutation persists first and then enters the router as a
//! `MessageUpdate` plan for the original message's audience.

use std::sync::Arc;

use chrono::Utc;
use parley_db::pins::{direct_chat_key, group_chat_key};
use parley_models::{ChatMessage, EditRecord, MessageStatus, Timestamp};

use crate::auth::ClaimSet;
use crate::error::CoreError;
use crate::membership::MembershipCache;
use crate::plan::{DeliveryPlan, UpdateAction};
use crate::repository::{with_deadline, ChatRepository, Deadline};
use crate::router::Router;
use crate::validation::MAX_CONTENT_CHARS;

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 200;

/// A direct chat with a peer, or a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    Peer(String),
    Group(String),
}

impl ChatTarget {
    /// Exactly one of the two ids must be non-empty.
    pub fn from_ids(peer_id: Option<&str>, group_id: Option<&str>) -> Result<Self, CoreError> {
        let peer = peer_id.map(str::trim).filter(|p| !p.is_empty());
        let group = group_id.map(str::trim).filter(|g| !g.is_empty());
        match (peer, group) {
            (Some(peer), None) => Ok(ChatTarget::Peer(peer.to_string())),
            (None, Some(group)) => Ok(ChatTarget::Group(group.to_string())),
            _ => Err(CoreError::invalid("exactly one of peer_id and group_id is required")),
        }
    }
}

pub fn chat_key_of(message: &ChatMessage) -> String {
    if message.is_group {
        group_chat_key(&message.group_id)
    } else {
        direct_chat_key(&message.sender_id, &message.receiver_id)
    }
}

/// What other participants see of a deleted message.
pub fn tombstone(message: &ChatMessage) -> ChatMessage {
    ChatMessage {
        id: message.id.clone(),
        sender_id: message.sender_id.clone(),
        receiver_id: message.receiver_id.clone(),
        group_id: message.group_id.clone(),
        is_group: message.is_group,
        timestamp: message.timestamp,
        thread_id: message.thread_id.clone(),
        parent_message_id: message.parent_message_id.clone(),
        deleted: true,
        ..Default::default()
    }
}

pub struct MessageOps {
    repo: Arc<dyn ChatRepository>,
    router: Arc<Router>,
    membership: Arc<MembershipCache>,
}

impl MessageOps {
    pub fn new(
        repo: Arc<dyn ChatRepository>,
        router: Arc<Router>,
        membership: Arc<MembershipCache>,
    ) -> Self {
        Self {
            repo,
            router,
            membership,
        }
    }

    async fn require_group_member(&self, claims: &ClaimSet, group_id: &str) -> Result<(), CoreError> {
        let deadline = self.membership.deadline();
        if self
            .membership
            .is_member(group_id, &claims.user_id, deadline)
            .await?
            || claims.is_admin()
        {
            Ok(())
        } else {
            Err(CoreError::denied("not a member of this group"))
        }
    }

    /// Loads a message the caller may see. Invisible messages are `NotFound`.
    pub async fn visible_message(
        &self,
        claims: &ClaimSet,
        message_id: &str,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let message = with_deadline(deadline, self.repo.get_message(message_id))
            .await?
            .ok_or_else(|| CoreError::not_found(format!("message {message_id}")))?;
        if !self.membership.can_view(claims, &message, deadline).await? {
            return Err(CoreError::not_found(format!("message {message_id}")));
        }
        Ok(message)
    }

    /// Like `visible_message`, but tombstones cannot be acted on.
    async fn live_message(
        &self,
        claims: &ClaimSet,
        message_id: &str,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let message = self.visible_message(claims, message_id, deadline).await?;
        if message.deleted {
            return Err(CoreError::not_found(format!("message {message_id}")));
        }
        Ok(message)
    }

    fn filter_visible(&self, claims: &ClaimSet, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        messages
            .into_iter()
            .filter(|m| !m.deleted || m.sender_id == claims.user_id || claims.is_admin())
            .collect()
    }

    async fn publish(&self, action: UpdateAction, actor: &str, message: ChatMessage) {
        let plan = DeliveryPlan::update(action, actor, message);
        self.router.execute(&plan).await;
    }

    pub async fn get_messages(
        &self,
        claims: &ClaimSet,
        target: &ChatTarget,
        before: Option<&str>,
        limit: Option<i64>,
        deadline: Deadline,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let before = before.map(str::trim).filter(|b| !b.is_empty());
        let messages = match target {
            ChatTarget::Peer(peer) => {
                with_deadline(
                    deadline,
                    self.repo.direct_history(&claims.user_id, peer, before, limit),
                )
                .await?
            }
            ChatTarget::Group(group_id) => {
                self.require_group_member(claims, group_id).await?;
                with_deadline(deadline, self.repo.group_history(group_id, before, limit)).await?
            }
        };
        Ok(self.filter_visible(claims, messages))
    }

    pub async fn get_thread(
        &self,
        claims: &ClaimSet,
        parent_id: &str,
        deadline: Deadline,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        self.visible_message(claims, parent_id, deadline).await?;
        let replies =
            with_deadline(deadline, self.repo.thread_messages(parent_id, MAX_HISTORY_LIMIT))
                .await?;
        Ok(self.filter_visible(claims, replies))
    }

    pub async fn edit(
        &self,
        claims: &ClaimSet,
        message_id: &str,
        content: &str,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(CoreError::invalid("content is required"));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(CoreError::invalid(format!(
                "content exceeds {MAX_CONTENT_CHARS} characters"
            )));
        }
        let message = self.live_message(claims, message_id, deadline).await?;
        if message.sender_id != claims.user_id {
            return Err(CoreError::denied("only the sender can edit a message"));
        }
        let mut history = message.edit_history.clone();
        history.push(EditRecord {
            previous_content: message.content.clone(),
            edited_at: Timestamp::now(),
        });
        let edited = with_deadline(
            deadline,
            self.repo.edit_message(message_id, content, &history),
        )
        .await?;
        self.publish(UpdateAction::Edit, &claims.user_id, edited.clone())
            .await;
        Ok(edited)
    }

    pub async fn delete(
        &self,
        claims: &ClaimSet,
        message_id: &str,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let message = self.live_message(claims, message_id, deadline).await?;
        if message.sender_id != claims.user_id && !claims.is_admin() {
            return Err(CoreError::denied("only the sender or an admin can delete"));
        }
        let deleted = with_deadline(deadline, self.repo.soft_delete(message_id, Utc::now())).await?;
        if !deleted {
            return Err(CoreError::not_found(format!("message {message_id}")));
        }
        let marker = tombstone(&message);
        self.publish(UpdateAction::Delete, &claims.user_id, marker.clone())
            .await;
        Ok(marker)
    }

    pub async fn add_reaction(
        &self,
        claims: &ClaimSet,
        message_id: &str,
        kind: &str,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let kind = kind.trim();
        if kind.is_empty() || kind.chars().count() > 32 {
            return Err(CoreError::invalid("reaction kind must be 1 to 32 characters"));
        }
        self.live_message(claims, message_id, deadline).await?;
        with_deadline(
            deadline,
            self.repo.add_reaction(message_id, &claims.user_id, kind),
        )
        .await?;
        let updated = self.live_message(claims, message_id, deadline).await?;
        self.publish(UpdateAction::React, &claims.user_id, updated.clone())
            .await;
        Ok(updated)
    }

    pub async fn remove_reaction(
        &self,
        claims: &ClaimSet,
        message_id: &str,
        kind: &str,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        self.live_message(claims, message_id, deadline).await?;
        with_deadline(
            deadline,
            self.repo.remove_reaction(message_id, &claims.user_id, kind.trim()),
        )
        .await?;
        let updated = self.live_message(claims, message_id, deadline).await?;
        self.publish(UpdateAction::Unreact, &claims.user_id, updated.clone())
            .await;
        Ok(updated)
    }

    /// Returns whether the caller likes the message after the toggle.
    pub async fn toggle_like(
        &self,
        claims: &ClaimSet,
        message_id: &str,
        deadline: Deadline,
    ) -> Result<(bool, ChatMessage), CoreError> {
        self.live_message(claims, message_id, deadline).await?;
        let liked =
            with_deadline(deadline, self.repo.toggle_like(message_id, &claims.user_id)).await?;
        let updated = self.live_message(claims, message_id, deadline).await?;
        self.publish(UpdateAction::Like, &claims.user_id, updated.clone())
            .await;
        Ok((liked, updated))
    }

    pub async fn pin(
        &self,
        claims: &ClaimSet,
        message_id: &str,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let message = self.live_message(claims, message_id, deadline).await?;
        let key = chat_key_of(&message);
        with_deadline(deadline, self.repo.pin(&key, message_id, &claims.user_id)).await?;
        let updated = self.live_message(claims, message_id, deadline).await?;
        self.publish(UpdateAction::Pin, &claims.user_id, updated.clone())
            .await;
        Ok(updated)
    }

    pub async fn unpin(
        &self,
        claims: &ClaimSet,
        message_id: &str,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let message = self.visible_message(claims, message_id, deadline).await?;
        let key = chat_key_of(&message);
        with_deadline(deadline, self.repo.unpin(&key, message_id)).await?;
        let updated = self.visible_message(claims, message_id, deadline).await?;
        self.publish(UpdateAction::Unpin, &claims.user_id, updated.clone())
            .await;
        Ok(updated)
    }

    pub async fn get_pinned(
        &self,
        claims: &ClaimSet,
        target: &ChatTarget,
        deadline: Deadline,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let key = match target {
            ChatTarget::Peer(peer) => direct_chat_key(&claims.user_id, peer),
            ChatTarget::Group(group_id) => {
                self.require_group_member(claims, group_id).await?;
                group_chat_key(group_id)
            }
        };
        let pinned = with_deadline(deadline, self.repo.pinned(&key)).await?;
        Ok(self.filter_visible(claims, pinned))
    }

    /// Only the receiver of a direct message or a member of the group may mark it.
    pub async fn mark_read(
        &self,
        claims: &ClaimSet,
        message_id: &str,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let message = self.live_message(claims, message_id, deadline).await?;
        if !message.is_group && message.receiver_id != claims.user_id {
            return Err(CoreError::denied("only the receiver can mark a message read"));
        }
        let first_read = with_deadline(
            deadline,
            self.repo.mark_read(message_id, &claims.user_id, Utc::now()),
        )
        .await?;
        let mut message = message;
        if !message.is_group && message.status != MessageStatus::Read {
            with_deadline(deadline, self.repo.set_status(message_id, MessageStatus::Read)).await?;
            message.status = MessageStatus::Read;
        }
        if first_read {
            self.publish(UpdateAction::Read, &claims.user_id, message.clone())
                .await;
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{claims, new_session};
    use crate::registry::Registry;
    use crate::sink::SinkConfig;
    use crate::testing::memory_repository;
    use parley_models::stream::kind;
    use parley_models::SubscriptionTag;
    use std::time::Duration;

    struct Fixture {
        ops: MessageOps,
        repo: Arc<dyn ChatRepository>,
        registry: Arc<Registry>,
    }

    async fn fixture() -> Fixture {
        let repo: Arc<dyn ChatRepository> = memory_repository().await;
        let registry = Arc::new(Registry::new(16, SinkConfig::default()));
        let membership = Arc::new(MembershipCache::new(
            repo.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let router = Arc::new(Router::new(registry.clone(), membership.clone()));
        Fixture {
            ops: MessageOps::new(repo.clone(), router, membership),
            repo,
            registry,
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    async fn seed(repo: &Arc<dyn ChatRepository>, id: &str, from: &str, to: &str) -> ChatMessage {
        let mut msg = ChatMessage::text(from, to, "original");
        msg.id = id.into();
        msg.timestamp = Some(Timestamp::now());
        repo.save_message(&msg).await.unwrap()
    }

    #[tokio::test]
    async fn only_the_sender_may_edit_and_history_is_kept() {
        let fx = fixture().await;
        seed(&fx.repo, "m1", "u1", "u2").await;
        let watcher = fx
            .registry
            .register(new_session("u2", SubscriptionTag::MessageUpdates, &[]))
            .unwrap();

        assert!(matches!(
            fx.ops.edit(&claims("u2"), "m1", "hijack", deadline()).await,
            Err(CoreError::PermissionDenied(_))
        ));
        let edited = fx
            .ops
            .edit(&claims("u1"), "m1", " updated ", deadline())
            .await
            .unwrap();
        assert_eq!(edited.content, "updated");
        assert_eq!(edited.edit_history.len(), 1);
        assert_eq!(edited.edit_history[0].previous_content, "original");

        let updates = watcher.session.sink().try_take(10);
        let state = updates[0].as_state().unwrap();
        assert_eq!(state.kind, kind::MESSAGE_UPDATE);
        assert_eq!(state.payload_json().unwrap()["action"], "edit");
    }

    #[tokio::test]
    async fn deleted_messages_are_hidden_from_other_participants() {
        let fx = fixture().await;
        seed(&fx.repo, "m1", "u1", "u2").await;
        assert!(matches!(
            fx.ops.delete(&claims("u2"), "m1", deadline()).await,
            Err(CoreError::PermissionDenied(_))
        ));
        let marker = fx.ops.delete(&claims("u1"), "m1", deadline()).await.unwrap();
        assert!(marker.deleted);
        assert!(marker.content.is_empty());

        let target = ChatTarget::Peer("u1".into());
        let seen_by_peer = fx
            .ops
            .get_messages(&claims("u2"), &target, None, None, deadline())
            .await
            .unwrap();
        assert!(seen_by_peer.is_empty());
        assert!(fx.ops.visible_message(&claims("u1"), "m1", deadline()).await.is_ok());
        assert!(matches!(
            fx.ops.visible_message(&claims("u2"), "m1", deadline()).await,
            Err(CoreError::NotFound(_))
        ));
        // A second delete has nothing left to remove.
        assert!(fx.ops.delete(&claims("u1"), "m1", deadline()).await.is_err());
    }

    #[tokio::test]
    async fn reactions_conflict_on_duplicate_and_404_when_absent() {
        let fx = fixture().await;
        seed(&fx.repo, "m1", "u1", "u2").await;
        let updated = fx
            .ops
            .add_reaction(&claims("u2"), "m1", "👍", deadline())
            .await
            .unwrap();
        assert!(updated.has_reaction("u2", "👍"));
        assert!(matches!(
            fx.ops.add_reaction(&claims("u2"), "m1", "👍", deadline()).await,
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            fx.ops.remove_reaction(&claims("u2"), "m1", "🎉", deadline()).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            fx.ops.add_reaction(&claims("u3"), "m1", "👍", deadline()).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pins_are_per_chat() {
        let fx = fixture().await;
        seed(&fx.repo, "m1", "u1", "u2").await;
        let pinned = fx.ops.pin(&claims("u2"), "m1", deadline()).await.unwrap();
        assert!(pinned.is_pinned);
        assert!(matches!(
            fx.ops.pin(&claims("u1"), "m1", deadline()).await,
            Err(CoreError::Conflict(_))
        ));
        let list = fx
            .ops
            .get_pinned(&claims("u1"), &ChatTarget::Peer("u2".into()), deadline())
            .await
            .unwrap();
        assert_eq!(list.len(), 1);
        fx.ops.unpin(&claims("u1"), "m1", deadline()).await.unwrap();
        assert!(matches!(
            fx.ops.unpin(&claims("u1"), "m1", deadline()).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn likes_toggle() {
        let fx = fixture().await;
        seed(&fx.repo, "m1", "u1", "u2").await;
        let (liked, message) = fx.ops.toggle_like(&claims("u2"), "m1", deadline()).await.unwrap();
        assert!(liked);
        assert_eq!(message.liked_by, vec!["u2".to_string()]);
        let (liked, _) = fx.ops.toggle_like(&claims("u2"), "m1", deadline()).await.unwrap();
        assert!(!liked);
    }

    #[tokio::test]
    async fn only_the_receiver_marks_direct_messages_read() {
        let fx = fixture().await;
        seed(&fx.repo, "m1", "u1", "u2").await;
        assert!(matches!(
            fx.ops.mark_read(&claims("u1"), "m1", deadline()).await,
            Err(CoreError::PermissionDenied(_))
        ));
        let read = fx.ops.mark_read(&claims("u2"), "m1", deadline()).await.unwrap();
        assert_eq!(read.status, MessageStatus::Read);
        let stored = fx.repo.get_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn group_history_requires_membership() {
        let fx = fixture().await;
        fx.repo
            .create_group("g1", "team", "u1", &["u2".to_string()])
            .await
            .unwrap();
        let target = ChatTarget::Group("g1".into());
        assert!(fx
            .ops
            .get_messages(&claims("u2"), &target, None, Some(10), deadline())
            .await
            .is_ok());
        assert!(matches!(
            fx.ops
                .get_messages(&claims("u3"), &target, None, Some(10), deadline())
                .await,
            Err(CoreError::PermissionDenied(_))
        ));
    }

    #[test]
    fn chat_target_needs_exactly_one_id() {
        assert_eq!(
            ChatTarget::from_ids(Some("u2"), None).unwrap(),
            ChatTarget::Peer("u2".into())
        );
        assert!(ChatTarget::from_ids(Some("u2"), Some("g1")).is_err());
        assert!(ChatTarget::from_ids(Some(" "), None).is_err());
    }
}
