//! Message pipeline: validated inbound envelopes become persisted state plus
//! a delivery plan. One stream's frames are processed sequentially by its
//! dispatcher, which keeps that stream's outbound messages in accept order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parley_db::scheduled::ScheduledRow;
use parley_models::stream::kind;
use parley_models::{
    ChatMessage, Envelope, Payload, PresenceStatus, StateMessage, SubscriptionTag,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::ClaimSet;
use crate::error::CoreError;
use crate::membership::MembershipCache;
use crate::plan::{ChatRef, DeliveryPlan, PlanBody};
use crate::presence::PresenceIndex;
use crate::ratelimit::{FrameClass, UserRateLimits};
use crate::repository::{with_deadline, ChatRepository, Deadline};
use crate::router::Router;
use crate::session::{Session, SessionId};
use crate::sink::Priority;
use crate::updates::MessageOps;
use crate::validation::{normalize_message, scheduled_time, ValidationRules};

#[derive(Debug, Deserialize)]
struct TypingPayload {
    chat_id: String,
    #[serde(default)]
    is_group: bool,
    #[serde(default = "default_true")]
    typing: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PresencePayload {
    status: String,
    #[serde(default)]
    custom_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TargetPayload {
    #[serde(default)]
    target_user_id: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FilterPayload {
    #[serde(default)]
    peers: Vec<String>,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReadPayload {
    message_id: String,
}

fn parse_payload<T: for<'de> Deserialize<'de>>(state: &StateMessage) -> Result<T, CoreError> {
    serde_json::from_slice(&state.payload)
        .map_err(|e| CoreError::invalid(format!("malformed {} payload: {e}", state.kind)))
}

/// Turns a core error into the envelope sent back to the originating session.
/// Internal details are replaced by a correlation id.
pub fn error_envelope(err: &CoreError) -> Envelope {
    if err.is_internal() {
        let correlation_id = Uuid::new_v4();
        tracing::error!(%correlation_id, error = %err, "internal error on stream");
        Envelope::error(
            err.status_code(),
            format!("internal error (correlation id {correlation_id})"),
        )
    } else {
        Envelope::error(err.status_code(), err.to_string())
    }
}

pub struct Pipeline {
    repo: Arc<dyn ChatRepository>,
    router: Arc<Router>,
    membership: Arc<MembershipCache>,
    presence: Arc<PresenceIndex>,
    ops: Arc<MessageOps>,
    limits: UserRateLimits,
    rules: ValidationRules,
    rpc_deadline: Duration,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn ChatRepository>,
        router: Arc<Router>,
        membership: Arc<MembershipCache>,
        presence: Arc<PresenceIndex>,
        ops: Arc<MessageOps>,
        limits: UserRateLimits,
        rules: ValidationRules,
        rpc_deadline: Duration,
    ) -> Self {
        Self {
            repo,
            router,
            membership,
            presence,
            ops,
            limits,
            rules,
            rpc_deadline,
        }
    }

    pub fn rate_limits(&self) -> &UserRateLimits {
        &self.limits
    }

    pub fn default_deadline(&self) -> Deadline {
        Deadline::after(self.rpc_deadline)
    }

    /// Processes one inbound envelope from an active stream. Failures are
    /// reported on that session only, and the stream stays open. Envelopes
    /// from a closed session are ignored.
    pub async fn handle_envelope(&self, session: &Arc<Session>, envelope: Envelope) {
        if session.sink().is_closed() {
            tracing::debug!(
                session_id = %session.id,
                user_id = %session.user_id,
                "envelope from closed session ignored"
            );
            return;
        }
        session.touch();
        if let Err(err) = self.dispatch(session, envelope).await {
            tracing::debug!(
                session_id = %session.id,
                user_id = %session.user_id,
                error = %err,
                "inbound envelope rejected"
            );
            self.reply_error(session, &err);
        }
    }

    /// Reports `err` on `session` alone.
    pub fn reply_error(&self, session: &Session, err: &CoreError) -> bool {
        self.router.push_direct(session, Arc::new(error_envelope(err)))
    }

    async fn dispatch(&self, session: &Arc<Session>, envelope: Envelope) -> Result<(), CoreError> {
        let echo = envelope.echo;
        match envelope.payload {
            Payload::Message(message) => {
                if let Err(retry_after_ms) = self.limits.check(&session.user_id, FrameClass::Message)
                {
                    return Err(CoreError::RateLimited { retry_after_ms });
                }
                let deadline = self.default_deadline();
                if message.is_scheduled || message.scheduled_at.is_some() {
                    self.schedule(&session.claims, message, deadline).await?;
                    return Ok(());
                }
                self.submit(&session.claims, Some(session.id), echo, message, deadline)
                    .await?;
                Ok(())
            }
            Payload::State(state) => self.handle_state(session, state).await,
            Payload::Error(_) => Err(CoreError::invalid("clients may not send error envelopes")),
        }
    }

    /// Validates, persists, then fans out. Nothing is delivered unless the
    /// repository accepted the write.
    pub async fn submit(
        &self,
        claims: &ClaimSet,
        origin: Option<SessionId>,
        echo: bool,
        message: ChatMessage,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let message = self.prepare(claims, message, deadline).await?;
        let saved = with_deadline(deadline, self.repo.save_message(&message)).await?;
        tracing::debug!(
            message_id = %saved.id,
            sender_id = %saved.sender_id,
            is_group = saved.is_group,
            "message persisted"
        );

        let mut plan = DeliveryPlan::message(saved.clone());
        if let Some(origin) = origin {
            plan = plan.from_session(origin, echo);
        }
        self.router.execute(&plan).await;
        Ok(saved)
    }

    /// Validation, reference resolution and membership checks shared by live
    /// and scheduled messages.
    async fn prepare(
        &self,
        claims: &ClaimSet,
        message: ChatMessage,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let mut message = normalize_message(message, &claims.user_id, &self.rules, Utc::now())?;

        if message.is_group {
            let group = self.membership.members(&message.group_id, deadline).await?;
            if !group.contains(&claims.user_id) {
                return Err(CoreError::denied("not a member of this group"));
            }
        }

        if let Some(reply_to) = message.reply_to.clone() {
            self.resolve_reference(claims, &reply_to, "reply_to", deadline)
                .await?;
        }

        if let Some(parent_id) = message.parent_message_id.clone() {
            let parent = self
                .resolve_reference(claims, &parent_id, "parent_message_id", deadline)
                .await?;
            if !same_chat(&parent, &message) {
                return Err(CoreError::invalid(
                    "parent_message_id belongs to a different chat",
                ));
            }
            if message.thread_id.is_none() {
                message.thread_id = Some(parent.thread_id.clone().unwrap_or(parent.id));
            }
        }
        Ok(message)
    }

    /// A referenced message must exist, not be tombstoned, and be visible to
    /// the sender. Any failure is a validation error.
    async fn resolve_reference(
        &self,
        claims: &ClaimSet,
        id: &str,
        field: &str,
        deadline: Deadline,
    ) -> Result<ChatMessage, CoreError> {
        let found = with_deadline(deadline, self.repo.get_message(id)).await?;
        let referenced = found
            .filter(|m| !m.deleted)
            .ok_or_else(|| CoreError::invalid(format!("{field} does not reference a message")))?;
        if !self.membership.can_view(claims, &referenced, deadline).await? {
            return Err(CoreError::invalid(format!(
                "{field} does not reference a message"
            )));
        }
        Ok(referenced)
    }

    /// Stores a future-dated message without fanning it out.
    pub async fn schedule(
        &self,
        claims: &ClaimSet,
        message: ChatMessage,
        deadline: Deadline,
    ) -> Result<ScheduledRow, CoreError> {
        let at = scheduled_time(&message, Utc::now())?;
        let mut message = self.prepare(claims, message, deadline).await?;
        message.is_scheduled = true;
        message.scheduled_at = Some(at.into());
        let row = with_deadline(deadline, self.repo.schedule(&message, at)).await?;
        tracing::info!(
            scheduled_id = %row.id,
            sender_id = %row.sender_id,
            scheduled_at = %row.scheduled_at,
            "message scheduled"
        );
        Ok(row)
    }

    pub async fn cancel_scheduled(
        &self,
        claims: &ClaimSet,
        id: &str,
        deadline: Deadline,
    ) -> Result<(), CoreError> {
        let row = with_deadline(deadline, self.repo.get_scheduled(id))
            .await?
            .ok_or_else(|| CoreError::not_found(format!("scheduled message {id}")))?;
        if row.sender_id != claims.user_id {
            return Err(CoreError::denied("only the sender can cancel"));
        }
        if !with_deadline(deadline, self.repo.cancel_scheduled(id)).await? {
            return Err(CoreError::not_found(format!("scheduled message {id}")));
        }
        Ok(())
    }

    pub async fn list_scheduled(
        &self,
        claims: &ClaimSet,
        deadline: Deadline,
    ) -> Result<Vec<ScheduledRow>, CoreError> {
        with_deadline(deadline, self.repo.list_scheduled(&claims.user_id)).await
    }

    async fn handle_state(&self, session: &Arc<Session>, state: StateMessage) -> Result<(), CoreError> {
        if !state.user_id.is_empty() && state.user_id != session.user_id {
            return Err(CoreError::denied("state user_id does not match the session user"));
        }
        let class = match state.kind.as_str() {
            kind::HEARTBEAT | kind::AUTHORIZATION => {
                return Ok(());
            }
            kind::TYPING => FrameClass::Typing,
            kind::PRESENCE => FrameClass::Presence,
            _ => FrameClass::Other,
        };
        if let Err(retry_after_ms) = self.limits.check(&session.user_id, class) {
            return match class {
                FrameClass::Typing | FrameClass::Presence => Ok(()),
                _ => Err(CoreError::RateLimited { retry_after_ms }),
            };
        }

        match state.kind.as_str() {
            kind::TYPING => self.typing(session, &state).await,
            kind::PRESENCE => {
                let payload: PresencePayload = parse_payload(&state)?;
                let status = PresenceStatus::parse(&payload.status)
                    .ok_or_else(|| CoreError::invalid(format!("unknown status {}", payload.status)))?;
                self.presence
                    .set_status(&session.user_id, status, payload.custom_message, false)
                    .await?;
                Ok(())
            }
            kind::SIGNAL => {
                let payload: TargetPayload = parse_payload(&state)?;
                let target = payload
                    .target_user_id
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| CoreError::invalid("target_user_id is required"))?;
                let plan = DeliveryPlan::targeted(
                    vec![target],
                    vec![SubscriptionTag::ChatEvents],
                    Envelope::state(kind::SIGNAL, &session.user_id, state.payload),
                    Priority::Essential,
                );
                self.router.execute(&plan.from_session(session.id, false)).await;
                Ok(())
            }
            kind::SCREEN_SHARE => self.screen_share(session, state).await,
            kind::SUBSCRIBE => self.subscribe(session, &state).await,
            kind::UNSUBSCRIBE => {
                let payload: FilterPayload = parse_payload(&state)?;
                session.update_filter(|f| {
                    for peer in &payload.peers {
                        f.peers.remove(peer.trim());
                    }
                    for group in &payload.groups {
                        f.groups.remove(group.trim());
                    }
                });
                Ok(())
            }
            kind::READ => {
                let payload: ReadPayload = parse_payload(&state)?;
                self.ops
                    .mark_read(&session.claims, payload.message_id.trim(), self.default_deadline())
                    .await?;
                Ok(())
            }
            other => Err(CoreError::invalid(format!("unknown state kind {other}"))),
        }
    }

    async fn typing(&self, session: &Arc<Session>, state: &StateMessage) -> Result<(), CoreError> {
        let payload: TypingPayload = parse_payload(state)?;
        let chat_id = payload.chat_id.trim();
        if chat_id.is_empty() {
            return Err(CoreError::invalid("chat_id is required"));
        }
        let chat = if payload.is_group {
            let deadline = self.membership.deadline();
            if !self
                .membership
                .is_member(chat_id, &session.user_id, deadline)
                .await?
            {
                return Err(CoreError::denied("not a member of this group"));
            }
            ChatRef::Group(chat_id.to_string())
        } else {
            ChatRef::Direct {
                a: session.user_id.clone(),
                b: chat_id.to_string(),
            }
        };
        let plan = DeliveryPlan::new(PlanBody::Typing {
            sender: session.user_id.clone(),
            chat,
            typing: payload.typing,
        })
        .from_session(session.id, false);
        self.router.execute(&plan).await;
        Ok(())
    }

    async fn screen_share(&self, session: &Arc<Session>, state: StateMessage) -> Result<(), CoreError> {
        let payload: TargetPayload = parse_payload(&state)?;
        let users = match (
            payload.target_user_id.filter(|t| !t.trim().is_empty()),
            payload.group_id.filter(|g| !g.trim().is_empty()),
        ) {
            (Some(target), None) => vec![target],
            (None, Some(group_id)) => {
                let group = self
                    .membership
                    .members(&group_id, self.membership.deadline())
                    .await?;
                if !group.contains(&session.user_id) {
                    return Err(CoreError::denied("not a member of this group"));
                }
                group
                    .members
                    .iter()
                    .filter(|m| **m != session.user_id)
                    .cloned()
                    .collect()
            }
            _ => {
                return Err(CoreError::invalid(
                    "exactly one of target_user_id and group_id is required",
                ))
            }
        };
        let plan = DeliveryPlan::targeted(
            users,
            vec![SubscriptionTag::ScreenShare],
            Envelope::state(kind::SCREEN_SHARE, &session.user_id, state.payload),
            Priority::Essential,
        )
        .from_session(session.id, false);
        self.router.execute(&plan).await;
        Ok(())
    }

    /// Peers are admitted as given; groups only when the user is a member.
    async fn subscribe(&self, session: &Arc<Session>, state: &StateMessage) -> Result<(), CoreError> {
        let payload: FilterPayload = parse_payload(state)?;
        let (admitted, denied) = self.admit_groups(&session.user_id, &payload.groups).await?;
        session.update_filter(|f| {
            f.peers.extend(
                payload
                    .peers
                    .iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty()),
            );
            f.groups.extend(admitted);
        });
        if denied.is_empty() {
            Ok(())
        } else {
            Err(CoreError::denied(format!(
                "not a member of: {}",
                denied.join(", ")
            )))
        }
    }

    /// Splits `groups` into those `user_id` belongs to and the rest.
    pub async fn admit_groups(
        &self,
        user_id: &str,
        groups: &[String],
    ) -> Result<(Vec<String>, Vec<String>), CoreError> {
        let deadline = self.membership.deadline();
        let mut admitted = Vec::new();
        let mut denied = Vec::new();
        for group in groups.iter().map(|g| g.trim()).filter(|g| !g.is_empty()) {
            match self.membership.is_member(group, user_id, deadline).await {
                Ok(true) => admitted.push(group.to_string()),
                Ok(false) | Err(CoreError::NotFound(_)) => denied.push(group.to_string()),
                Err(err) => return Err(err),
            }
        }
        Ok((admitted, denied))
    }
}

fn same_chat(parent: &ChatMessage, reply: &ChatMessage) -> bool {
    if parent.is_group || reply.is_group {
        return parent.is_group && reply.is_group && parent.group_id == reply.group_id;
    }
    let mut a = [parent.sender_id.as_str(), parent.receiver_id.as_str()];
    let mut b = [reply.sender_id.as_str(), reply.receiver_id.as_str()];
    a.sort_unstable();
    b.sort_unstable();
    a == b
}
