//! Fan-out router: resolves a plan's audience against the registry and pushes
//! onto each session's sink. Pushes never await, so delivering a plan holds
//! no lock and performs no I/O beyond the membership lookup that precedes it.

use std::sync::Arc;

use parley_models::stream::kind;
use parley_models::{ChatMessage, Envelope, PresenceRecord, SubscriptionTag};
use serde_json::json;

use crate::membership::{GroupSnapshot, MembershipCache};
use crate::plan::{ChatRef, DeliveryPlan, DeliveryReport, PlanBody, UpdateAction};
use crate::registry::Registry;
use crate::session::{CloseReason, Session};
use crate::sink::{Priority, PushError, PushOutcome};

pub const NOTIFICATION_PREVIEW_CHARS: usize = 80;

pub struct Router {
    registry: Arc<Registry>,
    membership: Arc<MembershipCache>,
}

struct Delivery {
    session: Arc<Session>,
    envelope: Arc<Envelope>,
    priority: Priority,
}

impl Router {
    pub fn new(registry: Arc<Registry>, membership: Arc<MembershipCache>) -> Self {
        Self {
            registry,
            membership,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn membership(&self) -> &Arc<MembershipCache> {
        &self.membership
    }

    /// Resolves group membership if the plan needs it, then delivers.
    /// Never fails: problems are counted in the report and logged.
    pub async fn execute(&self, plan: &DeliveryPlan) -> DeliveryReport {
        let group_id = match &plan.body {
            PlanBody::Message(m) | PlanBody::MessageUpdate { message: m, .. } if m.is_group => {
                Some(m.group_id.as_str())
            }
            PlanBody::Typing {
                chat: ChatRef::Group(id),
                ..
            } => Some(id.as_str()),
            _ => None,
        };
        let group = match group_id {
            Some(id) => match self.membership.members(id, self.membership.deadline()).await {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    tracing::warn!(
                        plan_id = %plan.plan_id,
                        group_id = %id,
                        error = %err,
                        "membership lookup failed, plan not delivered"
                    );
                    return DeliveryReport {
                        failed: 1,
                        ..Default::default()
                    };
                }
            },
            None => None,
        };
        self.execute_local(plan, group.as_deref())
    }

    /// Delivers with an already-resolved group snapshot. Synchronous.
    pub fn execute_local(&self, plan: &DeliveryPlan, group: Option<&GroupSnapshot>) -> DeliveryReport {
        let deliveries = self.resolve(plan, group);
        let mut report = DeliveryReport {
            targeted: deliveries.len(),
            ..Default::default()
        };
        for delivery in deliveries {
            if plan.excludes(delivery.session.id) {
                report.targeted -= 1;
                continue;
            }
            match delivery
                .session
                .sink()
                .push(delivery.envelope, delivery.priority)
            {
                Ok(PushOutcome::Queued) => report.delivered += 1,
                Ok(PushOutcome::Replaced) => {
                    report.delivered += 1;
                    report.coalesced += 1;
                }
                Ok(PushOutcome::DroppedOldest) => {
                    report.delivered += 1;
                    report.dropped += 1;
                }
                Ok(PushOutcome::Dropped) => report.dropped += 1,
                Err(PushError::SlowConsumer) => {
                    report.failed += 1;
                    tracing::warn!(
                        plan_id = %plan.plan_id,
                        session_id = %delivery.session.id,
                        error = %PushError::SlowConsumer,
                        "delivery failed"
                    );
                    if self
                        .registry
                        .evict(delivery.session.id, CloseReason::SlowConsumer)
                        .is_some()
                    {
                        report.evicted += 1;
                    }
                }
                Err(err @ PushError::Closed) => {
                    report.failed += 1;
                    tracing::warn!(
                        plan_id = %plan.plan_id,
                        session_id = %delivery.session.id,
                        error = %err,
                        "delivery failed"
                    );
                }
            }
        }
        tracing::debug!(
            plan_id = %plan.plan_id,
            kind = plan.body.kind(),
            targeted = report.targeted,
            delivered = report.delivered,
            dropped = report.dropped,
            coalesced = report.coalesced,
            evicted = report.evicted,
            failed = report.failed,
            "plan delivered"
        );
        report
    }

    /// Pushes one essential envelope to a single session outside any plan,
    /// with the same slow-consumer eviction as plan delivery.
    pub fn push_direct(&self, session: &Session, envelope: Arc<Envelope>) -> bool {
        match session.sink().push(envelope, Priority::Essential) {
            Ok(_) => true,
            Err(PushError::SlowConsumer) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %PushError::SlowConsumer,
                    "direct push failed"
                );
                self.registry.evict(session.id, CloseReason::SlowConsumer);
                false
            }
            Err(PushError::Closed) => false,
        }
    }

    fn resolve(&self, plan: &DeliveryPlan, group: Option<&GroupSnapshot>) -> Vec<Delivery> {
        match &plan.body {
            PlanBody::Message(message) => self.message_audience(message, group),
            PlanBody::MessageUpdate {
                action,
                actor,
                message,
            } => self.update_audience(*action, actor, message, group),
            PlanBody::Typing {
                sender,
                chat,
                typing,
            } => self.typing_audience(sender, chat, *typing, group),
            PlanBody::Presence { record, essential } => {
                let priority = if *essential {
                    Priority::Essential
                } else {
                    Priority::Nonessential
                };
                self.watchers_of(record, SubscriptionTag::Presence, kind::PRESENCE, priority)
            }
            PlanBody::UserStatus { record } => self.watchers_of(
                record,
                SubscriptionTag::UserStatus,
                kind::USER_STATUS,
                Priority::Essential,
            ),
            PlanBody::Targeted {
                users,
                tags,
                envelope,
                priority,
            } => self
                .registry
                .sessions_for_users(users.iter().map(String::as_str), |s| tags.contains(&s.tag))
                .into_iter()
                .map(|session| Delivery {
                    session,
                    envelope: envelope.clone(),
                    priority: priority.clone(),
                })
                .collect(),
        }
    }

    fn participants<'a>(message: &'a ChatMessage, group: Option<&'a GroupSnapshot>) -> Vec<&'a str> {
        if message.is_group {
            group
                .map(|g| g.members.iter().map(String::as_str).collect())
                .unwrap_or_default()
        } else {
            vec![message.sender_id.as_str(), message.receiver_id.as_str()]
        }
    }

    /// `chat` sessions that follow the chat a thread hangs off.
    fn follows_parent_chat(session: &Session, message: &ChatMessage) -> bool {
        if message.is_group {
            session.with_filter(|f| f.has_group(&message.group_id))
        } else {
            message.is_direct_participant(&session.user_id)
                && session.with_filter(|f| f.has_peer(message.chat_id_for(&session.user_id)))
        }
    }

    fn conversation_sessions(
        &self,
        message: &ChatMessage,
        participants: &[&str],
        tags: &[SubscriptionTag],
    ) -> Vec<Arc<Session>> {
        match &message.parent_message_id {
            Some(parent) => {
                let thread = SubscriptionTag::Thread(parent.clone());
                self.registry
                    .sessions_for_users(participants.iter().copied(), |s| {
                        s.tag == thread
                            || (s.tag == SubscriptionTag::Chat
                                && Self::follows_parent_chat(s, message))
                    })
            }
            None => self
                .registry
                .sessions_for_users(participants.iter().copied(), |s| tags.contains(&s.tag)),
        }
    }

    fn message_audience(&self, message: &Arc<ChatMessage>, group: Option<&GroupSnapshot>) -> Vec<Delivery> {
        let participants = Self::participants(message, group);
        let envelope = Arc::new(Envelope::message(message.as_ref().clone()));
        let mut out: Vec<Delivery> = self
            .conversation_sessions(
                message,
                &participants,
                &[SubscriptionTag::Chat, SubscriptionTag::MessageUpdates],
            )
            .into_iter()
            .map(|session| Delivery {
                session,
                envelope: envelope.clone(),
                priority: Priority::Essential,
            })
            .collect();

        for session in self
            .registry
            .sessions_for_users(participants.iter().copied(), |s| {
                s.tag == SubscriptionTag::LastMessage
            })
        {
            let chat_id = message.chat_id_for(&session.user_id).to_string();
            let tracked = session.with_filter(|f| {
                if f.is_empty() {
                    !message.is_group
                } else {
                    f.has_chat(&chat_id)
                }
            });
            if tracked {
                out.push(Delivery {
                    session,
                    envelope: envelope.clone(),
                    priority: Priority::Coalesce(chat_id),
                });
            }
        }

        let recipients: Vec<&str> = participants
            .iter()
            .copied()
            .filter(|u| *u != message.sender_id)
            .collect();
        for session in self
            .registry
            .sessions_for_users(recipients.iter().copied(), |s| {
                s.tag == SubscriptionTag::Notifications
            })
        {
            let payload = json!({
                "message_id": message.id,
                "chat_id": message.chat_id_for(&session.user_id),
                "sender_id": message.sender_id,
                "preview": message.preview(NOTIFICATION_PREVIEW_CHARS),
            });
            out.push(Delivery {
                session,
                envelope: Arc::new(Envelope::state_json(
                    kind::NOTIFICATION,
                    &message.sender_id,
                    &payload,
                )),
                priority: Priority::Essential,
            });
        }
        out
    }

    fn update_audience(
        &self,
        action: UpdateAction,
        actor: &str,
        message: &Arc<ChatMessage>,
        group: Option<&GroupSnapshot>,
    ) -> Vec<Delivery> {
        let participants = Self::participants(message, group);
        let payload = json!({ "action": action.as_str(), "message": message.as_ref() });
        let envelope = Arc::new(Envelope::state_json(kind::MESSAGE_UPDATE, actor, &payload));

        let mut sessions = self.registry.sessions_for_users(participants.iter().copied(), |s| {
            matches!(s.tag, SubscriptionTag::Chat | SubscriptionTag::MessageUpdates)
        });
        if let Some(parent) = &message.parent_message_id {
            let thread = SubscriptionTag::Thread(parent.clone());
            sessions.extend(
                self.registry
                    .sessions_for_users(participants.iter().copied(), |s| s.tag == thread),
            );
        }
        if action.is_reaction() && actor != message.sender_id {
            sessions.extend(
                self.registry
                    .sessions_for_users([message.sender_id.as_str()], |s| {
                        s.tag == SubscriptionTag::Notifications
                    }),
            );
        }
        sessions
            .into_iter()
            .map(|session| Delivery {
                session,
                envelope: envelope.clone(),
                priority: Priority::Essential,
            })
            .collect()
    }

    fn typing_audience(
        &self,
        sender: &str,
        chat: &ChatRef,
        typing: bool,
        group: Option<&GroupSnapshot>,
    ) -> Vec<Delivery> {
        let receivers: Vec<&str> = match chat {
            ChatRef::Direct { a, b } => {
                if a == sender {
                    vec![b.as_str()]
                } else {
                    vec![a.as_str()]
                }
            }
            ChatRef::Group(_) => group
                .map(|g| {
                    g.members
                        .iter()
                        .map(String::as_str)
                        .filter(|u| *u != sender)
                        .collect()
                })
                .unwrap_or_default(),
        };
        let is_group = matches!(chat, ChatRef::Group(_));
        self.registry
            .sessions_for_users(receivers, |s| {
                s.tag == SubscriptionTag::Typing
                    && s.with_filter(|f| f.has_chat(chat.id_for(&s.user_id)))
            })
            .into_iter()
            .map(|session| {
                let payload = json!({
                    "chat_id": chat.id_for(&session.user_id),
                    "is_group": is_group,
                    "typing": typing,
                });
                Delivery {
                    envelope: Arc::new(Envelope::state_json(kind::TYPING, sender, &payload)),
                    session,
                    priority: Priority::Nonessential,
                }
            })
            .collect()
    }

    fn watchers_of(
        &self,
        record: &PresenceRecord,
        tag: SubscriptionTag,
        state_kind: &str,
        priority: Priority,
    ) -> Vec<Delivery> {
        let envelope = Arc::new(Envelope::state_json(
            state_kind,
            &record.user_id,
            &json!(record),
        ));
        self.registry
            .snapshot(|s| s.tag == tag && s.with_filter(|f| f.has_peer(&record.user_id)))
            .into_iter()
            .map(|session| Delivery {
                session,
                envelope: envelope.clone(),
                priority: priority.clone(),
            })
            .collect()
    }
}
