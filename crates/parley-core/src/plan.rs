//! Value-typed delivery plans. Plans refer to sessions by id only.

use std::sync::Arc;

use parley_models::{ChatMessage, Envelope, PresenceRecord, SubscriptionTag};
use uuid::Uuid;

use crate::session::SessionId;
use crate::sink::Priority;

/// A chat as addressed by a typing indicator or a pin list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRef {
    Direct { a: String, b: String },
    Group(String),
}

impl ChatRef {
    pub fn of(message: &ChatMessage) -> Self {
        if message.is_group {
            ChatRef::Group(message.group_id.clone())
        } else {
            ChatRef::Direct {
                a: message.sender_id.clone(),
                b: message.receiver_id.clone(),
            }
        }
    }

    /// The chat id as seen from `viewer`.
    pub fn id_for<'a>(&'a self, viewer: &str) -> &'a str {
        match self {
            ChatRef::Group(id) => id,
            ChatRef::Direct { a, b } if a == viewer => b,
            ChatRef::Direct { a, .. } => a,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Edit,
    Delete,
    React,
    Unreact,
    Like,
    Pin,
    Unpin,
    Read,
}

impl UpdateAction {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateAction::Edit => "edit",
            UpdateAction::Delete => "delete",
            UpdateAction::React => "react",
            UpdateAction::Unreact => "unreact",
            UpdateAction::Like => "like",
            UpdateAction::Pin => "pin",
            UpdateAction::Unpin => "unpin",
            UpdateAction::Read => "read",
        }
    }

    pub fn is_reaction(self) -> bool {
        matches!(self, UpdateAction::React | UpdateAction::Unreact)
    }
}

#[derive(Debug, Clone)]
pub enum PlanBody {
    Message(Arc<ChatMessage>),
    MessageUpdate {
        action: UpdateAction,
        /// User that performed the action.
        actor: String,
        message: Arc<ChatMessage>,
    },
    Typing {
        sender: String,
        chat: ChatRef,
        typing: bool,
    },
    Presence {
        record: PresenceRecord,
        /// Status transitions are essential; repeats are heartbeats.
        essential: bool,
    },
    UserStatus {
        record: PresenceRecord,
    },
    /// Prebuilt envelope for a fixed set of users and tags.
    Targeted {
        users: Vec<String>,
        tags: Vec<SubscriptionTag>,
        envelope: Arc<Envelope>,
        priority: Priority,
    },
}

impl PlanBody {
    pub fn kind(&self) -> &'static str {
        match self {
            PlanBody::Message(_) => "message",
            PlanBody::MessageUpdate { .. } => "message_update",
            PlanBody::Typing { .. } => "typing",
            PlanBody::Presence { .. } => "presence",
            PlanBody::UserStatus { .. } => "user_status",
            PlanBody::Targeted { .. } => "targeted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryPlan {
    pub plan_id: Uuid,
    /// Excluded from the audience unless `echo` is set.
    pub origin: Option<SessionId>,
    pub echo: bool,
    pub body: PlanBody,
}

impl DeliveryPlan {
    pub fn new(body: PlanBody) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            origin: None,
            echo: false,
            body,
        }
    }

    pub fn from_session(mut self, origin: SessionId, echo: bool) -> Self {
        self.origin = Some(origin);
        self.echo = echo;
        self
    }

    pub fn message(message: ChatMessage) -> Self {
        Self::new(PlanBody::Message(Arc::new(message)))
    }

    pub fn update(action: UpdateAction, actor: &str, message: ChatMessage) -> Self {
        Self::new(PlanBody::MessageUpdate {
            action,
            actor: actor.to_string(),
            message: Arc::new(message),
        })
    }

    pub fn targeted(
        users: Vec<String>,
        tags: Vec<SubscriptionTag>,
        envelope: Envelope,
        priority: Priority,
    ) -> Self {
        Self::new(PlanBody::Targeted {
            users,
            tags,
            envelope: Arc::new(envelope),
            priority,
        })
    }

    pub(crate) fn excludes(&self, session: SessionId) -> bool {
        !self.echo && self.origin == Some(session)
    }
}

/// Per-plan counters returned by the router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub targeted: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub coalesced: usize,
    pub evicted: usize,
    pub failed: usize,
}
