use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// What a session wants to receive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionTag {
    Chat,
    Presence,
    Typing,
    LastMessage,
    /// Replies under one parent message.
    Thread(String),
    ChatEvents,
    ScreenShare,
    UserStatus,
    MessageUpdates,
    Notifications,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown subscription tag: {0}")]
pub struct UnknownTag(pub String);

impl SubscriptionTag {
    /// Whether the tag may be opened through the server-streaming subscribe route.
    pub fn is_subscribable(&self) -> bool {
        !matches!(self, SubscriptionTag::Chat)
    }

    pub fn thread_parent(&self) -> Option<&str> {
        match self {
            SubscriptionTag::Thread(parent) => Some(parent),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionTag::Chat => f.write_str("chat"),
            SubscriptionTag::Presence => f.write_str("presence"),
            SubscriptionTag::Typing => f.write_str("typing"),
            SubscriptionTag::LastMessage => f.write_str("last-message"),
            SubscriptionTag::Thread(parent) => write!(f, "thread:{parent}"),
            SubscriptionTag::ChatEvents => f.write_str("chat-events"),
            SubscriptionTag::ScreenShare => f.write_str("screen-share"),
            SubscriptionTag::UserStatus => f.write_str("user-status"),
            SubscriptionTag::MessageUpdates => f.write_str("message-updates"),
            SubscriptionTag::Notifications => f.write_str("notifications"),
        }
    }
}

impl FromStr for SubscriptionTag {
    type Err = UnknownTag;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let tag = match raw {
            "chat" => SubscriptionTag::Chat,
            "presence" => SubscriptionTag::Presence,
            "typing" => SubscriptionTag::Typing,
            "last-message" => SubscriptionTag::LastMessage,
            "chat-events" => SubscriptionTag::ChatEvents,
            "screen-share" => SubscriptionTag::ScreenShare,
            "user-status" => SubscriptionTag::UserStatus,
            "message-updates" => SubscriptionTag::MessageUpdates,
            "notifications" => SubscriptionTag::Notifications,
            other => match other.strip_prefix("thread:") {
                Some(parent) if !parent.trim().is_empty() => {
                    SubscriptionTag::Thread(parent.trim().to_string())
                }
                _ => return Err(UnknownTag(raw.to_string())),
            },
        };
        Ok(tag)
    }
}

impl Serialize for SubscriptionTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SubscriptionTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
