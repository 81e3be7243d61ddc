use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    File,
    Location,
    Poll,
    System,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::File => "file",
            Self::Location => "location",
            Self::Poll => "poll",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "file" => Some(Self::File),
            "location" => Some(Self::Location),
            "poll" => Some(Self::Poll),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// Types that must carry a file reference.
    pub fn is_media(self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::File)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileRef {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PollOption {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub votes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Poll {
    pub question: String,
    pub options: Vec<PollOption>,
    #[serde(default)]
    pub multiple_choice: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRecord {
    pub previous_content: String,
    pub edited_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-minted when empty on inbound.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_scheduled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edit_history: Vec<EditRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub liked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<Poll>,
    /// Soft-delete tombstone.
    #[serde(default)]
    pub deleted: bool,
}

impl ChatMessage {
    pub fn text(sender_id: &str, receiver_id: &str, content: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn group_text(sender_id: &str, group_id: &str, content: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            group_id: group_id.to_string(),
            is_group: true,
            content: content.to_string(),
            ..Default::default()
        }
    }

    /// Whether `user_id` takes part in this message's chat without consulting
    /// group membership (sender or direct receiver).
    pub fn is_direct_participant(&self, user_id: &str) -> bool {
        self.sender_id == user_id || (!self.is_group && self.receiver_id == user_id)
    }

    /// The chat id as seen from `viewer`: the group id for groups, the other
    /// party for direct chats.
    pub fn chat_id_for(&self, viewer: &str) -> &str {
        if self.is_group {
            &self.group_id
        } else if self.sender_id == viewer {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    pub fn has_reaction(&self, user_id: &str, kind: &str) -> bool {
        self.reactions
            .iter()
            .any(|r| r.user_id == user_id && r.kind == kind)
    }

    pub fn preview(&self, max: usize) -> String {
        match self.message_type {
            MessageType::Text | MessageType::System => self.content.chars().take(max).collect(),
            other => format!("[{}]", other.as_str()),
        }
    }
}
