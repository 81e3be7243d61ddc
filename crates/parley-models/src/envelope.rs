use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::message::ChatMessage;
use crate::timestamp::Timestamp;

/// Frame carried on the bidirectional chat stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: Payload,
    /// Ask the server to also deliver the broadcast copy to the originating session.
    #[serde(default)]
    pub echo: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Message(ChatMessage),
    State(StateMessage),
    Error(ErrorMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMessage {
    pub kind: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: i32,
    pub message: String,
    pub timestamp: Timestamp,
}

impl Envelope {
    pub fn message(message: ChatMessage) -> Self {
        Self {
            payload: Payload::Message(message),
            echo: false,
        }
    }

    pub fn state(kind: &str, user_id: &str, payload: Vec<u8>) -> Self {
        Self {
            payload: Payload::State(StateMessage {
                kind: kind.to_string(),
                user_id: user_id.to_string(),
                payload,
            }),
            echo: false,
        }
    }

    /// State envelope whose payload is the JSON encoding of `value`.
    pub fn state_json(kind: &str, user_id: &str, value: &serde_json::Value) -> Self {
        Self::state(kind, user_id, value.to_string().into_bytes())
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            payload: Payload::Error(ErrorMessage {
                code,
                message: message.into(),
                timestamp: Timestamp::now(),
            }),
            echo: false,
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// User id that produced this envelope, if the variant names one.
    pub fn originator(&self) -> Option<&str> {
        match &self.payload {
            Payload::Message(m) => Some(m.sender_id.as_str()),
            Payload::State(s) => Some(s.user_id.as_str()),
            Payload::Error(_) => None,
        }
    }

    pub fn as_message(&self) -> Option<&ChatMessage> {
        match &self.payload {
            Payload::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<&StateMessage> {
        match &self.payload {
            Payload::State(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorMessage> {
        match &self.payload {
            Payload::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl StateMessage {
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        if self.payload.is_empty() {
            return Some(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.payload).ok()
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
