use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    #[default]
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(Self::Online),
            "away" => Some(Self::Away),
            "busy" => Some(Self::Busy),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }

    /// Away and busy still mean a live session exists.
    pub fn is_online(self) -> bool {
        !matches!(self, Self::Offline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    #[serde(default)]
    pub custom_message: String,
    pub last_seen: Timestamp,
}

impl PresenceRecord {
    pub fn offline(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: PresenceStatus::Offline,
            custom_message: String::new(),
            last_seen: Timestamp::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn away_and_busy_count_as_online() {
        assert!(PresenceStatus::Online.is_online());
        assert!(PresenceStatus::Away.is_online());
        assert!(PresenceStatus::Busy.is_online());
        assert!(!PresenceStatus::Offline.is_online());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&PresenceStatus::Busy).unwrap();
        assert_eq!(json, "\"busy\"");
        assert_eq!(PresenceStatus::parse("away"), Some(PresenceStatus::Away));
        assert_eq!(PresenceStatus::parse("idle"), None);
    }
}
