//! Inbound message checks and normalization.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use parley_models::{ChatMessage, MessageStatus, MessageType, Poll, Timestamp};
use uuid::Uuid;

use crate::error::CoreError;

pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MIN_POLL_OPTIONS: usize = 2;
pub const MAX_POLL_OPTIONS: usize = 10;

#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub max_content_chars: usize,
    /// When set, `s3://<bucket>/...` attachment urls are accepted too.
    pub s3_bucket: Option<String>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            max_content_chars: MAX_CONTENT_CHARS,
            s3_bucket: None,
        }
    }
}

fn trimmed_option(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Checks `message` as sent by `sender` and returns the normalized copy that
/// will be persisted: trimmed, id minted, server timestamp, status `sent`.
pub fn normalize_message(
    mut message: ChatMessage,
    sender: &str,
    rules: &ValidationRules,
    now: DateTime<Utc>,
) -> Result<ChatMessage, CoreError> {
    let claimed = message.sender_id.trim();
    if !claimed.is_empty() && claimed != sender {
        return Err(CoreError::denied("sender_id does not match the session user"));
    }
    message.sender_id = sender.to_string();

    message.receiver_id = message.receiver_id.trim().to_string();
    message.group_id = message.group_id.trim().to_string();
    match (message.receiver_id.is_empty(), message.group_id.is_empty()) {
        (true, true) => return Err(CoreError::invalid("receiver_id or group_id is required")),
        (false, false) => {
            return Err(CoreError::invalid(
                "only one of receiver_id and group_id may be set",
            ))
        }
        _ => {}
    }
    message.is_group = !message.group_id.is_empty();

    message.content = message.content.trim().to_string();
    if message.content.chars().count() > rules.max_content_chars {
        return Err(CoreError::invalid(format!(
            "content exceeds {} characters",
            rules.max_content_chars
        )));
    }

    match message.message_type {
        MessageType::System => {
            return Err(CoreError::invalid("system messages cannot be sent by clients"))
        }
        MessageType::Text => {
            if message.content.is_empty() {
                return Err(CoreError::invalid("content is required for text messages"));
            }
        }
        MessageType::Image | MessageType::Video | MessageType::File => {
            let url = message
                .file
                .as_ref()
                .map(|f| f.url.trim())
                .filter(|u| !u.is_empty())
                .ok_or_else(|| CoreError::invalid("file reference is required for media"))?;
            if !attachment_url_allowed(url, rules) {
                return Err(CoreError::invalid("file url is not an accepted location"));
            }
        }
        MessageType::Location => {
            let location = message
                .location
                .as_ref()
                .ok_or_else(|| CoreError::invalid("location is required"))?;
            if !(-90.0..=90.0).contains(&location.latitude)
                || !(-180.0..=180.0).contains(&location.longitude)
            {
                return Err(CoreError::invalid("location coordinates out of range"));
            }
        }
        MessageType::Poll => {
            let poll = message
                .poll
                .as_mut()
                .ok_or_else(|| CoreError::invalid("poll is required"))?;
            check_poll(poll)?;
        }
    }

    message.reply_to = trimmed_option(message.reply_to.take());
    message.parent_message_id = trimmed_option(message.parent_message_id.take());
    message.thread_id = trimmed_option(message.thread_id.take());

    if message.id.trim().is_empty() {
        message.id = Uuid::new_v4().to_string();
    } else {
        message.id = message.id.trim().to_string();
    }
    message.timestamp = Some(Timestamp::from(now));
    message.status = MessageStatus::Sent;
    message.is_pinned = false;
    message.deleted = false;
    message.edit_history.clear();
    message.reactions.clear();
    message.liked_by.clear();
    Ok(message)
}

fn attachment_url_allowed(url: &str, rules: &ValidationRules) -> bool {
    if url.starts_with("https://") {
        return true;
    }
    match &rules.s3_bucket {
        Some(bucket) if !bucket.is_empty() => url
            .strip_prefix("s3://")
            .and_then(|rest| rest.strip_prefix(bucket.as_str()))
            .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1),
        _ => false,
    }
}

fn check_poll(poll: &mut Poll) -> Result<(), CoreError> {
    poll.question = poll.question.trim().to_string();
    if poll.question.is_empty() {
        return Err(CoreError::invalid("poll question is required"));
    }
    if !(MIN_POLL_OPTIONS..=MAX_POLL_OPTIONS).contains(&poll.options.len()) {
        return Err(CoreError::invalid(format!(
            "poll needs {MIN_POLL_OPTIONS} to {MAX_POLL_OPTIONS} options"
        )));
    }
    let mut seen = HashSet::new();
    for (index, option) in poll.options.iter_mut().enumerate() {
        option.text = option.text.trim().to_string();
        if option.text.is_empty() {
            return Err(CoreError::invalid("poll options must not be empty"));
        }
        if !seen.insert(option.text.to_lowercase()) {
            return Err(CoreError::invalid("poll options must be unique"));
        }
        if option.id.trim().is_empty() {
            option.id = index.to_string();
        }
        option.votes.clear();
    }
    Ok(())
}

/// The delivery time of a scheduled message, which must lie in the future.
pub fn scheduled_time(message: &ChatMessage, now: DateTime<Utc>) -> Result<DateTime<Utc>, CoreError> {
    let at = message
        .scheduled_at
        .and_then(|ts| ts.to_datetime())
        .ok_or_else(|| CoreError::invalid("scheduled_at is required"))?;
    if at <= now {
        return Err(CoreError::invalid("scheduled_at must be in the future"));
    }
    Ok(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_models::{FileRef, Location, PollOption};

    fn rules() -> ValidationRules {
        ValidationRules::default()
    }

    fn poll(options: &[&str]) -> Poll {
        Poll {
            question: "lunch?".into(),
            options: options
                .iter()
                .map(|t| PollOption {
                    id: String::new(),
                    text: t.to_string(),
                    votes: Vec::new(),
                })
                .collect(),
            multiple_choice: false,
        }
    }

    #[test]
    fn text_message_is_normalized() {
        let msg = ChatMessage::text("", " u2 ", "  hi  ");
        let out = normalize_message(msg, "u1", &rules(), Utc::now()).unwrap();
        assert_eq!(out.sender_id, "u1");
        assert_eq!(out.receiver_id, "u2");
        assert_eq!(out.content, "hi");
        assert!(!out.id.is_empty());
        assert!(out.timestamp.is_some());
        assert!(!out.is_group);
    }

    #[test]
    fn exactly_one_target_is_required() {
        let none = ChatMessage::text("u1", "", "x");
        assert!(matches!(
            normalize_message(none, "u1", &rules(), Utc::now()),
            Err(CoreError::InvalidArgument(_))
        ));
        let mut both = ChatMessage::text("u1", "u2", "x");
        both.group_id = "g1".into();
        assert!(normalize_message(both, "u1", &rules(), Utc::now()).is_err());
    }

    #[test]
    fn group_flag_is_derived_from_group_id() {
        let mut msg = ChatMessage::group_text("u1", "g1", "team");
        msg.is_group = false;
        let out = normalize_message(msg, "u1", &rules(), Utc::now()).unwrap();
        assert!(out.is_group);
    }

    #[test]
    fn impersonation_is_denied() {
        let msg = ChatMessage::text("u9", "u2", "x");
        assert!(matches!(
            normalize_message(msg, "u1", &rules(), Utc::now()),
            Err(CoreError::PermissionDenied(_))
        ));
    }

    #[test]
    fn type_specific_rules() {
        let mut empty = ChatMessage::text("u1", "u2", "   ");
        assert!(normalize_message(empty.clone(), "u1", &rules(), Utc::now()).is_err());
        empty.message_type = MessageType::System;
        empty.content = "x".into();
        assert!(normalize_message(empty, "u1", &rules(), Utc::now()).is_err());

        let long = ChatMessage::text("u1", "u2", &"a".repeat(MAX_CONTENT_CHARS + 1));
        assert!(normalize_message(long, "u1", &rules(), Utc::now()).is_err());

        let mut image = ChatMessage::text("u1", "u2", "");
        image.message_type = MessageType::Image;
        assert!(normalize_message(image.clone(), "u1", &rules(), Utc::now()).is_err());
        image.file = Some(FileRef {
            url: "https://cdn.example.com/a.png".into(),
            ..Default::default()
        });
        assert!(normalize_message(image, "u1", &rules(), Utc::now()).is_ok());

        let mut place = ChatMessage::text("u1", "u2", "");
        place.message_type = MessageType::Location;
        place.location = Some(Location {
            latitude: 91.0,
            longitude: 0.0,
            label: String::new(),
        });
        assert!(normalize_message(place, "u1", &rules(), Utc::now()).is_err());
    }

    #[test]
    fn polls_need_two_to_ten_unique_options() {
        let mut msg = ChatMessage::text("u1", "u2", "");
        msg.message_type = MessageType::Poll;
        msg.poll = Some(poll(&["pizza"]));
        assert!(normalize_message(msg.clone(), "u1", &rules(), Utc::now()).is_err());
        msg.poll = Some(poll(&["pizza", " Pizza "]));
        assert!(normalize_message(msg.clone(), "u1", &rules(), Utc::now()).is_err());
        msg.poll = Some(poll(&["pizza", "sushi"]));
        let out = normalize_message(msg, "u1", &rules(), Utc::now()).unwrap();
        let ids: Vec<_> = out.poll.unwrap().options.into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["0", "1"]);
    }

    #[test]
    fn s3_urls_need_the_configured_bucket() {
        let with_bucket = ValidationRules {
            s3_bucket: Some("media".into()),
            ..Default::default()
        };
        assert!(attachment_url_allowed("s3://media/a.png", &with_bucket));
        assert!(!attachment_url_allowed("s3://other/a.png", &with_bucket));
        assert!(!attachment_url_allowed("s3://media/", &with_bucket));
        assert!(!attachment_url_allowed("s3://media/a.png", &rules()));
        assert!(!attachment_url_allowed("http://insecure/a.png", &rules()));
    }

    #[test]
    fn scheduled_time_must_be_in_the_future() {
        let now = Utc::now();
        let mut msg = ChatMessage::text("u1", "u2", "later");
        assert!(scheduled_time(&msg, now).is_err());
        msg.scheduled_at = Some(Timestamp::from(now - chrono::Duration::seconds(1)));
        assert!(scheduled_time(&msg, now).is_err());
        msg.scheduled_at = Some(Timestamp::from(now + chrono::Duration::minutes(5)));
        assert!(scheduled_time(&msg, now).unwrap() > now);
    }
}
