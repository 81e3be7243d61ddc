use std::num::NonZeroU32;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

/// Inbound frame classes with their own budget on top of the shared one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Message,
    Typing,
    Presence,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub frames_per_minute: u32,
    pub typing_per_minute: u32,
    pub presence_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            frames_per_minute: 240,
            typing_per_minute: 120,
            presence_per_minute: 60,
        }
    }
}

/// User-keyed limits shared by every stream of the same user, so opening more
/// connections does not raise the budget.
pub struct UserRateLimits {
    frames: DefaultKeyedRateLimiter<String>,
    typing: DefaultKeyedRateLimiter<String>,
    presence: DefaultKeyedRateLimiter<String>,
}

fn per_minute(n: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN))
}

impl UserRateLimits {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            frames: RateLimiter::keyed(per_minute(config.frames_per_minute)),
            typing: RateLimiter::keyed(per_minute(config.typing_per_minute)),
            presence: RateLimiter::keyed(per_minute(config.presence_per_minute)),
        }
    }

    /// `Err(retry_after_ms)` when the frame is over budget.
    pub fn check(&self, user_id: &str, class: FrameClass) -> Result<(), u64> {
        let now = DefaultClock::default().now();
        let key = user_id.to_string();
        if let Err(not_until) = self.frames.check_key(&key) {
            return Err(not_until.wait_time_from(now).as_millis().max(1) as u64);
        }
        let limited = match class {
            FrameClass::Typing => self.typing.check_key(&key).err(),
            FrameClass::Presence => self.presence.check_key(&key).err(),
            FrameClass::Message | FrameClass::Other => None,
        };
        match limited {
            Some(not_until) => Err(not_until.wait_time_from(now).as_millis().max(1) as u64),
            None => Ok(()),
        }
    }

    /// Drops state for keys that have fully replenished.
    pub fn prune(&self) {
        self.frames.retain_recent();
        self.typing.retain_recent();
        self.presence.retain_recent();
        self.frames.shrink_to_fit();
        self.typing.shrink_to_fit();
        self.presence.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_budget_is_separate_from_frames() {
        let limits = UserRateLimits::new(RateLimitConfig {
            frames_per_minute: 100,
            typing_per_minute: 2,
            presence_per_minute: 2,
        });
        assert!(limits.check("u1", FrameClass::Typing).is_ok());
        assert!(limits.check("u1", FrameClass::Typing).is_ok());
        assert!(limits.check("u1", FrameClass::Typing).is_err());
        assert!(limits.check("u1", FrameClass::Message).is_ok());
        assert!(limits.check("u2", FrameClass::Typing).is_ok());
    }

    #[test]
    fn shared_budget_limits_messages() {
        let limits = UserRateLimits::new(RateLimitConfig {
            frames_per_minute: 3,
            ..Default::default()
        });
        for _ in 0..3 {
            assert!(limits.check("u1", FrameClass::Message).is_ok());
        }
        let retry = limits.check("u1", FrameClass::Message).unwrap_err();
        assert!(retry >= 1);
        limits.prune();
    }
}
