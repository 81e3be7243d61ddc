//! Protocol constants shared by the stream terminators and clients.

/// `State.kind` values understood on the chat stream.
pub mod kind {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const TYPING: &str = "typing";
    pub const PRESENCE: &str = "presence";
    pub const SIGNAL: &str = "signal";
    pub const SCREEN_SHARE: &str = "screen-share";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const READ: &str = "read";
    pub const AUTHORIZATION: &str = "authorization";

    // Server-originated only.
    pub const NOTIFICATION: &str = "notification";
    pub const MESSAGE_UPDATE: &str = "message-update";
    pub const USER_STATUS: &str = "user-status";
    pub const GROUP_EVENT: &str = "group-event";
    pub const LAST_MESSAGE: &str = "last-message";
}

/// Close codes carried in `Frame::Close` and the WebSocket close frame.
pub mod close {
    pub const NORMAL: u16 = 1000;
    pub const SHUTTING_DOWN: u16 = 1001;
    pub const IDLE: u16 = 4000;
    pub const UNAUTHENTICATED: u16 = 4001;
    pub const FORCE_DISCONNECT: u16 = 4003;
    pub const SLOW_CONSUMER: u16 = 4008;
}

/// Codes used in `ErrorMessage.code`.
pub mod code {
    pub const BAD_REQUEST: i32 = 400;
    pub const UNAUTHENTICATED: i32 = 401;
    pub const FORBIDDEN: i32 = 403;
    pub const NOT_FOUND: i32 = 404;
    pub const CONFLICT: i32 = 409;
    pub const RATE_LIMITED: i32 = 429;
    pub const INTERNAL: i32 = 500;
}

/// Request header carrying a per-call deadline.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";
