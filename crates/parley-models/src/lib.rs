pub mod envelope;
pub mod message;
pub mod presence;
pub mod response;
pub mod stream;
pub mod subscription;
pub mod timestamp;
pub mod wire;

pub use envelope::{Envelope, ErrorMessage, Payload, StateMessage};
pub use message::{
    ChatMessage, EditRecord, FileRef, Location, MessageStatus, MessageType, Poll, PollOption,
    Reaction,
};
pub use presence::{PresenceRecord, PresenceStatus};
pub use response::{ResponseEnvelope, RpcError, RpcResult};
pub use subscription::{SubscriptionTag, UnknownTag};
pub use timestamp::Timestamp;
pub use wire::{CloseFrame, Frame, FrameCodec, FrameError};
