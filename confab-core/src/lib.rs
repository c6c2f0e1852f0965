pub mod conversation;
pub mod event;
pub mod message;
pub mod relationship;
pub mod session;
pub mod time;

use thiserror::Error;

pub const MAX_MESSAGE_TEXT_BYTES: usize = 16 * 1024;
pub const MAX_WIRE_EVENT_BYTES: usize = 32 * 1024;

/// Opaque username identifying one party.
pub type Identity = String;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("message text must be non-empty and <= 16 KiB")]
    InvalidMessageText,
    #[error("identity must be a non-empty username")]
    InvalidIdentity,
    #[error("event payload is not valid JSON: {0}")]
    MalformedEvent(String),
    #[error("event payload has no string `type` field")]
    MissingEventType,
    #[error("unrecognized event type {0:?}")]
    UnknownEventType(String),
    #[error("event {tag:?} rejected: {reason}")]
    InvalidEventPayload { tag: String, reason: String },
}

pub use event::{ClientEvent, FriendDecision, HistoryMessage, ServerEvent};
pub use message::{Message, MessageStore, Provenance};
pub use relationship::{EdgeStatus, RelationshipStore};
pub use session::{Session, SessionChange};
