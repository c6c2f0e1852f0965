//! Wire events exchanged with the relay.
//!
//! Every frame is a JSON object with a `type` tag. The enums below are
//! closed unions over the protocol's event kinds; anything with an
//! unlisted tag is classified as [`CoreError::UnknownEventType`] so the
//! processing path can log and drop it without dying.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, Identity, MAX_WIRE_EVENT_BYTES};

/// Answer to a pending friend request.
///
/// The wire strings are `"accept"` and `"declined"`; the asymmetry is
/// fixed by the protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FriendDecision {
    Accept,
    Declined,
}

/// Client-to-relay events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    GetFriends,
    GetPendingRequests,
    FriendRequest {
        recipient: Identity,
    },
    FriendResponse {
        requester: Identity,
        response: FriendDecision,
    },
    RemoveFriend {
        target: Identity,
    },
    Message {
        recipient: Identity,
        message: String,
    },
}

/// Relay-to-client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    FriendsList {
        friends: Vec<Identity>,
    },
    PendingRequests {
        requests: Vec<Identity>,
    },
    FriendRequestReceived {
        from: Identity,
    },
    FriendResponse {
        from: Identity,
        response: FriendDecision,
    },
    /// The relay names the deleted peer `target` when telling the
    /// remover and `removed_user` when telling the removed side.
    FriendRemoved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        removed_user: Option<Identity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Identity>,
    },
    Message {
        sender: Identity,
        message: String,
        #[serde(default, with = "crate::time::lenient_opt")]
        timestamp: Option<DateTime<Utc>>,
    },
    UserList {
        users: Vec<Identity>,
    },
}

/// One entry from the history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryMessage {
    pub sender: Identity,
    pub recipient: Identity,
    pub content: String,
    #[serde(with = "crate::time::lenient")]
    pub timestamp: DateTime<Utc>,
}

const CLIENT_TAGS: [&str; 6] = [
    "get_friends",
    "get_pending_requests",
    "friend_request",
    "friend_response",
    "remove_friend",
    "message",
];

const SERVER_TAGS: [&str; 7] = [
    "friends_list",
    "pending_requests",
    "friend_request_received",
    "friend_response",
    "friend_removed",
    "message",
    "user_list",
];

pub fn encode_client_event(event: &ClientEvent) -> Result<String, CoreError> {
    serde_json::to_string(event).map_err(|err| CoreError::MalformedEvent(err.to_string()))
}

pub fn encode_server_event(event: &ServerEvent) -> Result<String, CoreError> {
    serde_json::to_string(event).map_err(|err| CoreError::MalformedEvent(err.to_string()))
}

pub fn decode_client_event(raw: &str) -> Result<ClientEvent, CoreError> {
    decode_tagged(raw, &CLIENT_TAGS)
}

pub fn decode_server_event(raw: &str) -> Result<ServerEvent, CoreError> {
    decode_tagged(raw, &SERVER_TAGS)
}

fn decode_tagged<T: for<'de> Deserialize<'de>>(
    raw: &str,
    known_tags: &[&str],
) -> Result<T, CoreError> {
    if raw.len() > MAX_WIRE_EVENT_BYTES {
        return Err(CoreError::MalformedEvent(format!(
            "frame of {} bytes exceeds limit",
            raw.len()
        )));
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|err| CoreError::MalformedEvent(err.to_string()))?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CoreError::MissingEventType)?
        .to_owned();

    if !known_tags.contains(&tag.as_str()) {
        return Err(CoreError::UnknownEventType(tag));
    }

    serde_json::from_value(value).map_err(|err| CoreError::InvalidEventPayload {
        tag,
        reason: err.to_string(),
    })
}
