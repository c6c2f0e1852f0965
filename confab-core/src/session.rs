//! One logged-in identity's live state.
//!
//! A [`Session`] owns the relationship and message stores plus the
//! latest presence snapshot, and is the single writer for all of them:
//! inbound events and local actions are funneled through it one at a
//! time. Switching identity means dropping the session and building a
//! fresh one, never merging.

use chrono::Utc;

use crate::conversation::project;
use crate::event::{ClientEvent, HistoryMessage, ServerEvent};
use crate::message::{Message, MessageStore};
use crate::relationship::RelationshipStore;
use crate::{CoreError, Identity, MAX_MESSAGE_TEXT_BYTES};

/// What a dispatched event touched, so the caller knows which views to
/// refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Relationships,
    /// The conversation with this peer changed.
    Messages { peer: Identity },
    Presence,
    Nothing,
}

#[derive(Debug, Clone)]
pub struct Session {
    local: Identity,
    pub relationships: RelationshipStore,
    pub messages: MessageStore,
    online: Vec<Identity>,
}

impl Session {
    pub fn new(local: impl Into<Identity>) -> Self {
        Self {
            local: local.into(),
            relationships: RelationshipStore::new(),
            messages: MessageStore::new(),
            online: Vec::new(),
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn online_users(&self) -> &[Identity] {
        &self.online
    }

    pub fn conversation(&self, peer: &str) -> Vec<&Message> {
        project(&self.messages, &self.local, peer)
    }

    /// Dispatch one inbound event to exactly one store.
    pub fn apply(&mut self, event: ServerEvent) -> SessionChange {
        match event {
            ServerEvent::FriendsList { friends } => {
                self.relationships.seed_friends(&friends);
                SessionChange::Relationships
            }
            ServerEvent::PendingRequests { requests } => {
                self.relationships.seed_pending(&requests);
                SessionChange::Relationships
            }
            ServerEvent::FriendRequestReceived { from } => {
                self.relationships.request_received(&from);
                SessionChange::Relationships
            }
            ServerEvent::FriendResponse { from, response } => {
                self.relationships.peer_response(&from, response);
                SessionChange::Relationships
            }
            ServerEvent::FriendRemoved {
                removed_user,
                target,
            } => match removed_user.or(target) {
                Some(peer) => {
                    self.relationships.peer_removed(&peer);
                    SessionChange::Relationships
                }
                None => SessionChange::Nothing,
            },
            ServerEvent::Message {
                sender,
                message,
                timestamp,
            } => {
                let timestamp = timestamp.unwrap_or_else(Utc::now);
                if sender == self.local {
                    // Server echo of our own send: confirm the optimistic
                    // copy instead of treating it as a fresh push.
                    return match self.messages.confirm_echo(&sender, &message, timestamp) {
                        Some(peer) => SessionChange::Messages { peer },
                        None => SessionChange::Nothing,
                    };
                }
                let local = self.local.clone();
                self.messages.ingest_push(&sender, &local, &message, timestamp);
                SessionChange::Messages { peer: sender }
            }
            ServerEvent::UserList { users } => {
                self.online = users;
                SessionChange::Presence
            }
        }
    }

    /// Merge a completed history fetch for the conversation with `peer`.
    pub fn merge_history(&mut self, peer: &str, batch: &[HistoryMessage]) {
        let local = self.local.clone();
        self.messages.ingest_history(&local, peer, batch);
    }

    /// Local action: send a chat message. Appends the optimistic copy
    /// and returns the event to transmit.
    pub fn send_message(
        &mut self,
        recipient: &str,
        content: &str,
    ) -> Result<ClientEvent, CoreError> {
        if recipient.trim().is_empty() {
            return Err(CoreError::InvalidIdentity);
        }
        if content.trim().is_empty() || content.len() > MAX_MESSAGE_TEXT_BYTES {
            return Err(CoreError::InvalidMessageText);
        }

        let local = self.local.clone();
        self.messages.append_optimistic(&local, recipient, content);
        Ok(ClientEvent::Message {
            recipient: recipient.to_owned(),
            message: content.to_owned(),
        })
    }

    pub fn send_friend_request(&mut self, recipient: &str) -> Option<ClientEvent> {
        if recipient.trim().is_empty() || recipient == self.local {
            return None;
        }
        self.relationships.send_request(recipient)
    }

    pub fn accept_friend(&mut self, requester: &str) -> Option<ClientEvent> {
        self.relationships.accept(requester)
    }

    pub fn decline_friend(&mut self, requester: &str) -> Option<ClientEvent> {
        self.relationships.decline(requester)
    }

    pub fn remove_friend(&mut self, target: &str) -> Option<ClientEvent> {
        self.relationships.remove(target)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::event::FriendDecision;
    use crate::message::Provenance;

    #[test]
    fn optimistic_send_then_echo_leaves_one_confirmed_entry() {
        let mut session = Session::new("alice");
        let event = session.send_message("bob", "hi").unwrap();
        assert_eq!(
            event,
            ClientEvent::Message {
                recipient: "bob".to_owned(),
                message: "hi".to_owned(),
            }
        );
        assert_eq!(session.messages.len(), 1);
        assert_eq!(
            session.messages.entries()[0].provenance,
            Provenance::OptimisticLocal
        );

        // A server echo of our own send confirms the optimistic copy in
        // place, never duplicates it.
        let server_time = Utc::now();
        let echo = ServerEvent::Message {
            sender: "alice".to_owned(),
            message: "hi".to_owned(),
            timestamp: Some(server_time),
        };
        let change = session.apply(echo);
        assert_eq!(
            change,
            SessionChange::Messages {
                peer: "bob".to_owned()
            }
        );
        assert_eq!(session.messages.len(), 1);
        let entry = &session.messages.entries()[0];
        assert_eq!(entry.provenance, Provenance::Confirmed);
        assert_eq!(entry.timestamp, server_time);
        assert_eq!(entry.recipient, "bob");
    }

    #[test]
    fn unattributable_echo_is_dropped() {
        // An echo with no optimistic counterpart (say, a send from
        // another device) carries no recipient, so there is no
        // conversation to place it in.
        let mut session = Session::new("alice");
        let change = session.apply(ServerEvent::Message {
            sender: "alice".to_owned(),
            message: "from elsewhere".to_owned(),
            timestamp: Some(Utc::now()),
        });
        assert_eq!(change, SessionChange::Nothing);
        assert!(session.messages.is_empty());
    }

    #[test]
    fn incoming_request_declined_emits_response_and_clears_edge() {
        let mut session = Session::new("alice");
        session.apply(ServerEvent::FriendRequestReceived {
            from: "carol".to_owned(),
        });

        let sent = session.decline_friend("carol").expect("decline sends");
        assert_eq!(
            sent,
            ClientEvent::FriendResponse {
                requester: "carol".to_owned(),
                response: FriendDecision::Declined,
            }
        );
        assert_eq!(session.relationships.status("carol"), None);
    }

    #[test]
    fn duplicate_bootstrap_snapshots_converge() {
        let mut session = Session::new("alice");
        let snapshot = ServerEvent::PendingRequests {
            requests: vec!["dave".to_owned()],
        };
        session.apply(snapshot.clone());
        session.apply(snapshot);
        assert_eq!(
            session.relationships.pending_incoming(),
            vec!["dave".to_owned()]
        );
    }

    #[test]
    fn reseed_after_reconnect_replaces_drifted_state() {
        let mut session = Session::new("alice");
        session.apply(ServerEvent::FriendsList {
            friends: vec!["ghost".to_owned()],
        });

        // Fresh bootstrap after reopen: server truth wins.
        session.apply(ServerEvent::FriendsList {
            friends: vec!["bob".to_owned()],
        });
        session.apply(ServerEvent::PendingRequests { requests: vec![] });
        assert_eq!(session.relationships.friends(), vec!["bob".to_owned()]);
    }

    #[test]
    fn inbound_push_lands_in_the_senders_conversation() {
        let mut session = Session::new("alice");
        let change = session.apply(ServerEvent::Message {
            sender: "bob".to_owned(),
            message: "hello".to_owned(),
            timestamp: Some(Utc.timestamp_opt(1_750_000_000, 0).unwrap()),
        });
        assert_eq!(
            change,
            SessionChange::Messages {
                peer: "bob".to_owned()
            }
        );
        assert_eq!(session.conversation("bob").len(), 1);
        assert!(session.conversation("carol").is_empty());
    }

    #[test]
    fn push_without_timestamp_uses_local_clock() {
        let mut session = Session::new("alice");
        session.apply(ServerEvent::Message {
            sender: "bob".to_owned(),
            message: "hello".to_owned(),
            timestamp: None,
        });
        assert_eq!(session.messages.len(), 1);
    }

    #[test]
    fn presence_snapshot_is_replaced_wholesale() {
        let mut session = Session::new("alice");
        session.apply(ServerEvent::UserList {
            users: vec!["alice".to_owned(), "bob".to_owned()],
        });
        session.apply(ServerEvent::UserList {
            users: vec!["alice".to_owned()],
        });
        assert_eq!(session.online_users(), ["alice".to_owned()]);
    }

    #[test]
    fn friend_removed_resolves_either_payload_shape() {
        let mut session = Session::new("alice");
        session.apply(ServerEvent::FriendsList {
            friends: vec!["bob".to_owned(), "carol".to_owned()],
        });

        session.apply(ServerEvent::FriendRemoved {
            removed_user: Some("bob".to_owned()),
            target: None,
        });
        session.apply(ServerEvent::FriendRemoved {
            removed_user: None,
            target: Some("carol".to_owned()),
        });
        assert!(session.relationships.friends().is_empty());
    }

    #[test]
    fn local_guards_reject_empty_and_self_targets() {
        let mut session = Session::new("alice");
        assert!(session.send_message("", "hi").is_err());
        assert!(session.send_message("bob", "   ").is_err());
        assert!(session.send_friend_request("alice").is_none());
        assert!(session.send_friend_request("  ").is_none());
    }
}
