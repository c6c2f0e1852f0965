//! Friend graph for the local identity.
//!
//! At most one edge exists per peer. Every transition is idempotent:
//! duplicated or out-of-order delivery of the same event is a no-op,
//! never an error. Local actions apply their transition optimistically
//! and return the wire event the caller must transmit; the transport is
//! ack-less for relationship actions, so nothing is ever rolled back.

use std::collections::BTreeMap;

use crate::event::{ClientEvent, FriendDecision};
use crate::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStatus {
    PendingOutgoing,
    PendingIncoming,
    Confirmed,
}

#[derive(Debug, Default, Clone)]
pub struct RelationshipStore {
    edges: BTreeMap<Identity, EdgeStatus>,
}

impl RelationshipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, peer: &str) -> Option<EdgeStatus> {
        self.edges.get(peer).copied()
    }

    pub fn is_friend(&self, peer: &str) -> bool {
        self.status(peer) == Some(EdgeStatus::Confirmed)
    }

    pub fn friends(&self) -> Vec<Identity> {
        self.collect(EdgeStatus::Confirmed)
    }

    pub fn pending_incoming(&self) -> Vec<Identity> {
        self.collect(EdgeStatus::PendingIncoming)
    }

    pub fn pending_outgoing(&self) -> Vec<Identity> {
        self.collect(EdgeStatus::PendingOutgoing)
    }

    fn collect(&self, wanted: EdgeStatus) -> Vec<Identity> {
        self.edges
            .iter()
            .filter(|(_, status)| **status == wanted)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Seed the Confirmed set from a `friends_list` bootstrap snapshot.
    ///
    /// The snapshot is authoritative for confirmed friendships: stale
    /// Confirmed edges are dropped, pending edges for unlisted peers
    /// survive. Receiving the same snapshot twice is a no-op.
    pub fn seed_friends(&mut self, friends: &[Identity]) {
        self.edges
            .retain(|_, status| *status != EdgeStatus::Confirmed);
        for peer in friends {
            self.edges.insert(peer.clone(), EdgeStatus::Confirmed);
        }
    }

    /// Seed incoming requests from a `pending_requests` bootstrap snapshot.
    ///
    /// Only peers with no existing edge are added, so a snapshot that
    /// arrives after an incremental delta (or after a local accept)
    /// cannot downgrade an edge.
    pub fn seed_pending(&mut self, requests: &[Identity]) {
        for peer in requests {
            self.edges
                .entry(peer.clone())
                .or_insert(EdgeStatus::PendingIncoming);
        }
    }

    /// Local action: ask `recipient` to be a friend.
    ///
    /// Returns the event to transmit, or `None` when an edge already
    /// exists in any state (the relay refuses duplicate requests too).
    #[must_use]
    pub fn send_request(&mut self, recipient: &str) -> Option<ClientEvent> {
        if self.edges.contains_key(recipient) {
            return None;
        }
        self.edges
            .insert(recipient.to_owned(), EdgeStatus::PendingOutgoing);
        Some(ClientEvent::FriendRequest {
            recipient: recipient.to_owned(),
        })
    }

    /// Inbound `friend_request_received`.
    pub fn request_received(&mut self, from: &str) {
        self.edges
            .entry(from.to_owned())
            .or_insert(EdgeStatus::PendingIncoming);
    }

    /// Local action: accept a pending incoming request.
    ///
    /// No matching edge (or an already-confirmed one) is a no-op and
    /// nothing is transmitted.
    #[must_use]
    pub fn accept(&mut self, requester: &str) -> Option<ClientEvent> {
        if self.status(requester) != Some(EdgeStatus::PendingIncoming) {
            return None;
        }
        self.edges
            .insert(requester.to_owned(), EdgeStatus::Confirmed);
        Some(ClientEvent::FriendResponse {
            requester: requester.to_owned(),
            response: FriendDecision::Accept,
        })
    }

    /// Local action: decline a pending incoming request.
    #[must_use]
    pub fn decline(&mut self, requester: &str) -> Option<ClientEvent> {
        if self.status(requester) != Some(EdgeStatus::PendingIncoming) {
            return None;
        }
        self.edges.remove(requester);
        Some(ClientEvent::FriendResponse {
            requester: requester.to_owned(),
            response: FriendDecision::Declined,
        })
    }

    /// Local action: remove a confirmed friend.
    #[must_use]
    pub fn remove(&mut self, target: &str) -> Option<ClientEvent> {
        if self.status(target) != Some(EdgeStatus::Confirmed) {
            return None;
        }
        self.edges.remove(target);
        Some(ClientEvent::RemoveFriend {
            target: target.to_owned(),
        })
    }

    /// Inbound `friend_response`: the peer resolved our outgoing request.
    pub fn peer_response(&mut self, from: &str, response: FriendDecision) {
        match (self.status(from), response) {
            (Some(EdgeStatus::PendingOutgoing), FriendDecision::Accept) => {
                self.edges.insert(from.to_owned(), EdgeStatus::Confirmed);
            }
            (Some(EdgeStatus::PendingOutgoing), FriendDecision::Declined) => {
                self.edges.remove(from);
            }
            // Already converged, or no edge to resolve.
            _ => {}
        }
    }

    /// Inbound `friend_removed`: either side deleted the edge.
    pub fn peer_removed(&mut self, peer: &str) {
        self.edges.remove(peer);
    }
}
