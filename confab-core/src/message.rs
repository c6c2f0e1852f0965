//! Local message set and its reconciliation rules.
//!
//! The store holds every message known to this identity: optimistic
//! copies of local sends plus everything the relay pushed or the history
//! endpoint returned. Reconciliation replaces an optimistic entry in
//! place when its confirmed counterpart shows up; no operation may leave
//! two entries a user would read as the same message.

use chrono::{DateTime, Duration, Utc};

use crate::event::HistoryMessage;
use crate::Identity;

/// Window within which an optimistic local timestamp and the relay's
/// clock are considered the same instant.
pub const DEFAULT_RECONCILE_TOLERANCE_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Applied locally before any server confirmation.
    OptimisticLocal,
    /// Echoed, pushed, or fetched from the relay. Immutable afterwards.
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: Identity,
    pub recipient: Identity,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub provenance: Provenance,
}

impl Message {
    /// Whether this message was exchanged between `a` and `b`, in either
    /// direction.
    pub fn involves_pair(&self, a: &str, b: &str) -> bool {
        (self.sender == a && self.recipient == b) || (self.sender == b && self.recipient == a)
    }
}

#[derive(Debug, Clone)]
pub struct MessageStore {
    entries: Vec<Message>,
    tolerance: Duration,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::with_tolerance(Duration::seconds(DEFAULT_RECONCILE_TOLERANCE_SECS))
    }

    pub fn with_tolerance(tolerance: Duration) -> Self {
        Self {
            entries: Vec::new(),
            tolerance,
        }
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an optimistic copy of a local send, stamped with the local
    /// clock. Always succeeds.
    pub fn append_optimistic(&mut self, sender: &str, recipient: &str, content: &str) {
        self.append_optimistic_at(sender, recipient, content, Utc::now());
    }

    pub fn append_optimistic_at(
        &mut self,
        sender: &str,
        recipient: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) {
        self.entries.push(Message {
            sender: sender.to_owned(),
            recipient: recipient.to_owned(),
            content: content.to_owned(),
            timestamp,
            provenance: Provenance::OptimisticLocal,
        });
    }

    /// Ingest a confirmed message pushed (or echoed) by the relay.
    ///
    /// A matching optimistic entry is confirmed in place, keeping its
    /// position; a confirmed duplicate is dropped; anything else is
    /// appended.
    pub fn ingest_push(
        &mut self,
        sender: &str,
        recipient: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) {
        if let Some(index) = self.find_near(sender, recipient, content, timestamp) {
            let entry = &mut self.entries[index];
            if entry.provenance == Provenance::OptimisticLocal {
                entry.timestamp = timestamp;
                entry.provenance = Provenance::Confirmed;
            }
            return;
        }

        self.entries.push(Message {
            sender: sender.to_owned(),
            recipient: recipient.to_owned(),
            content: content.to_owned(),
            timestamp,
            provenance: Provenance::Confirmed,
        });
    }

    /// Reconcile a server echo of one of `sender`'s own sends.
    ///
    /// The echo event carries no recipient, so matching is on sender,
    /// content, and timestamp within tolerance. A matching optimistic
    /// entry is confirmed in place; a matching confirmed entry means the
    /// echo is a duplicate and nothing changes. Returns the recipient of
    /// the reconciled entry, or `None` when no entry matches (an echo
    /// that cannot be attributed to any conversation is dropped).
    pub fn confirm_echo(
        &mut self,
        sender: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<Identity> {
        let index = self.entries.iter().position(|entry| {
            entry.sender == sender
                && entry.content == content
                && (entry.timestamp - timestamp).abs() <= self.tolerance
        })?;

        let entry = &mut self.entries[index];
        if entry.provenance == Provenance::OptimisticLocal {
            entry.timestamp = timestamp;
            entry.provenance = Provenance::Confirmed;
        }
        Some(entry.recipient.clone())
    }

    /// Bulk-merge a fetched history batch for the `a`/`b` pair.
    ///
    /// The merge is a set union: entries already present (including
    /// optimistic copies of just-sent messages) are not duplicated.
    /// Afterwards only that pair's entries are re-sorted by timestamp;
    /// every other conversation's ordering is untouched. Merging the
    /// same batch twice is a no-op, so a stale response for a peer no
    /// longer selected cannot corrupt anything.
    pub fn ingest_history(&mut self, a: &str, b: &str, batch: &[HistoryMessage]) {
        for fetched in batch {
            if !involves(fetched, a, b) {
                continue;
            }
            self.ingest_push(
                &fetched.sender,
                &fetched.recipient,
                &fetched.content,
                fetched.timestamp,
            );
        }
        self.resort_pair(a, b);
    }

    fn find_near(
        &self,
        sender: &str,
        recipient: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.sender == sender
                && entry.recipient == recipient
                && entry.content == content
                && (entry.timestamp - timestamp).abs() <= self.tolerance
        })
    }

    /// Stable re-sort of one pair's entries by timestamp, in their
    /// existing slots. Equal timestamps keep arrival order.
    fn resort_pair(&mut self, a: &str, b: &str) {
        let slots: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.involves_pair(a, b))
            .map(|(index, _)| index)
            .collect();

        let mut pair_entries: Vec<Message> =
            slots.iter().map(|&index| self.entries[index].clone()).collect();
        pair_entries.sort_by_key(|entry| entry.timestamp);

        for (slot, entry) in slots.into_iter().zip(pair_entries) {
            self.entries[slot] = entry;
        }
    }
}

fn involves(message: &HistoryMessage, a: &str, b: &str) -> bool {
    (message.sender == a && message.recipient == b)
        || (message.sender == b && message.recipient == a)
}
