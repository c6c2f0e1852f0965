//! Read-side projection of one conversation.
//!
//! A deliberate full recompute over the message set: the set is small
//! and a missed incremental invalidation is worse than the scan.

use crate::message::{Message, MessageStore};

/// Messages exchanged between `local` and `peer`, in either direction,
/// ordered by timestamp ascending. Equal timestamps keep arrival order.
pub fn project<'a>(store: &'a MessageStore, local: &str, peer: &str) -> Vec<&'a Message> {
    let mut view: Vec<&Message> = store
        .entries()
        .iter()
        .filter(|message| message.involves_pair(local, peer))
        .collect();
    view.sort_by_key(|message| message.timestamp);
    view
}
