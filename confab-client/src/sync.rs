//! The synchronizer: one loop that owns all live state.
//!
//! Inbound channel events, lifecycle transitions, local commands, and
//! completed history fetches are serialized through a single
//! `tokio::select!` loop, so the stores never see concurrent mutation.
//! History fetches run in spawned tasks and report back through a
//! channel; live pushes keep flowing while a fetch is outstanding.

use confab_core::{HistoryMessage, Identity, Message, ServerEvent, Session, SessionChange};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::{ChannelStreams, EventChannel, LifecycleEvent};
use crate::error::{ChannelError, FetchError};
use crate::history::HistoryClient;

/// Locally-triggered actions fed into the loop.
#[derive(Debug, Clone)]
pub enum SyncCommand {
    SendMessage { recipient: Identity, content: String },
    SendFriendRequest { recipient: Identity },
    AcceptFriend { requester: Identity },
    DeclineFriend { requester: Identity },
    RemoveFriend { target: Identity },
    SelectPeer { peer: Identity },
    Close,
}

/// View refreshes pushed to the caller (a UI, or the CLI).
#[derive(Debug, Clone)]
pub enum SyncUpdate {
    Relationships {
        friends: Vec<Identity>,
        incoming: Vec<Identity>,
        outgoing: Vec<Identity>,
    },
    Conversation {
        peer: Identity,
        messages: Vec<Message>,
    },
    Presence {
        online: Vec<Identity>,
    },
    /// Non-fatal trouble, e.g. a failed history fetch. The view stays
    /// whatever it already was.
    Warning(String),
    Disconnected,
}

/// Handle held by the caller of [`Synchronizer::run`].
pub struct SyncHandle {
    pub commands: mpsc::UnboundedSender<SyncCommand>,
    pub updates: mpsc::UnboundedReceiver<SyncUpdate>,
}

type FetchResult = (Identity, Result<Vec<HistoryMessage>, FetchError>);

pub struct Synchronizer {
    session: Session,
    channel: EventChannel,
    streams: ChannelStreams,
    history: HistoryClient,
    commands: mpsc::UnboundedReceiver<SyncCommand>,
    updates: mpsc::UnboundedSender<SyncUpdate>,
    selected: Option<Identity>,
    fetch_tx: mpsc::UnboundedSender<FetchResult>,
    fetch_rx: mpsc::UnboundedReceiver<FetchResult>,
}

impl Synchronizer {
    /// Wire a synchronizer onto an already-open channel. The channel's
    /// bootstrap requests are in flight by the time this returns.
    pub fn new(
        identity: &str,
        channel: EventChannel,
        streams: ChannelStreams,
        history: HistoryClient,
    ) -> (Self, SyncHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();

        let synchronizer = Self {
            session: Session::new(identity),
            channel,
            streams,
            history,
            commands: command_rx,
            updates: update_tx,
            selected: None,
            fetch_tx,
            fetch_rx,
        };
        let handle = SyncHandle {
            commands: command_tx,
            updates: update_rx,
        };
        (synchronizer, handle)
    }

    /// Drive the loop until the connection closes or a `Close` command
    /// arrives. The session dies with the loop; reconnecting means a
    /// fresh channel, a fresh synchronizer, and a fresh bootstrap.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                inbound = self.streams.inbound.recv() => match inbound {
                    Some(event) => self.handle_inbound(event),
                    None => {
                        self.emit(SyncUpdate::Disconnected);
                        break;
                    }
                },
                lifecycle = self.streams.lifecycle.recv() => match lifecycle {
                    Some(LifecycleEvent::Opened) => debug!("channel opened"),
                    Some(LifecycleEvent::Closed) => {
                        self.emit(SyncUpdate::Disconnected);
                        break;
                    }
                    Some(LifecycleEvent::Errored(reason)) => {
                        warn!(reason, "channel errored");
                        self.emit(SyncUpdate::Disconnected);
                        break;
                    }
                    None => {
                        self.emit(SyncUpdate::Disconnected);
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(SyncCommand::Close) | None => {
                        self.channel.close();
                        self.emit(SyncUpdate::Disconnected);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                fetched = self.fetch_rx.recv() => {
                    if let Some((peer, result)) = fetched {
                        self.handle_fetched(peer, result);
                    }
                },
            }
        }
    }

    fn handle_inbound(&mut self, event: ServerEvent) {
        match self.session.apply(event) {
            SessionChange::Relationships => self.emit_relationships(),
            SessionChange::Messages { peer } => {
                if self.selected.as_deref() == Some(peer.as_str()) {
                    self.emit_conversation(&peer);
                }
            }
            SessionChange::Presence => self.emit(SyncUpdate::Presence {
                online: self.session.online_users().to_vec(),
            }),
            SessionChange::Nothing => {}
        }
    }

    fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::SendMessage { recipient, content } => {
                match self.session.send_message(&recipient, &content) {
                    Ok(event) => {
                        self.transmit(event);
                        if self.selected.as_deref() == Some(recipient.as_str()) {
                            self.emit_conversation(&recipient);
                        }
                    }
                    Err(err) => self.emit(SyncUpdate::Warning(err.to_string())),
                }
            }
            SyncCommand::SendFriendRequest { recipient } => {
                if let Some(event) = self.session.send_friend_request(&recipient) {
                    self.transmit(event);
                }
                self.emit_relationships();
            }
            SyncCommand::AcceptFriend { requester } => {
                if let Some(event) = self.session.accept_friend(&requester) {
                    self.transmit(event);
                }
                self.emit_relationships();
            }
            SyncCommand::DeclineFriend { requester } => {
                if let Some(event) = self.session.decline_friend(&requester) {
                    self.transmit(event);
                }
                self.emit_relationships();
            }
            SyncCommand::RemoveFriend { target } => {
                if let Some(event) = self.session.remove_friend(&target) {
                    self.transmit(event);
                }
                self.emit_relationships();
            }
            SyncCommand::SelectPeer { peer } => self.select_peer(peer),
            SyncCommand::Close => unreachable!("handled by the run loop"),
        }
    }

    /// Switch the viewed conversation and kick off a history backfill.
    ///
    /// A prior outstanding fetch is not cancelled; its late result still
    /// merges idempotently, it just no longer refreshes the view.
    fn select_peer(&mut self, peer: Identity) {
        self.selected = Some(peer.clone());
        self.emit_conversation(&peer);

        let history = self.history.clone();
        let fetch_tx = self.fetch_tx.clone();
        let local = self.session.local().to_owned();
        tokio::spawn(async move {
            let result = history.fetch(&local, &peer).await;
            let _ = fetch_tx.send((peer, result));
        });
    }

    fn handle_fetched(&mut self, peer: Identity, result: Result<Vec<HistoryMessage>, FetchError>) {
        match result {
            Ok(batch) => {
                debug!(peer, count = batch.len(), "history fetched");
                self.session.merge_history(&peer, &batch);
                if self.selected.as_deref() == Some(peer.as_str()) {
                    self.emit_conversation(&peer);
                }
            }
            Err(err) => {
                warn!(peer, "history fetch failed: {err}");
                self.emit(SyncUpdate::Warning(format!(
                    "could not load history with {peer}: {err}"
                )));
            }
        }
    }

    fn transmit(&mut self, event: confab_core::ClientEvent) {
        match self.channel.send(event) {
            Ok(()) => {}
            Err(ChannelError::NotConnected) => {
                self.emit(SyncUpdate::Warning("not connected".to_owned()));
            }
            Err(err) => self.emit(SyncUpdate::Warning(err.to_string())),
        }
    }

    fn emit_relationships(&mut self) {
        let update = SyncUpdate::Relationships {
            friends: self.session.relationships.friends(),
            incoming: self.session.relationships.pending_incoming(),
            outgoing: self.session.relationships.pending_outgoing(),
        };
        self.emit(update);
    }

    fn emit_conversation(&mut self, peer: &str) {
        let messages: Vec<Message> = self
            .session
            .conversation(peer)
            .into_iter()
            .cloned()
            .collect();
        self.emit(SyncUpdate::Conversation {
            peer: peer.to_owned(),
            messages,
        });
    }

    fn emit(&mut self, update: SyncUpdate) {
        if self.updates.send(update).is_err() {
            debug!("update receiver dropped");
        }
    }
}
