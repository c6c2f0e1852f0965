//! The owned WebSocket connection to the relay.
//!
//! One [`EventChannel`] holds at most one live connection, bound to one
//! identity. The connection is an explicit resource: it is opened and
//! closed by the caller and never reconnects on its own, because a
//! silent reconnect would desynchronize in-flight optimistic state.
//! Recovery after a close is the caller re-invoking [`EventChannel::open`],
//! which triggers a fresh bootstrap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use confab_core::event::{decode_server_event, encode_client_event};
use confab_core::{ClientEvent, CoreError, Identity, ServerEvent};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};
use url::Url;

use crate::error::ChannelError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);

/// Connection lifecycle transitions, delivered on their own stream so
/// they never interleave with data events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Opened,
    Closed,
    Errored(String),
}

/// The receiving side of one open connection. Dropping a receiver is
/// the (idempotent) way to unsubscribe.
pub struct ChannelStreams {
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
    pub lifecycle: mpsc::UnboundedReceiver<LifecycleEvent>,
}

pub struct EventChannel {
    ws_base: Url,
    active: Option<ActiveConnection>,
}

struct ActiveConnection {
    identity: Identity,
    outgoing: mpsc::UnboundedSender<ClientEvent>,
    open: Arc<AtomicBool>,
    send_task: JoinHandle<()>,
    receive_task: JoinHandle<()>,
}

impl EventChannel {
    /// Build a channel for a server base URL. `http(s)` schemes are
    /// mapped to their WebSocket equivalents.
    pub fn new(server_url: &str) -> Result<Self, ChannelError> {
        let mut ws_base = Url::parse(server_url)?;
        match ws_base.scheme() {
            "ws" | "wss" => {}
            "http" => ws_base
                .set_scheme("ws")
                .map_err(|()| ChannelError::UnsupportedScheme("http".to_owned()))?,
            "https" => ws_base
                .set_scheme("wss")
                .map_err(|()| ChannelError::UnsupportedScheme("https".to_owned()))?,
            other => return Err(ChannelError::UnsupportedScheme(other.to_owned())),
        }
        Ok(Self {
            ws_base,
            active: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|conn| conn.open.load(Ordering::SeqCst))
    }

    pub fn identity(&self) -> Option<&str> {
        self.active.as_ref().map(|conn| conn.identity.as_str())
    }

    /// Establish one connection bound to `identity`.
    ///
    /// Fails while another connection is still open; callers switch
    /// identity by closing first, which also discards the old session
    /// state. On success the two bootstrap snapshot requests are queued
    /// before anything else, exactly once.
    pub async fn open(&mut self, identity: &str) -> Result<ChannelStreams, ChannelError> {
        if let Some(conn) = &self.active
            && conn.open.load(Ordering::SeqCst)
        {
            return Err(ChannelError::AlreadyOpen(conn.identity.clone()));
        }

        let mut endpoint = self.ws_base.clone();
        endpoint.set_path(&format!("/ws/{identity}"));

        info!(%endpoint, identity, "connecting");
        let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(endpoint.as_str())).await
        {
            Ok(Ok(ok)) => ok,
            Ok(Err(err)) => return Err(ChannelError::Transport(err)),
            Err(_) => return Err(ChannelError::ConnectTimeout(CONNECT_TIMEOUT)),
        };
        info!(identity, "connected");

        let (write_half, read_half) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        let open = Arc::new(AtomicBool::new(true));

        let send_task = tokio::spawn(send_loop(write_half, outgoing_rx, Arc::clone(&open)));
        let receive_task = tokio::spawn(receive_loop(
            read_half,
            inbound_tx,
            lifecycle_tx.clone(),
            Arc::clone(&open),
        ));

        // Bootstrap: seed the relationship stores from full snapshots
        // rather than relying on incremental deltas alone.
        outgoing_tx
            .send(ClientEvent::GetFriends)
            .map_err(|_| ChannelError::NotConnected)?;
        outgoing_tx
            .send(ClientEvent::GetPendingRequests)
            .map_err(|_| ChannelError::NotConnected)?;

        let _ = lifecycle_tx.send(LifecycleEvent::Opened);

        self.active = Some(ActiveConnection {
            identity: identity.to_owned(),
            outgoing: outgoing_tx,
            open,
            send_task,
            receive_task,
        });

        Ok(ChannelStreams {
            inbound: inbound_rx,
            lifecycle: lifecycle_rx,
        })
    }

    /// Queue one event for transmission. No implicit queuing across a
    /// closed connection: callers decide whether to retry after reopen.
    pub fn send(&self, event: ClientEvent) -> Result<(), ChannelError> {
        let conn = self.active.as_ref().ok_or(ChannelError::NotConnected)?;
        if !conn.open.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        conn.outgoing
            .send(event)
            .map_err(|_| ChannelError::NotConnected)
    }

    /// Tear down the connection. Event delivery stops immediately;
    /// closing an already-closed channel is a no-op.
    pub fn close(&mut self) {
        if let Some(conn) = self.active.take() {
            conn.open.store(false, Ordering::SeqCst);
            conn.send_task.abort();
            conn.receive_task.abort();
            info!(identity = %conn.identity, "channel closed");
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.close();
    }
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;
type WsSource = futures::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

async fn send_loop(
    mut ws_write: WsSink,
    mut outgoing_rx: mpsc::UnboundedReceiver<ClientEvent>,
    open: Arc<AtomicBool>,
) {
    while let Some(event) = outgoing_rx.recv().await {
        match encode_client_event(&event) {
            Ok(frame) => {
                if ws_write.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("failed to encode outgoing event: {err}"),
        }
    }
    open.store(false, Ordering::SeqCst);
}

async fn receive_loop(
    mut ws_read: WsSource,
    inbound_tx: mpsc::UnboundedSender<ServerEvent>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
    open: Arc<AtomicBool>,
) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                open.store(false, Ordering::SeqCst);
                let _ = lifecycle_tx.send(LifecycleEvent::Errored(err.to_string()));
                return;
            }
        };

        match message {
            WsMessage::Text(raw) => match decode_server_event(raw.as_str()) {
                Ok(event) => {
                    if inbound_tx.send(event).is_err() {
                        break;
                    }
                }
                // Neither is ever fatal to the processing path.
                Err(CoreError::UnknownEventType(tag)) => {
                    warn!(tag, "dropping event with unrecognized type");
                }
                Err(err) => warn!("dropping malformed inbound event: {err}"),
            },
            WsMessage::Close(_) => break,
            WsMessage::Binary(_) => warn!("dropping unexpected binary frame"),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }

    open.store(false, Ordering::SeqCst);
    let _ = lifecycle_tx.send(LifecycleEvent::Closed);
}
