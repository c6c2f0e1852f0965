//! In-memory reference relay.
//!
//! Speaks the wire protocol from `confab-core` over one WebSocket per
//! connected user, plus the HTTP side: credential endpoints and the
//! message-history endpoint. State is a single in-memory directory
//! behind an `RwLock`; friendship rows are directed
//! (requester, target) pairs with a status, mirroring how accepts
//! insert the reciprocal row.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade, ws::Message},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use confab_core::{
    ClientEvent, FriendDecision, HistoryMessage, Identity, ServerEvent,
    event::{decode_client_event, encode_server_event},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{info, warn};

const MIN_PASSWORD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowStatus {
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug)]
struct UserRecord {
    password: String,
    online: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    sender: Identity,
    recipient: Identity,
    content: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Directory {
    users: HashMap<Identity, UserRecord>,
    /// Directed rows keyed by (requester, target).
    friendships: HashMap<(Identity, Identity), RowStatus>,
    messages: Vec<StoredMessage>,
    connections: HashMap<Identity, mpsc::UnboundedSender<Message>>,
}

impl Directory {
    fn pending_requests(&self, user: &str) -> Vec<Identity> {
        let mut requesters: Vec<Identity> = self
            .friendships
            .iter()
            .filter(|((_, target), status)| target == user && **status == RowStatus::Pending)
            .map(|((requester, _), _)| requester.clone())
            .collect();
        requesters.sort();
        requesters
    }

    fn friends_list(&self, user: &str) -> Vec<Identity> {
        let mut friends: Vec<Identity> = self
            .friendships
            .iter()
            .filter(|((owner, _), status)| owner == user && **status == RowStatus::Accepted)
            .map(|((_, friend), _)| friend.clone())
            .collect();
        friends.sort();
        friends
    }

    /// Create a pending row unless any row already links the pair.
    fn send_friend_request(&mut self, from: &str, to: &str) -> bool {
        if !self.users.contains_key(from) || !self.users.contains_key(to) {
            return false;
        }
        let forward = (from.to_owned(), to.to_owned());
        let backward = (to.to_owned(), from.to_owned());
        if self.friendships.contains_key(&forward) || self.friendships.contains_key(&backward) {
            return false;
        }
        self.friendships.insert(forward, RowStatus::Pending);
        true
    }

    fn respond_to_request(
        &mut self,
        responder: &str,
        requester: &str,
        decision: FriendDecision,
    ) -> bool {
        let forward = (requester.to_owned(), responder.to_owned());
        if self.friendships.get(&forward) != Some(&RowStatus::Pending) {
            return false;
        }
        let status = match decision {
            FriendDecision::Accept => RowStatus::Accepted,
            FriendDecision::Declined => RowStatus::Declined,
        };
        self.friendships.insert(forward, status);
        self.friendships
            .entry((responder.to_owned(), requester.to_owned()))
            .or_insert(status);
        true
    }

    fn remove_friend(&mut self, current: &str, target: &str) -> bool {
        if !self.users.contains_key(current) || !self.users.contains_key(target) {
            return false;
        }
        self.friendships
            .remove(&(current.to_owned(), target.to_owned()));
        self.friendships
            .remove(&(target.to_owned(), current.to_owned()));
        true
    }

    fn conversation(&self, user1: &str, user2: &str) -> Vec<HistoryMessage> {
        let mut entries: Vec<HistoryMessage> = self
            .messages
            .iter()
            .filter(|message| {
                (message.sender == user1 && message.recipient == user2)
                    || (message.sender == user2 && message.recipient == user1)
            })
            .map(|message| HistoryMessage {
                sender: message.sender.clone(),
                recipient: message.recipient.clone(),
                content: message.content.clone(),
                timestamp: message.timestamp,
            })
            .collect();
        entries.sort_by_key(|message| message.timestamp);
        entries
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<Directory>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Directory::default())),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/login", post(login_handler))
        .route("/signup", post(signup_handler))
        .route("/get_messages", get(get_messages_handler))
        .route("/ws/{username}", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

type AuthRejection = (StatusCode, Json<serde_json::Value>);

fn reject(detail: &str) -> AuthRejection {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "detail": detail })),
    )
}

fn accept(username: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "success", "username": username }))
}

async fn login_handler(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<serde_json::Value>, AuthRejection> {
    if credentials.username.trim().is_empty() || credentials.password.trim().is_empty() {
        return Err(reject("Username and password required"));
    }

    let mut directory = state.inner.write().await;
    let record = directory
        .users
        .get_mut(&credentials.username)
        .ok_or_else(|| reject("User does not exist"))?;
    if record.password != credentials.password {
        return Err(reject("Incorrect password"));
    }
    record.online = true;
    Ok(accept(&credentials.username))
}

async fn signup_handler(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<serde_json::Value>, AuthRejection> {
    if credentials.username.trim().is_empty() || credentials.password.trim().is_empty() {
        return Err(reject("Username and password required"));
    }
    if credentials.password.len() < MIN_PASSWORD_LEN {
        return Err(reject("Password must be at least 4 characters"));
    }

    let mut directory = state.inner.write().await;
    if directory.users.contains_key(&credentials.username) {
        return Err(reject("Username already exists"));
    }
    directory.users.insert(
        credentials.username.clone(),
        UserRecord {
            password: credentials.password,
            online: true,
        },
    );
    Ok(accept(&credentials.username))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    user1: String,
    user2: String,
}

async fn get_messages_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<HistoryMessage>> {
    let directory = state.inner.read().await;
    Json(directory.conversation(&query.user1, &query.user2))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(username): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_socket(state, username, socket).await {
            warn!("socket session ended with error: {}", err);
        }
    })
}

async fn handle_socket(
    state: AppState,
    username: Identity,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Periodic pings keep the write half active so reverse proxies do
    // not declare an idle connection dead.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                message = outbound_rx.recv() => {
                    match message {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    {
        let mut directory = state.inner.write().await;
        directory
            .connections
            .insert(username.clone(), outbound_tx.clone());
    }
    info!("{} connected", username);
    broadcast_user_list(&state).await;

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Text(raw) => {
                let event = match decode_client_event(raw.as_str()) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("dropping frame from {}: {}", username, err);
                        continue;
                    }
                };
                handle_client_event(&state, &username, event).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    {
        let mut directory = state.inner.write().await;
        directory.connections.remove(&username);
        if let Some(record) = directory.users.get_mut(&username) {
            record.online = false;
        }
    }
    broadcast_user_list(&state).await;
    send_task.abort();
    info!("{} disconnected", username);
    Ok(())
}

async fn handle_client_event(state: &AppState, username: &str, event: ClientEvent) {
    match event {
        ClientEvent::GetFriends => {
            let directory = state.inner.read().await;
            let friends = directory.friends_list(username);
            send_to(&directory, username, &ServerEvent::FriendsList { friends });
        }
        ClientEvent::GetPendingRequests => {
            let directory = state.inner.read().await;
            let requests = directory.pending_requests(username);
            send_to(
                &directory,
                username,
                &ServerEvent::PendingRequests { requests },
            );
        }
        ClientEvent::FriendRequest { recipient } => {
            let mut directory = state.inner.write().await;
            if directory.send_friend_request(username, &recipient) {
                send_to(
                    &directory,
                    &recipient,
                    &ServerEvent::FriendRequestReceived {
                        from: username.to_owned(),
                    },
                );
            }
        }
        ClientEvent::FriendResponse {
            requester,
            response,
        } => {
            let mut directory = state.inner.write().await;
            if directory.respond_to_request(username, &requester, response) {
                send_to(
                    &directory,
                    &requester,
                    &ServerEvent::FriendResponse {
                        from: username.to_owned(),
                        response,
                    },
                );
            }
        }
        ClientEvent::RemoveFriend { target } => {
            let mut directory = state.inner.write().await;
            if directory.remove_friend(username, &target) {
                // The remover gets `target`, the removed peer gets
                // `removed_user`.
                send_to(
                    &directory,
                    username,
                    &ServerEvent::FriendRemoved {
                        removed_user: None,
                        target: Some(target.clone()),
                    },
                );
                send_to(
                    &directory,
                    &target,
                    &ServerEvent::FriendRemoved {
                        removed_user: Some(username.to_owned()),
                        target: None,
                    },
                );
            }
        }
        ClientEvent::Message { recipient, message } => {
            let timestamp = Utc::now();
            let mut directory = state.inner.write().await;
            directory.messages.push(StoredMessage {
                sender: username.to_owned(),
                recipient: recipient.clone(),
                content: message.clone(),
                timestamp,
            });
            send_to(
                &directory,
                &recipient,
                &ServerEvent::Message {
                    sender: username.to_owned(),
                    message,
                    timestamp: Some(timestamp),
                },
            );
        }
    }
}

async fn broadcast_user_list(state: &AppState) {
    let directory = state.inner.read().await;
    let mut users: Vec<Identity> = directory.connections.keys().cloned().collect();
    users.sort();
    let event = ServerEvent::UserList { users };
    for username in directory.connections.keys() {
        send_to(&directory, username, &event);
    }
}

/// Queue an event for one user, if they are connected. Offline
/// recipients are simply skipped; they recover via bootstrap snapshots
/// and the history endpoint.
fn send_to(directory: &Directory, username: &str, event: &ServerEvent) {
    let Some(tx) = directory.connections.get(username) else {
        return;
    };
    match encode_server_event(event) {
        Ok(encoded) => {
            let _ = tx.send(Message::Text(encoded.into()));
        }
        Err(err) => warn!("failed to encode event for {}: {}", username, err),
    }
}
