//! Full-loop tests: real synchronizers talking through an in-process
//! relay over real sockets.

use std::time::Duration;

use confab_client::{
    AuthClient, EventChannel, HistoryClient, SyncCommand, SyncHandle, SyncUpdate, Synchronizer,
};
use confab_core::Provenance;
use confab_relay::{AppState, serve};
use tokio::{net::TcpListener, time::timeout};

#[tokio::test]
async fn bootstrap_delivers_empty_snapshots_for_a_new_account() {
    let base = start_relay().await;
    signup(&base, "alice").await;
    let mut alice = open_session(&base, "alice").await;

    let snapshot = wait_for(&mut alice, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Relationships { .. })
    })
    .await
    .expect("bootstrap relationships snapshot");
    match snapshot {
        SyncUpdate::Relationships {
            friends,
            incoming,
            outgoing,
        } => {
            assert!(friends.is_empty());
            assert!(incoming.is_empty());
            assert!(outgoing.is_empty());
        }
        other => panic!("unexpected update {other:?}"),
    }
}

#[tokio::test]
async fn friend_request_and_accept_propagate_between_live_sessions() {
    let base = start_relay().await;
    signup(&base, "alice").await;
    signup(&base, "bob").await;
    let mut alice = open_session(&base, "alice").await;
    let mut bob = open_session(&base, "bob").await;

    alice
        .commands
        .send(SyncCommand::SendFriendRequest {
            recipient: "bob".to_owned(),
        })
        .expect("send request command");

    let outgoing = wait_for(&mut alice, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Relationships { outgoing, .. } if !outgoing.is_empty())
    })
    .await
    .expect("alice sees her pending request");
    assert!(matches!(
        outgoing,
        SyncUpdate::Relationships { outgoing, .. } if outgoing == vec!["bob".to_owned()]
    ));

    let incoming = wait_for(&mut bob, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Relationships { incoming, .. } if !incoming.is_empty())
    })
    .await
    .expect("bob sees the incoming request");
    assert!(matches!(
        incoming,
        SyncUpdate::Relationships { incoming, .. } if incoming == vec!["alice".to_owned()]
    ));

    bob.commands
        .send(SyncCommand::AcceptFriend {
            requester: "alice".to_owned(),
        })
        .expect("accept command");

    let bob_friends = wait_for(&mut bob, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Relationships { friends, .. } if !friends.is_empty())
    })
    .await
    .expect("bob's edge confirms");
    assert!(matches!(
        bob_friends,
        SyncUpdate::Relationships { friends, .. } if friends == vec!["alice".to_owned()]
    ));

    let alice_friends = wait_for(&mut alice, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Relationships { friends, .. } if !friends.is_empty())
    })
    .await
    .expect("alice's edge confirms");
    assert!(matches!(
        alice_friends,
        SyncUpdate::Relationships { friends, .. } if friends == vec!["bob".to_owned()]
    ));
}

#[tokio::test]
async fn sent_message_shows_optimistic_locally_and_confirmed_remotely() {
    let base = start_relay().await;
    signup(&base, "alice").await;
    signup(&base, "bob").await;
    let mut alice = open_session(&base, "alice").await;
    let mut bob = open_session(&base, "bob").await;

    alice
        .commands
        .send(SyncCommand::SelectPeer {
            peer: "bob".to_owned(),
        })
        .expect("select command");
    alice
        .commands
        .send(SyncCommand::SendMessage {
            recipient: "bob".to_owned(),
            content: "lunch?".to_owned(),
        })
        .expect("send command");

    let local_view = wait_for(&mut alice, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Conversation { messages, .. } if messages.len() == 1)
    })
    .await
    .expect("alice's conversation refresh");
    match local_view {
        SyncUpdate::Conversation { peer, messages } => {
            assert_eq!(peer, "bob");
            assert_eq!(messages[0].content, "lunch?");
            assert_eq!(messages[0].provenance, Provenance::OptimisticLocal);
        }
        other => panic!("unexpected update {other:?}"),
    }

    bob.commands
        .send(SyncCommand::SelectPeer {
            peer: "alice".to_owned(),
        })
        .expect("select command");
    let remote_view = wait_for(&mut bob, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Conversation { messages, .. } if messages.len() == 1)
    })
    .await
    .expect("bob's conversation refresh");
    match remote_view {
        SyncUpdate::Conversation { peer, messages } => {
            assert_eq!(peer, "alice");
            assert_eq!(messages[0].sender, "alice");
            assert_eq!(messages[0].content, "lunch?");
            assert_eq!(messages[0].provenance, Provenance::Confirmed);
        }
        other => panic!("unexpected update {other:?}"),
    }
}

#[tokio::test]
async fn reconnected_session_backfills_the_conversation_from_history() {
    let base = start_relay().await;
    signup(&base, "alice").await;
    signup(&base, "bob").await;
    let mut alice = open_session(&base, "alice").await;

    {
        let mut bob = open_session(&base, "bob").await;
        for text in ["first", "second"] {
            bob.commands
                .send(SyncCommand::SendMessage {
                    recipient: "alice".to_owned(),
                    content: text.to_owned(),
                })
                .expect("send command");
        }
        // Alice is connected, so both pushes land and get stored.
        alice
            .commands
            .send(SyncCommand::SelectPeer {
                peer: "bob".to_owned(),
            })
            .expect("select command");
        wait_for(&mut alice, Duration::from_secs(2), |update| {
            matches!(update, SyncUpdate::Conversation { messages, .. } if messages.len() == 2)
        })
        .await
        .expect("alice receives both pushes");

        bob.commands
            .send(SyncCommand::Close)
            .expect("close command");
        wait_for(&mut bob, Duration::from_secs(2), |update| {
            matches!(update, SyncUpdate::Disconnected)
        })
        .await
        .expect("bob's session winds down");
    }

    // A fresh session starts from nothing and recovers the thread via
    // the history fetch.
    let mut bob = open_session(&base, "bob").await;
    bob.commands
        .send(SyncCommand::SelectPeer {
            peer: "alice".to_owned(),
        })
        .expect("select command");

    let backfilled = wait_for(&mut bob, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Conversation { messages, .. } if messages.len() == 2)
    })
    .await
    .expect("history backfill arrives");
    match backfilled {
        SyncUpdate::Conversation { messages, .. } => {
            assert_eq!(messages[0].content, "first");
            assert_eq!(messages[1].content, "second");
            assert!(messages[0].timestamp <= messages[1].timestamp);
            assert!(
                messages
                    .iter()
                    .all(|message| message.provenance == Provenance::Confirmed)
            );
        }
        other => panic!("unexpected update {other:?}"),
    }
}

#[tokio::test]
async fn presence_updates_reach_other_sessions() {
    let base = start_relay().await;
    signup(&base, "alice").await;
    signup(&base, "bob").await;
    let mut alice = open_session(&base, "alice").await;

    let _bob = open_session(&base, "bob").await;
    let joined = wait_for(&mut alice, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Presence { online } if online.len() == 2)
    })
    .await
    .expect("presence after bob joins");
    assert!(matches!(
        joined,
        SyncUpdate::Presence { online }
            if online == vec!["alice".to_owned(), "bob".to_owned()]
    ));
}

#[tokio::test]
async fn invalid_send_surfaces_a_warning_not_a_disconnect() {
    let base = start_relay().await;
    signup(&base, "alice").await;
    let mut alice = open_session(&base, "alice").await;

    alice
        .commands
        .send(SyncCommand::SendMessage {
            recipient: "bob".to_owned(),
            content: "   ".to_owned(),
        })
        .expect("send command");

    wait_for(&mut alice, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Warning(_))
    })
    .await
    .expect("blank message is rejected locally");

    // The loop is still alive.
    alice
        .commands
        .send(SyncCommand::SelectPeer {
            peer: "bob".to_owned(),
        })
        .expect("select command");
    wait_for(&mut alice, Duration::from_secs(2), |update| {
        matches!(update, SyncUpdate::Conversation { .. })
    })
    .await
    .expect("conversation view after the warning");
}

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let address = listener.local_addr().expect("relay local addr");
    tokio::spawn(async move {
        let _ = serve(listener, AppState::new()).await;
    });
    format!("http://{address}")
}

async fn signup(base: &str, username: &str) {
    let auth = AuthClient::new(base).expect("auth client");
    let identity = auth.signup(username, "hunter2").await.expect("signup");
    assert_eq!(identity, username);
}

async fn open_session(base: &str, username: &str) -> SyncHandle {
    let mut channel = EventChannel::new(base).expect("event channel");
    let streams = channel.open(username).await.expect("open channel");
    let history = HistoryClient::new(base).expect("history client");
    let (synchronizer, handle) = Synchronizer::new(username, channel, streams, history);
    tokio::spawn(synchronizer.run());
    handle
}

async fn wait_for(
    handle: &mut SyncHandle,
    wait: Duration,
    predicate: impl Fn(&SyncUpdate) -> bool,
) -> Option<SyncUpdate> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        let update = timeout(remaining, handle.updates.recv()).await.ok()??;
        if predicate(&update) {
            return Some(update);
        }
    }
}
