//! Line-oriented chat client.
//!
//! Thin wrapper around the synchronizer: logs in, opens the channel,
//! then turns stdin lines into commands and updates into stdout lines.

use clap::Parser;
use confab_client::{
    AuthClient, EventChannel, HistoryClient, SyncCommand, SyncUpdate, Synchronizer,
};
use confab_core::Provenance;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "confab")]
struct ClientArgs {
    /// Username to connect as.
    username: String,

    /// Server base URL.
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    server: String,

    /// Account password.
    #[arg(long)]
    password: String,

    /// Create the account before logging in.
    #[arg(long)]
    signup: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = ClientArgs::parse();
    if let Err(err) = run(args).await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run(args: ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let auth = AuthClient::new(&args.server)?;
    let identity = if args.signup {
        auth.signup(&args.username, &args.password).await?
    } else {
        auth.login(&args.username, &args.password).await?
    };
    println!("logged in as {identity}");

    let mut channel = EventChannel::new(&args.server)?;
    let streams = channel.open(&identity).await?;
    let history = HistoryClient::new(&args.server)?;

    let (synchronizer, mut handle) = Synchronizer::new(&identity, channel, streams, history);
    let loop_task = tokio::spawn(synchronizer.run());

    let commands = handle.commands.clone();
    let printer = tokio::spawn(async move {
        while let Some(update) = handle.updates.recv().await {
            print_update(&update);
            if matches!(update, SyncUpdate::Disconnected) {
                break;
            }
        }
    });

    let mut selected: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_help();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }

        let command = match parse_line(&line, &mut selected) {
            ParsedLine::Command(command) => command,
            ParsedLine::Help => {
                print_help();
                continue;
            }
            ParsedLine::NoPeer => {
                println!("pick a conversation first: /chat <friend>");
                continue;
            }
        };

        let quitting = matches!(command, SyncCommand::Close);
        if commands.send(command).is_err() {
            break;
        }
        if quitting {
            break;
        }
    }

    let _ = commands.send(SyncCommand::Close);
    let _ = loop_task.await;
    printer.abort();
    Ok(())
}

enum ParsedLine {
    Command(SyncCommand),
    Help,
    NoPeer,
}

fn parse_line(line: &str, selected: &mut Option<String>) -> ParsedLine {
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    match verb {
        "/request" => ParsedLine::Command(SyncCommand::SendFriendRequest {
            recipient: rest.to_owned(),
        }),
        "/accept" => ParsedLine::Command(SyncCommand::AcceptFriend {
            requester: rest.to_owned(),
        }),
        "/decline" => ParsedLine::Command(SyncCommand::DeclineFriend {
            requester: rest.to_owned(),
        }),
        "/remove" => ParsedLine::Command(SyncCommand::RemoveFriend {
            target: rest.to_owned(),
        }),
        "/chat" => {
            *selected = Some(rest.to_owned());
            ParsedLine::Command(SyncCommand::SelectPeer {
                peer: rest.to_owned(),
            })
        }
        "/quit" => ParsedLine::Command(SyncCommand::Close),
        "/help" => ParsedLine::Help,
        _ => match selected {
            Some(peer) => ParsedLine::Command(SyncCommand::SendMessage {
                recipient: peer.clone(),
                content: line.to_owned(),
            }),
            None => ParsedLine::NoPeer,
        },
    }
}

fn print_update(update: &SyncUpdate) {
    match update {
        SyncUpdate::Relationships {
            friends,
            incoming,
            outgoing,
        } => {
            println!("friends: {}", friends.join(", "));
            if !incoming.is_empty() {
                println!("requests for you: {}", incoming.join(", "));
            }
            if !outgoing.is_empty() {
                println!("awaiting answer: {}", outgoing.join(", "));
            }
        }
        SyncUpdate::Conversation { peer, messages } => {
            println!("--- {peer} ---");
            for message in messages {
                let marker = match message.provenance {
                    Provenance::OptimisticLocal => "~",
                    Provenance::Confirmed => " ",
                };
                println!(
                    "{marker}[{}] {}: {}",
                    message.timestamp.format("%H:%M:%S"),
                    message.sender,
                    message.content
                );
            }
        }
        SyncUpdate::Presence { online } => println!("online: {}", online.join(", ")),
        SyncUpdate::Warning(reason) => println!("! {reason}"),
        SyncUpdate::Disconnected => println!("disconnected"),
    }
}

fn print_help() {
    println!(
        "commands: /request <user>  /accept <user>  /decline <user>  \
         /remove <user>  /chat <user>  /quit. anything else is sent \
         to the selected conversation"
    );
}
