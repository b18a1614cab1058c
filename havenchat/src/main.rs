//! `HavenChat` console — line-based harness for the realtime client core.
//!
//! Connects to a gateway namespace, joins a room, prints the timeline and
//! room events to stdout, and sends stdin lines as messages. Configuration
//! via CLI flags, environment variables, or config file
//! (`~/.config/havenchat/config.toml`).
//!
//! ```bash
//! # Join the general peer topic
//! cargo run --bin havenchat -- --user-id u-1 --display-name Ada
//!
//! # Join a specific topic room
//! cargo run --bin havenchat -- --user-id u-1 --display-name Ada --topic anxiety
//!
//! # Open a private conversation
//! cargo run --bin havenchat -- --user-id u-1 --display-name Ada \
//!     --namespace private-chat --recipient u-2 --recipient-role counsellor
//! ```

use std::io;
use std::path::Path;
use std::process::ExitCode;

use chrono::{DateTime, Local, Utc};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use havenchat::auth::HttpTokenProvider;
use havenchat::client::{ChatClient, ClientEvent, JoinError, MessageSubscription, RoomSession};
use havenchat::config::{CliArgs, ClientConfig};
use havenchat::connection::ConnectionState;
use havenchat_proto::message::ChatMessage;
use havenchat_proto::room::{Namespace, Role, UserId};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Initialize logging before anything else prints (logs go to file, never
    // stdout, which carries the chat transcript).
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!("havenchat console starting");

    let Some(identity) = config.identity() else {
        eprintln!(
            "An identity is required: pass --user-id and --display-name, \
             or set [identity] in the config file."
        );
        return ExitCode::FAILURE;
    };
    if cli.namespace == Namespace::PrivateChat && cli.recipient.is_none() {
        eprintln!("--recipient is required with --namespace private-chat.");
        return ExitCode::FAILURE;
    }

    let provider = HttpTokenProvider::new(config.api_url.clone(), identity);
    let (client, events) = ChatClient::spawn(config.to_client_options(), provider);

    let me = match client.connect(cli.namespace).await {
        Ok(identity) => identity,
        Err(e) => {
            eprintln!("Could not connect: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!(
        "Connected to {} as {} ({})",
        cli.namespace, me.display_name, me.role
    );

    let result = run_console(&client, events, &cli, &config).await;

    client.disconnect().await;
    tracing::info!("havenchat console exiting");

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs are written to a file (never stdout, which carries the chat
/// transcript). Returns a [`WorkerGuard`] that must be held until shutdown
/// to ensure all buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("havenchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Main console loop: bridge stdin lines to the room and room traffic to
/// stdout. Re-joins after a successful reconnect (sessions never survive a
/// connection drop).
#[allow(clippy::too_many_lines)]
async fn run_console(
    client: &ChatClient,
    mut events: mpsc::Receiver<ClientEvent>,
    cli: &CliArgs,
    config: &ClientConfig,
) -> io::Result<()> {
    let (mut session, mut sub, mut seen) = open_room(client, cli, config)
        .await
        .map_err(io::Error::other)?;

    println!("(/history loads older messages, /typing toggles the indicator, /quit leaves)");

    let mut state_rx = client.state_stream();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut typing = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                match text {
                    "" => {}
                    "/quit" => break,
                    "/typing" => {
                        typing = !typing;
                        if session.send_typing(typing).is_ok() {
                            println!("(typing indicator {})", if typing { "on" } else { "off" });
                        }
                    }
                    "/history" => {
                        // `seen` counts messages consumed from the newest end,
                        // so it doubles as the offset of the next older page.
                        match session.request_history(None, Some(seen)).await {
                            Ok(page) if page.messages.is_empty() => {
                                println!("(no older messages)");
                            }
                            Ok(page) => {
                                seen += page.messages.len();
                                println!("--- older messages ---");
                                for msg in &page.messages {
                                    print_message(msg, &config.timestamp_format);
                                }
                                println!("--- end ---");
                            }
                            Err(e) => println!("! history unavailable: {e}"),
                        }
                    }
                    _ => {
                        if let Err(e) = session.send(text).await {
                            println!("! not sent: {e}");
                        }
                    }
                }
            }
            msg = sub.next() => {
                match msg {
                    Some(msg) => {
                        seen += 1;
                        print_message(&msg, &config.timestamp_format);
                    }
                    None => {
                        // Session over; wait out the reconnect cycle, then
                        // join the same room again.
                        println!("* session ended, waiting for reconnect");
                        client
                            .wait_until_connected()
                            .await
                            .map_err(|e| io::Error::other(format!("connection lost: {e}")))?;
                        let opened = open_room(client, cli, config)
                            .await
                            .map_err(io::Error::other)?;
                        (session, sub, seen) = opened;
                        typing = false;
                    }
                }
            }
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                print_event(&ev);
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Reauthenticating { attempt } => {
                        println!("* reconnecting (attempt {attempt})");
                    }
                    ConnectionState::Failed { failure } => {
                        println!("! connection failed: {failure}");
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

/// Join the configured room, print the newest history page, and subscribe.
///
/// Returns the session, the live subscription, and the number of messages
/// already consumed from the newest end (the starting offset for paging).
async fn open_room(
    client: &ChatClient,
    cli: &CliArgs,
    config: &ClientConfig,
) -> Result<(RoomSession, MessageSubscription, usize), String> {
    let session = join_room(client, cli)
        .await
        .map_err(|e| format!("could not join: {e}"))?;

    match session.topic() {
        Some(topic) => println!("Joined #{topic} ({})", session.room_id()),
        None => println!("Joined private room {}", session.room_id()),
    }

    let mut seen = 0;
    match session.request_history(None, None).await {
        Ok(page) => {
            seen = page.messages.len();
            for msg in &page.messages {
                print_message(msg, &config.timestamp_format);
            }
            if page.has_more {
                println!("(older messages available: /history)");
            }
        }
        Err(e) => println!("! history unavailable: {e}"),
    }

    let sub = session
        .subscribe()
        .await
        .map_err(|e| format!("could not subscribe: {e}"))?;

    Ok((session, sub, seen))
}

/// Join a topic room or a private conversation per the CLI selection.
async fn join_room(client: &ChatClient, cli: &CliArgs) -> Result<RoomSession, JoinError> {
    match cli.namespace {
        Namespace::Peer => client.join_topic(&cli.topic).await,
        Namespace::PrivateChat => {
            let recipient = UserId::from(cli.recipient.clone().unwrap_or_default());
            let role = cli.recipient_role.unwrap_or(Role::Student);
            client.join_private(recipient, role).await
        }
    }
}

/// Print one chat message as a transcript line.
fn print_message(msg: &ChatMessage, timestamp_format: &str) {
    println!(
        "[{}] {}: {}",
        format_timestamp(msg.created_at, timestamp_format),
        msg.sender.display_name,
        msg.text
    );
}

/// Print a room event as a system line.
fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Typing {
            display_name,
            is_typing,
            ..
        } => {
            if *is_typing {
                println!("* {display_name} is typing");
            }
        }
        ClientEvent::UserJoined {
            display_name, role, ..
        } => println!("* {display_name} ({role}) joined"),
        ClientEvent::UserLeft { user_id, .. } => println!("* {user_id} left"),
        ClientEvent::ServerError { message } => println!("! server error: {message}"),
        ClientEvent::SessionEnded { room_id } => {
            tracing::debug!(room_id = %room_id, "session ended");
        }
    }
}

/// Format a UTC timestamp in local time with the configured format string.
///
/// Falls back to RFC 3339 if the format string is invalid.
fn format_timestamp(at: DateTime<Utc>, format: &str) -> String {
    use std::fmt::Write as _;

    let local = at.with_timezone(&Local);
    let mut out = String::new();
    if write!(out, "{}", local.format(format)).is_err() {
        return local.to_rfc3339();
    }
    out
}
