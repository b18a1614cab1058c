// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::manual_let_else,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for the bounded reconnect cycle.
//!
//! Verifies that the client driver detects a dropped socket, ends the active
//! session, retries with exponential backoff and a fresh token per attempt,
//! and either recovers or fails terminally once the budget is spent.
//!
//! ## Disconnect simulation
//!
//! Closing the gateway's `JoinHandle` does not close sockets already handed
//! to per-connection tasks. Instead we place a **TCP proxy** between the
//! client and the real gateway; aborting the proxy's connection tasks drops
//! both TCP streams immediately, which the client's WebSocket layer observes
//! as a transport error. The token endpoint is reached directly (not through
//! the proxy), so token provisioning keeps working while the socket is cut.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use havenchat::auth::HttpTokenProvider;
use havenchat::client::{ChatClient, ClientEvent, ClientOptions, HistoryError, SendError};
use havenchat::connection::{ConnectFailure, ConnectionState, ReconnectPolicy};
use havenchat_gateway::gateway::{GatewayState, start_server_with_state};
use havenchat_proto::auth::UserIdentity;
use havenchat_proto::room::{Namespace, Role, UserId};

// =============================================================================
// TCP proxy helper
// =============================================================================

/// Forwards TCP traffic between a client-facing port and the real gateway.
/// `kill()` aborts every connection task, severing both directions of each
/// proxied stream at once.
struct TcpProxy {
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    /// Proxy `127.0.0.1:proxy_port` to `backend`.
    async fn new(proxy_port: u16, backend: std::net::SocketAddr) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind port {proxy_port}: {e}"));
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let conn_handles_clone = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            loop {
                let (mut client_stream, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => break,
                };

                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(backend).await
                    else {
                        return;
                    };
                    // No sub-tasks here: aborting this task must drop both
                    // streams so each end sees an immediate RST.
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });

                conn_handles_clone.lock().push(conn_handle);
            }
        });

        Self {
            accept_handle,
            conn_handles,
        }
    }

    /// Sever all proxied connections and stop accepting new ones.
    fn kill(self) {
        self.accept_handle.abort();
        let handles = self.conn_handles.lock();
        for h in handles.iter() {
            h.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Find a free port by binding to 0 and recording the port.
async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind to port 0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    // Brief pause to let the OS release the port.
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn identity(id: &str, name: &str) -> UserIdentity {
    UserIdentity {
        user_id: UserId::from(id),
        display_name: name.to_string(),
        role: Role::Student,
    }
}

/// Spawn a client that fetches tokens from `api_addr` but opens its socket
/// against `ws_addr` (usually the proxy).
fn spawn_via(
    api_addr: std::net::SocketAddr,
    ws_addr: &str,
    policy: ReconnectPolicy,
) -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    let provider = HttpTokenProvider::new(format!("http://{api_addr}"), identity("u1", "Asha"));
    let options = ClientOptions {
        gateway_url: format!("ws://{ws_addr}"),
        reconnect: policy,
    };
    ChatClient::spawn(options, provider)
}

fn policy(max_attempts: u32, initial_ms: u64) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(initial_ms),
        max_delay: Duration::from_secs(2),
    }
}

/// Wait until the connection state matches a predicate, with timeout.
async fn wait_for_state<F>(
    rx: &mut watch::Receiver<ConnectionState>,
    timeout: Duration,
    description: &str,
    pred: F,
) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            {
                let state = rx.borrow_and_update();
                if pred(&state) {
                    return state.clone();
                }
            }
            rx.changed()
                .await
                .unwrap_or_else(|_| panic!("state channel closed while waiting for {description}"));
        }
    })
    .await;
    outcome.unwrap_or_else(|_| panic!("timeout waiting for {description}"))
}

/// Wait for a specific `ClientEvent` matching a predicate, with timeout.
///
/// Skips non-matching events. Panics on timeout or channel close.
async fn wait_for_event<F>(
    rx: &mut mpsc::Receiver<ClientEvent>,
    timeout: Duration,
    description: &str,
    pred: F,
) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return evt,
            Ok(Some(_other)) => continue,
            Ok(None) => panic!("event channel closed while waiting for {description}"),
            Err(_) => break,
        }
    }
    panic!("timeout waiting for {description}");
}

// =============================================================================
// Test 1: drop, reconnect, resume
// =============================================================================

/// After the socket is severed and the proxy restored, the client recovers on
/// its own; the old session has ended and a fresh join works.
#[tokio::test]
async fn socket_drop_reconnects_and_a_fresh_join_resumes() {
    let state = Arc::new(GatewayState::new());
    let (gw_addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, gw_addr).await;

    let (client, mut events) = spawn_via(
        gw_addr,
        &format!("127.0.0.1:{proxy_port}"),
        policy(5, 100),
    );
    client.connect(Namespace::Peer).await.unwrap();
    let session = client.join_topic("general").await.unwrap();
    let mut state_rx = client.state_stream();

    proxy.kill();

    // The driver notices, ends the session, and starts the cycle.
    wait_for_state(
        &mut state_rx,
        Duration::from_secs(5),
        "Reauthenticating",
        |s| matches!(s, ConnectionState::Reauthenticating { attempt: 1 }),
    )
    .await;
    let ended = wait_for_event(&mut events, Duration::from_secs(5), "SessionEnded", |e| {
        matches!(e, ClientEvent::SessionEnded { .. })
    })
    .await;
    match ended {
        ClientEvent::SessionEnded { room_id } => assert_eq!(room_id.as_str(), "general"),
        other => panic!("expected SessionEnded, got: {other:?}"),
    }

    // Restore the path before the first retry fires (100ms backoff).
    let _proxy2 = TcpProxy::new(proxy_port, gw_addr).await;

    wait_for_state(&mut state_rx, Duration::from_secs(5), "Connected", |s| {
        s.is_connected()
    })
    .await;

    // The old session stays dead; a new join carries on.
    assert!(matches!(
        session.send("hello?").await,
        Err(SendError::SessionEnded)
    ));
    let session = client.join_topic("general").await.unwrap();
    let mut sub = session.subscribe().await.unwrap();
    session.send("back online").await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("timed out waiting for echo")
        .expect("subscription ended unexpectedly");
    assert_eq!(echoed.text, "back online");
}

// =============================================================================
// Test 2: session teardown on drop
// =============================================================================

#[tokio::test]
async fn session_handles_fail_once_the_connection_drops() {
    let state = Arc::new(GatewayState::new());
    let (gw_addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, gw_addr).await;

    let (client, mut events) = spawn_via(
        gw_addr,
        &format!("127.0.0.1:{proxy_port}"),
        policy(2, 50),
    );
    client.connect(Namespace::Peer).await.unwrap();
    let session = client.join_topic("anxiety").await.unwrap();
    let mut sub = session.subscribe().await.unwrap();

    proxy.kill();

    // The subscription ends rather than hanging.
    let next = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("subscription should end after the drop");
    assert!(next.is_none(), "subscription must end, not yield");

    wait_for_event(&mut events, Duration::from_secs(5), "SessionEnded", |e| {
        matches!(e, ClientEvent::SessionEnded { .. })
    })
    .await;

    // Every session operation now reports the ended session.
    assert!(matches!(
        session.send("anyone there?").await,
        Err(SendError::SessionEnded)
    ));
    assert!(matches!(
        session.request_history(None, None).await,
        Err(HistoryError::SessionEnded)
    ));
}

// =============================================================================
// Test 3: bounded budget, backoff shape, terminal failure
// =============================================================================

#[tokio::test]
async fn reconnect_attempts_are_bounded_with_growing_delays() {
    let state = Arc::new(GatewayState::new());
    let (gw_addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, gw_addr).await;

    let (client, _events) = spawn_via(
        gw_addr,
        &format!("127.0.0.1:{proxy_port}"),
        policy(3, 100),
    );
    client.connect(Namespace::Peer).await.unwrap();
    let tokens_before_drop = state.tokens.issued_count();
    let mut state_rx = client.state_stream();

    // Kill and never restore: every retry hits a refused port.
    proxy.kill();

    let mut attempts = Vec::new();
    let mut attempt_instants = Vec::new();
    let failure = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Reauthenticating { attempt } => {
                        if attempts.last() != Some(&attempt) {
                            attempts.push(attempt);
                            attempt_instants.push(Instant::now());
                        }
                    }
                    ConnectionState::Failed { failure } => break failure,
                    _ => {}
                }
            }
            state_rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("cycle should fail terminally within the timeout");

    assert_eq!(attempts, vec![1, 2, 3], "three attempts, then stop");
    assert!(matches!(failure, ConnectFailure::Network { .. }));

    // Delay before attempt 2 is 200ms, before attempt 3 is 400ms. Generous
    // lower bounds keep this robust under scheduler noise.
    let gap_1_to_2 = attempt_instants[1] - attempt_instants[0];
    let gap_2_to_3 = attempt_instants[2] - attempt_instants[1];
    assert!(
        gap_1_to_2 >= Duration::from_millis(80),
        "gap between attempts 1 and 2 too short: {gap_1_to_2:?}"
    );
    assert!(
        gap_2_to_3 >= Duration::from_millis(150),
        "gap between attempts 2 and 3 too short: {gap_2_to_3:?}"
    );
    assert!(
        gap_2_to_3 > gap_1_to_2,
        "backoff should grow: {gap_1_to_2:?} then {gap_2_to_3:?}"
    );

    // One fresh token per attempt; none after the terminal failure.
    let spent = state.tokens.issued_count() - tokens_before_drop;
    assert_eq!(spent, 3, "each attempt provisions its own token");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        state.tokens.issued_count() - tokens_before_drop,
        3,
        "no attempts after the budget is spent"
    );

    // Terminal failure also surfaces through wait_until_connected.
    assert!(client.wait_until_connected().await.is_err());
}

// =============================================================================
// Test 4: server-initiated close
// =============================================================================

/// A close frame from the gateway triggers the same cycle as a TCP drop; with
/// the gateway still up, the first retry succeeds.
#[tokio::test]
async fn server_close_frame_triggers_automatic_recovery() {
    let state = Arc::new(GatewayState::new());
    let (gw_addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let (client, mut events) = spawn_via(gw_addr, &gw_addr.to_string(), policy(5, 50));
    client.connect(Namespace::Peer).await.unwrap();
    let _session = client.join_topic("sleep").await.unwrap();
    let mut state_rx = client.state_stream();
    assert_eq!(state.tokens.issued_count(), 1);

    state.close_all_connections().await;

    wait_for_state(
        &mut state_rx,
        Duration::from_secs(5),
        "Reauthenticating",
        |s| matches!(s, ConnectionState::Reauthenticating { .. }),
    )
    .await;
    wait_for_event(&mut events, Duration::from_secs(5), "SessionEnded", |e| {
        matches!(e, ClientEvent::SessionEnded { .. })
    })
    .await;
    wait_for_state(&mut state_rx, Duration::from_secs(5), "Connected", |s| {
        s.is_connected()
    })
    .await;

    // Recovery consumed exactly one more token, and messaging works again.
    assert_eq!(state.tokens.issued_count(), 2);
    let session = client.join_topic("sleep").await.unwrap();
    let mut sub = session.subscribe().await.unwrap();
    session.send("still here").await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("timed out waiting for echo")
        .expect("subscription ended unexpectedly");
    assert_eq!(echoed.text, "still here");
}

// =============================================================================
// Test 5: manual disconnect cancels the cycle
// =============================================================================

#[tokio::test]
async fn disconnect_cancels_a_running_reconnect_cycle() {
    let state = Arc::new(GatewayState::new());
    let (gw_addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, gw_addr).await;

    let (client, _events) = spawn_via(
        gw_addr,
        &format!("127.0.0.1:{proxy_port}"),
        policy(5, 200),
    );
    client.connect(Namespace::Peer).await.unwrap();
    let mut state_rx = client.state_stream();

    proxy.kill();
    wait_for_state(
        &mut state_rx,
        Duration::from_secs(5),
        "Reauthenticating",
        |s| matches!(s, ConnectionState::Reauthenticating { .. }),
    )
    .await;

    // Disconnect while the backoff timer is pending.
    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // No further attempts fire after the cancel.
    let tokens_at_cancel = state.tokens.issued_count();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(state.tokens.issued_count(), tokens_at_cancel);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
