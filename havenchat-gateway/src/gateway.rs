//! Gateway server core: shared state, token route, WebSocket handler, and
//! room fan-out.
//!
//! The gateway accepts WebSocket connections on the `/peer` and
//! `/private-chat` namespaces, authenticates each socket with a single-use
//! token from `POST /auth/socket-token`, and fans room traffic out to every
//! member's writer channel. Accepted messages are logged in a
//! [`HistoryStore`] so late joiners can page backwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use havenchat_proto::auth::{
    HEADER_USER_ID, HEADER_USER_NAME, HEADER_USER_ROLE, SOCKET_TOKEN_PATH, TokenResponse,
    UserIdentity,
};
use havenchat_proto::codec;
use havenchat_proto::frame::{
    AuthErrorCode, ClientFrame, JoinRequest, ServerFrame, clamp_history_limit,
};
use havenchat_proto::message::{ChatMessage, MessageId, SenderInfo, sanitize_text, validate_text};
use havenchat_proto::room::{Namespace, Role, RoomId, UserId, is_known_topic, private_room_id};
use tokio::sync::{RwLock, mpsc};

use crate::auth::TokenIssuer;
use crate::rooms::RoomDirectory;
use crate::store::HistoryStore;

/// Shared gateway state holding the connection registry, token table, room
/// directory, and message history.
pub struct GatewayState {
    /// Maps an authenticated socket (namespace plus user) to a channel sender
    /// for delivering WebSocket messages.
    connections: RwLock<HashMap<(Namespace, UserId), mpsc::UnboundedSender<Message>>>,
    /// Single-use socket tokens.
    pub tokens: TokenIssuer,
    /// Live room membership and conversation records.
    pub rooms: RoomDirectory,
    /// Per-room message logs.
    pub history: HistoryStore,
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayState {
    /// Creates a new gateway state with empty registries and the default
    /// token lifetime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            tokens: TokenIssuer::new(),
            rooms: RoomDirectory::new(),
            history: HistoryStore::new(),
        }
    }

    /// Creates a new gateway state with a custom token lifetime.
    #[must_use]
    pub fn with_token_ttl(ttl: Duration) -> Self {
        Self::with_config(ttl, HistoryStore::new())
    }

    /// Creates a new gateway state with a custom token lifetime and history
    /// store.
    #[must_use]
    pub fn with_config(token_ttl: Duration, history: HistoryStore) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            tokens: TokenIssuer::with_ttl(token_ttl),
            rooms: RoomDirectory::new(),
            history,
        }
    }

    /// Registers an authenticated socket, storing the sender half of its
    /// message channel.
    ///
    /// If the user already had a socket on this namespace, the old sender is
    /// replaced and the old channel is effectively closed (the previous
    /// writer task will detect the closure and shut down).
    pub async fn register(
        &self,
        namespace: Namespace,
        user_id: &UserId,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        let mut conns = self.connections.write().await;
        conns.insert((namespace, user_id.clone()), sender)
    }

    /// Removes a socket from the registry, but only if `sender` is still the
    /// registered channel.
    ///
    /// The guard matters when a duplicate login replaced this socket: the old
    /// handler's cleanup must not tear down the new connection.
    pub async fn unregister(
        &self,
        namespace: Namespace,
        user_id: &UserId,
        sender: &mpsc::UnboundedSender<Message>,
    ) -> bool {
        let mut conns = self.connections.write().await;
        let key = (namespace, user_id.clone());
        match conns.get(&key) {
            Some(current) if current.same_channel(sender) => {
                conns.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Returns a clone of the sender for the given socket, if registered.
    pub async fn get_sender(
        &self,
        namespace: Namespace,
        user_id: &UserId,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        let conns = self.connections.read().await;
        conns.get(&(namespace, user_id.clone())).cloned()
    }

    /// Number of currently registered sockets across both namespaces.
    pub async fn connection_count(&self) -> usize {
        let conns = self.connections.read().await;
        conns.len()
    }

    /// Send a WebSocket Close frame to all connected sockets.
    ///
    /// Each writer task emits the close frame, which the client side observes
    /// as a dropped connection. Useful for graceful shutdown and for
    /// exercising client reconnect behavior in tests.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for ((namespace, user_id), sender) in conns.iter() {
            tracing::info!(namespace = %namespace, user_id = %user_id, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }
}

/// Handles an upgraded WebSocket connection on one namespace.
///
/// The connection lifecycle:
/// 1. Wait for the `auth` frame and redeem the token.
/// 2. Reject with `authError` and close, or send `authOk` and register.
/// 3. Spawn a writer task forwarding the user's channel to the socket.
/// 4. Enter the read loop, dispatching join/history/message/typing frames.
/// 5. On disconnect, unregister, drop room memberships, and announce the
///    departure to affected rooms.
pub async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, namespace: Namespace) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let identity = match wait_for_auth(&mut ws_receiver, &state).await {
        Some(Ok(identity)) => identity,
        Some(Err((code, message))) => {
            tracing::warn!(namespace = %namespace, code = ?code, "rejecting socket auth");
            let _ = send_frame(&mut ws_sender, &ServerFrame::AuthError { code, message }).await;
            return;
        }
        None => {
            tracing::warn!(namespace = %namespace, "connection closed before auth");
            return;
        }
    };

    let user_id = identity.user_id.clone();
    tracing::info!(namespace = %namespace, user_id = %user_id, "socket authenticated");

    // Acknowledge before anything else so the client can flip to connected.
    let ack = ServerFrame::AuthOk {
        user_id: user_id.clone(),
        display_name: identity.display_name.clone(),
        role: identity.role,
    };
    if let Err(e) = send_frame(&mut ws_sender, &ack).await {
        tracing::error!(user_id = %user_id, error = %e, "failed to send auth ack");
        return;
    }

    // Create a channel for sending frames to this socket's writer.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    if state.register(namespace, &user_id, tx.clone()).await.is_some() {
        tracing::info!(
            namespace = %namespace,
            user_id = %user_id,
            "replaced existing connection (duplicate auth)"
        );
        // Old sender is dropped, closing the old channel.
    }

    // Writer task: forward channel messages to the WebSocket.
    let writer_user = user_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user_id = %writer_user, "WebSocket write failed");
                break;
            }
        }
    });

    // Reader loop: dispatch frames from this socket.
    let reader_identity = identity.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_frame(namespace, &reader_identity, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(user_id = %reader_identity.user_id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore binary, ping, pong frames.
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other.
    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    // Clean up, unless a duplicate auth already took this slot over.
    if state.unregister(namespace, &user_id, &tx).await {
        let left_rooms = state.rooms.leave_all(&user_id).await;
        for room_id in left_rooms {
            let departure = ServerFrame::UserLeft {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
            };
            broadcast_room(&state, namespace, &room_id, &departure, Some(&user_id)).await;
        }
    }
    tracing::info!(namespace = %namespace, user_id = %user_id, "socket disconnected");
}

/// Waits for the first frame on the WebSocket, expecting an `auth` frame, and
/// redeems its token.
///
/// Returns `None` if the connection closes first, otherwise the redemption
/// outcome: the bound identity, or the rejection to report before closing.
async fn wait_for_auth(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &Arc<GatewayState>,
) -> Option<Result<UserIdentity, (AuthErrorCode, String)>> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match codec::decode_client(text.as_str()) {
                Ok(ClientFrame::Auth { token }) => {
                    return Some(state.tokens.redeem(&token).await.map_err(|code| {
                        let message = match code {
                            AuthErrorCode::TokenExpired => "socket token expired",
                            AuthErrorCode::TokenInvalid => "socket token not recognized",
                            AuthErrorCode::TokenMissing => "no socket token presented",
                        };
                        (code, message.to_string())
                    }));
                }
                Ok(other) => {
                    tracing::warn!(frame = ?other, "expected auth, got different frame");
                    return Some(Err((
                        AuthErrorCode::TokenMissing,
                        "first frame must be auth".to_string(),
                    )));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode first frame");
                    return Some(Err((
                        AuthErrorCode::TokenMissing,
                        "first frame must be auth".to_string(),
                    )));
                }
            },
            Message::Close(_) => return None,
            _ => {
                // Skip binary and ping/pong frames during authentication.
            }
        }
    }
    None
}

/// Handles one decoded-or-not text frame from an authenticated socket.
async fn handle_frame(
    namespace: Namespace,
    identity: &UserIdentity,
    text: &str,
    state: &Arc<GatewayState>,
) {
    let user_id = &identity.user_id;
    let frame = match codec::decode_client(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "failed to decode frame");
            return;
        }
    };

    match frame {
        ClientFrame::Auth { .. } => {
            tracing::warn!(user_id = %user_id, "received duplicate auth on live socket");
        }
        ClientFrame::Join { request } => {
            handle_join(namespace, identity, request, state).await;
        }
        ClientFrame::History {
            room_id,
            limit,
            offset,
        } => {
            let limit = clamp_history_limit(limit);
            let offset = offset.unwrap_or(0);
            let (messages, has_more) = state.history.page(&room_id, limit, offset).await;
            tracing::debug!(
                user_id = %user_id,
                room_id = %room_id,
                count = messages.len(),
                has_more,
                "serving history page"
            );
            let page = ServerFrame::History {
                room_id,
                messages,
                has_more,
            };
            send_to_user(state, namespace, user_id, &page).await;
        }
        ClientFrame::Message { room_id, text, .. } => {
            handle_message(namespace, identity, room_id, text, state).await;
        }
        ClientFrame::Typing { room_id, is_typing } => {
            if !state.rooms.is_member(&room_id, user_id).await {
                tracing::debug!(user_id = %user_id, room_id = %room_id, "typing from non-member ignored");
                return;
            }
            let indicator = ServerFrame::Typing {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
                display_name: identity.display_name.clone(),
                is_typing,
            };
            // Composing indicators go to the others only, never back to the
            // sender.
            broadcast_room(state, namespace, &room_id, &indicator, Some(user_id)).await;
        }
    }
}

/// Handles a join request, resolving the target room per namespace rules.
async fn handle_join(
    namespace: Namespace,
    identity: &UserIdentity,
    request: JoinRequest,
    state: &Arc<GatewayState>,
) {
    let user_id = &identity.user_id;
    let (room_id, topic, conversation_id) = match request {
        JoinRequest::Topic { topic } => {
            if namespace != Namespace::Peer {
                send_error(state, namespace, user_id, "topic rooms live on the /peer namespace")
                    .await;
                return;
            }
            if !is_known_topic(&topic) {
                send_error(state, namespace, user_id, &format!("unknown topic: {topic}")).await;
                return;
            }
            (RoomId::from(topic.as_str()), Some(topic), None)
        }
        JoinRequest::Private {
            recipient_id,
            recipient_role,
        } => {
            if namespace != Namespace::PrivateChat {
                send_error(
                    state,
                    namespace,
                    user_id,
                    "private conversations live on the /private-chat namespace",
                )
                .await;
                return;
            }
            tracing::debug!(
                user_id = %user_id,
                recipient = %recipient_id,
                recipient_role = %recipient_role,
                "private join"
            );
            let room_id = private_room_id(user_id, &recipient_id);
            let conversation = state.rooms.conversation_for(&room_id).await;
            (room_id, None, Some(conversation))
        }
    };

    let newly_joined = state.rooms.join(&room_id, namespace, user_id).await;
    tracing::info!(
        namespace = %namespace,
        user_id = %user_id,
        room_id = %room_id,
        newly_joined,
        "joined room"
    );

    let joined = ServerFrame::Joined {
        room_id: room_id.clone(),
        topic,
        conversation_id,
    };
    send_to_user(state, namespace, user_id, &joined).await;

    if newly_joined {
        let announcement = ServerFrame::UserJoined {
            room_id: room_id.clone(),
            user_id: user_id.clone(),
            display_name: identity.display_name.clone(),
            role: identity.role,
        };
        broadcast_room(state, namespace, &room_id, &announcement, Some(user_id)).await;
    }
}

/// Handles an outgoing chat message: validate, sanitize, log, and echo to
/// every member of the room including the sender.
async fn handle_message(
    namespace: Namespace,
    identity: &UserIdentity,
    room_id: RoomId,
    text: String,
    state: &Arc<GatewayState>,
) {
    let user_id = &identity.user_id;

    let Some(entry) = state.rooms.entry(&room_id).await else {
        send_error(state, namespace, user_id, "join the room before sending").await;
        return;
    };
    if !entry.members.contains(user_id) {
        send_error(state, namespace, user_id, "join the room before sending").await;
        return;
    }

    if let Err(e) = validate_text(&text) {
        tracing::debug!(user_id = %user_id, error = %e, "rejecting message text");
        send_error(state, namespace, user_id, &e.to_string()).await;
        return;
    }

    // The conversation record is resolved server-side; the client's claim is
    // advisory.
    let conversation_id = match entry.namespace {
        Namespace::PrivateChat => Some(state.rooms.conversation_for(&room_id).await),
        Namespace::Peer => None,
    };

    let message = ChatMessage {
        id: MessageId::generate(),
        room_id: room_id.clone(),
        conversation_id,
        sender: SenderInfo {
            id: user_id.clone(),
            display_name: identity.display_name.clone(),
            role: identity.role,
            avatar_ref: None,
        },
        text: sanitize_text(&text),
        created_at: Utc::now(),
    };

    state.history.append(message.clone()).await;
    tracing::debug!(
        user_id = %user_id,
        room_id = %room_id,
        message_id = %message.id,
        "accepted message"
    );

    let echo = ServerFrame::Message { message };
    broadcast_room(state, namespace, &room_id, &echo, None).await;
}

/// Sends a frame to every member of a room, optionally excluding one user.
async fn broadcast_room(
    state: &Arc<GatewayState>,
    namespace: Namespace,
    room_id: &RoomId,
    frame: &ServerFrame,
    exclude: Option<&UserId>,
) {
    let text = match codec::encode(frame) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode frame for broadcast");
            return;
        }
    };
    for member in state.rooms.members(room_id).await {
        if exclude == Some(&member) {
            continue;
        }
        if let Some(sender) = state.get_sender(namespace, &member).await {
            let _ = sender.send(Message::Text(text.clone().into()));
        }
    }
}

/// Sends a frame to one registered socket via its channel.
async fn send_to_user(
    state: &Arc<GatewayState>,
    namespace: Namespace,
    user_id: &UserId,
    frame: &ServerFrame,
) {
    if let Some(sender) = state.get_sender(namespace, user_id).await
        && let Ok(text) = codec::encode(frame)
    {
        let _ = sender.send(Message::Text(text.into()));
    }
}

/// Sends an `error` frame to one registered socket.
async fn send_error(
    state: &Arc<GatewayState>,
    namespace: Namespace,
    user_id: &UserId,
    message: &str,
) {
    tracing::debug!(user_id = %user_id, message = %message, "sending error frame");
    let frame = ServerFrame::Error {
        message: message.to_string(),
    };
    send_to_user(state, namespace, user_id, &frame).await;
}

/// Encodes and sends a frame directly on a WebSocket sender.
///
/// Used during the handshake, before the writer task owns the sink.
async fn send_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &ServerFrame,
) -> Result<(), String> {
    let text = codec::encode(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Extracts the caller's identity from the platform headers on a token
/// request.
fn identity_from_headers(headers: &HeaderMap) -> Result<UserIdentity, String> {
    let header = |name: &str| -> Result<&str, String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("missing {name} header"))
    };
    let user_id = header(HEADER_USER_ID)?;
    let display_name = header(HEADER_USER_NAME)?;
    let role = header(HEADER_USER_ROLE)?
        .parse::<Role>()
        .map_err(|e| e.to_string())?;
    Ok(UserIdentity {
        user_id: UserId::from(user_id),
        display_name: display_name.to_string(),
        role,
    })
}

/// axum handler for `POST /auth/socket-token`.
async fn issue_token(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> axum::response::Response {
    match identity_from_headers(&headers) {
        Ok(identity) => {
            let token = state.tokens.issue(identity.clone()).await;
            tracing::debug!(user_id = %identity.user_id, "issued socket token");
            Json(TokenResponse {
                success: true,
                socket_token: token,
            })
            .into_response()
        }
        Err(reason) => {
            tracing::warn!(reason = %reason, "token request rejected");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "success": false, "error": reason })),
            )
                .into_response()
        }
    }
}

/// axum handler that upgrades a `/peer` request to a WebSocket connection.
async fn peer_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Namespace::Peer))
}

/// axum handler that upgrades a `/private-chat` request to a WebSocket
/// connection.
async fn private_chat_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Namespace::PrivateChat))
}

/// Starts the gateway on the given address and returns the bound address and
/// a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(GatewayState::new())).await
}

/// Starts the gateway with a pre-configured [`GatewayState`].
///
/// Use [`GatewayState::with_token_ttl`] to create a state with a custom token
/// lifetime from the resolved [`crate::config::GatewayConfig`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<GatewayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route(SOCKET_TOKEN_PATH, axum::routing::post(issue_token))
        .route(Namespace::Peer.path(), axum::routing::get(peer_ws_handler))
        .route(
            Namespace::PrivateChat.path(),
            axum::routing::get(private_chat_ws_handler),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "gateway server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Starts the gateway in-process for testing.
///
/// Binds to `127.0.0.1:0` (OS-assigned port) and returns the bound address
/// and a [`tokio::task::JoinHandle`] for cleanup.
#[cfg(test)]
pub async fn start_test_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server("127.0.0.1:0")
        .await
        .expect("failed to start test server")
}
