//! Client core: the driver task owning the socket, the connection state
//! machine, the active room session, and the message store.
//!
//! # Architecture
//!
//! ```text
//! ChatClient / RoomSession  ── Command ──→  driver task (owns socket)
//!                           ←─ ClientEvent / watch<ConnectionState> ──
//! ```
//!
//! One logical event loop: the driver processes caller commands, socket
//! frames, and reconnect timers as discrete reactions inside a `select!`
//! loop, so there is no shared mutable connection state. Callers await
//! command completion through oneshot replies.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use havenchat_proto::auth::UserIdentity;
use havenchat_proto::codec;
use havenchat_proto::frame::{ClientFrame, JoinRequest, ServerFrame};
use havenchat_proto::message::{ChatMessage, TextError, validate_text};
use havenchat_proto::room::{ConversationId, Namespace, Role, RoomId, UserId};

use crate::auth::TokenProvider;
use crate::connection::{
    ConnectFailure, ConnectionState, EstablishError, ReconnectPolicy, WsSink, WsStream, establish,
};
use crate::store::MessageStore;

/// Capacity of the [`ClientEvent`] channel handed out by [`ChatClient::spawn`].
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of each message subscription channel.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Options for constructing a [`ChatClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Gateway base URL (e.g. `ws://127.0.0.1:9300`); the namespace path is
    /// appended per connection.
    pub gateway_url: String,
    /// Reconnect policy for dropped connections.
    pub reconnect: ReconnectPolicy,
}

impl ClientOptions {
    /// Options with the default reconnect policy.
    #[must_use]
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Events the driver emits outside of command replies.
///
/// Room-scoped events are delivered only while a session for that room is
/// active; anything addressed to another room is dropped with a debug log.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A peer's typing indicator changed in the active room.
    Typing {
        /// Room the indicator belongs to.
        room_id: RoomId,
        /// The typing user.
        user_id: UserId,
        /// The typing user's display name.
        display_name: String,
        /// Whether they started or stopped typing.
        is_typing: bool,
    },
    /// A participant entered the active room.
    UserJoined {
        /// Room the participant entered.
        room_id: RoomId,
        /// The participant's id.
        user_id: UserId,
        /// The participant's display name.
        display_name: String,
        /// The participant's role.
        role: Role,
    },
    /// A participant left the active room.
    UserLeft {
        /// Room the participant left.
        room_id: RoomId,
        /// The participant's id.
        user_id: UserId,
    },
    /// The server reported a fault outside any pending request.
    ServerError {
        /// The server's message, passed through as-is.
        message: String,
    },
    /// The active session ended (connection dropped, or a newer join or
    /// connect replaced it). The caller must re-join after reconnecting.
    SessionEnded {
        /// Room of the ended session.
        room_id: RoomId,
    },
}

/// One page of room history, oldest first.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    /// Messages ordered oldest to newest.
    pub messages: Vec<ChatMessage>,
    /// Whether older messages remain beyond this page.
    pub has_more: bool,
}

/// Errors from [`ChatClient::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The connect cycle ended in a terminal failure.
    #[error("{failure}")]
    Failed {
        /// The categorized failure.
        failure: ConnectFailure,
    },

    /// A later `connect()` or `disconnect()` replaced this attempt.
    #[error("connect cancelled")]
    Cancelled,

    /// The driver task has shut down.
    #[error("client driver has shut down")]
    ClientClosed,
}

/// Errors from [`ChatClient::join`].
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// There is no live connection to join through.
    #[error("not connected")]
    NotConnected,

    /// The server rejected the join.
    #[error("join rejected: {0}")]
    Rejected(String),

    /// A newer join replaced this one before it was acknowledged.
    #[error("superseded by a newer join")]
    Superseded,

    /// The connection dropped before the join was acknowledged.
    #[error("connection lost before the join completed")]
    ConnectionLost,

    /// The driver task has shut down.
    #[error("client driver has shut down")]
    ClientClosed,
}

/// Errors from [`RoomSession::request_history`].
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The session this request was issued on has ended.
    #[error("session has ended")]
    SessionEnded,

    /// The server rejected the request.
    #[error("history rejected: {0}")]
    Rejected(String),

    /// A newer history request replaced this one.
    #[error("superseded by a newer history request")]
    Superseded,

    /// The connection dropped before the page arrived.
    #[error("connection lost before the history page arrived")]
    ConnectionLost,

    /// The driver task has shut down.
    #[error("client driver has shut down")]
    ClientClosed,
}

/// Errors from [`RoomSession::send`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The session this send was issued on has ended.
    #[error("session has ended")]
    SessionEnded,

    /// The text failed local validation (empty or over-length).
    #[error(transparent)]
    InvalidText(#[from] TextError),

    /// The socket write failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The driver task has shut down.
    #[error("client driver has shut down")]
    ClientClosed,
}

/// Errors from [`RoomSession::subscribe`] and [`RoomSession::send_typing`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session has ended.
    #[error("session has ended")]
    Ended,

    /// The driver task has shut down.
    #[error("client driver has shut down")]
    ClientClosed,
}

/// Commands sent from handles to the driver task.
enum Command {
    Connect {
        namespace: Namespace,
        reply: oneshot::Sender<Result<UserIdentity, ConnectError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<Result<SessionSeed, JoinError>>,
    },
    History {
        epoch: u64,
        limit: Option<usize>,
        offset: Option<usize>,
        reply: oneshot::Sender<Result<HistoryPage, HistoryError>>,
    },
    Send {
        epoch: u64,
        text: String,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    Typing {
        epoch: u64,
        is_typing: bool,
    },
    Subscribe {
        epoch: u64,
        reply: oneshot::Sender<Result<(u64, mpsc::Receiver<ChatMessage>), SessionError>>,
    },
    Unsubscribe {
        id: u64,
    },
    EndSession {
        epoch: u64,
    },
}

/// Everything a [`RoomSession`] needs, produced on a `joined` ack.
struct SessionSeed {
    epoch: u64,
    room_id: RoomId,
    topic: Option<String>,
    conversation_id: Option<ConversationId>,
    store: Arc<RwLock<MessageStore>>,
}

/// Handle to the client driver task.
///
/// Cloning is cheap. The driver shuts down once every handle — including
/// live [`RoomSession`]s and [`MessageSubscription`]s — has been dropped.
#[derive(Debug, Clone)]
pub struct ChatClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ChatClient {
    /// Spawn the driver task and return the client handle plus the event
    /// stream.
    ///
    /// The driver starts in [`ConnectionState::Disconnected`]; nothing
    /// touches the network until [`connect`](Self::connect) is called.
    #[must_use]
    pub fn spawn<P>(options: ClientOptions, provider: P) -> (Self, mpsc::Receiver<ClientEvent>)
    where
        P: TokenProvider + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            provider,
            gateway_url: options.gateway_url,
            policy: options.reconnect,
            cmd_rx,
            event_tx,
            state_tx,
            phase: Phase::Idle,
            namespace: None,
            session: None,
            reconnecting: false,
            pending_connect: None,
            pending_join: None,
            pending_history: None,
            next_epoch: 0,
            next_subscription: 0,
        };
        tokio::spawn(driver.run());

        (Self { cmd_tx, state_rx }, event_rx)
    }

    /// Connect to the given namespace, tearing down any existing connection
    /// first.
    ///
    /// Runs the full attempt cycle (token fetch, socket open, auth handshake,
    /// bounded retries) and resolves with the server-attested identity once
    /// connected.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Failed`] when the cycle ends in a terminal failure,
    /// [`ConnectError::Cancelled`] when a later `connect()`/`disconnect()`
    /// replaced this attempt.
    pub async fn connect(&self, namespace: Namespace) -> Result<UserIdentity, ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { namespace, reply })
            .map_err(|_| ConnectError::ClientClosed)?;
        rx.await.map_err(|_| ConnectError::ClientClosed)?
    }

    /// Disconnect and cancel any in-flight reconnect timer.
    ///
    /// Idempotent: safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// The current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// A watch receiver observing connection state transitions.
    #[must_use]
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the client is connected.
    ///
    /// Resolves immediately if already connected.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Failed`] if the connect cycle reaches a terminal
    /// failure while waiting.
    pub async fn wait_until_connected(&self) -> Result<(), ConnectError> {
        let mut state_rx = self.state_rx.clone();
        loop {
            {
                let state = state_rx.borrow_and_update();
                match &*state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed { failure } => {
                        return Err(ConnectError::Failed {
                            failure: failure.clone(),
                        });
                    }
                    _ => {}
                }
            }
            state_rx
                .changed()
                .await
                .map_err(|_| ConnectError::ClientClosed)?;
        }
    }

    /// Join a topic room on the peer namespace.
    ///
    /// # Errors
    ///
    /// See [`join`](Self::join).
    pub async fn join_topic(&self, topic: impl Into<String>) -> Result<RoomSession, JoinError> {
        self.join(JoinRequest::Topic {
            topic: topic.into(),
        })
        .await
    }

    /// Join a private conversation with the given peer.
    ///
    /// # Errors
    ///
    /// See [`join`](Self::join).
    pub async fn join_private(
        &self,
        recipient_id: UserId,
        recipient_role: Role,
    ) -> Result<RoomSession, JoinError> {
        self.join(JoinRequest::Private {
            recipient_id,
            recipient_role,
        })
        .await
    }

    /// Join a room or private conversation, superseding the active session.
    ///
    /// The selector kind must match the connected namespace; the gateway
    /// rejects mismatches with an `error` event surfaced as
    /// [`JoinError::Rejected`].
    ///
    /// # Errors
    ///
    /// [`JoinError::NotConnected`] without a live connection (use
    /// [`wait_until_connected`](Self::wait_until_connected) first),
    /// [`JoinError::Rejected`] when the server refuses the join.
    pub async fn join(&self, request: JoinRequest) -> Result<RoomSession, JoinError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Join { request, reply })
            .map_err(|_| JoinError::ClientClosed)?;
        let seed = rx.await.map_err(|_| JoinError::ClientClosed)??;

        Ok(RoomSession {
            epoch: seed.epoch,
            room_id: seed.room_id,
            topic: seed.topic,
            conversation_id: seed.conversation_id,
            store: seed.store,
            cmd_tx: self.cmd_tx.clone(),
        })
    }
}

/// A joined room or private conversation.
///
/// Created by [`ChatClient::join`]. Sessions never survive a reconnect: when
/// the connection drops, the session ends (observers see
/// [`ClientEvent::SessionEnded`]) and the caller must join again. Dropping
/// the session tears it down in the driver.
#[derive(Debug)]
pub struct RoomSession {
    epoch: u64,
    room_id: RoomId,
    topic: Option<String>,
    conversation_id: Option<ConversationId>,
    store: Arc<RwLock<MessageStore>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl RoomSession {
    /// The room this session is joined to.
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The topic, for peer-namespace sessions.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// The conversation id, for private sessions.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    /// A copy of the session's current timeline, oldest first.
    ///
    /// Cheap read lock; safe to call from rendering code while the driver
    /// appends.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.store.read().snapshot()
    }

    /// Request a history page and hydrate the session store with it.
    ///
    /// `limit` defaults to 50 (clamped to 1..=100 by the server); `offset`
    /// skips from the newest end. The page is returned oldest first.
    ///
    /// # Errors
    ///
    /// [`HistoryError::SessionEnded`] once the session is over,
    /// [`HistoryError::Rejected`] if the server refuses the request.
    pub async fn request_history(
        &self,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<HistoryPage, HistoryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::History {
                epoch: self.epoch,
                limit,
                offset,
                reply,
            })
            .map_err(|_| HistoryError::ClientClosed)?;
        rx.await.map_err(|_| HistoryError::ClientClosed)?
    }

    /// Send a message to the joined room.
    ///
    /// The text is validated locally (non-empty after trimming, at most 2000
    /// characters) before anything is sent. The message appears in the
    /// timeline only when the server echoes it back — there is no optimistic
    /// insert, so the echo can never produce a duplicate.
    ///
    /// # Errors
    ///
    /// [`SendError::InvalidText`] for empty or over-length text,
    /// [`SendError::SessionEnded`] once the session is over.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        let text = text.into();
        validate_text(&text)?;

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                epoch: self.epoch,
                text,
                reply,
            })
            .map_err(|_| SendError::ClientClosed)?;
        rx.await.map_err(|_| SendError::ClientClosed)?
    }

    /// Send a best-effort typing indicator.
    ///
    /// Delivery is not confirmed; failures are logged and dropped.
    ///
    /// # Errors
    ///
    /// [`SessionError::ClientClosed`] if the driver has shut down.
    pub fn send_typing(&self, is_typing: bool) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::Typing {
                epoch: self.epoch,
                is_typing,
            })
            .map_err(|_| SessionError::ClientClosed)
    }

    /// Subscribe to live messages for this session.
    ///
    /// The subscription yields every message accepted into the store (echoes
    /// of own sends included, duplicates already filtered). Dropping the
    /// handle unregisters the listener.
    ///
    /// # Errors
    ///
    /// [`SessionError::Ended`] once the session is over.
    pub async fn subscribe(&self) -> Result<MessageSubscription, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                epoch: self.epoch,
                reply,
            })
            .map_err(|_| SessionError::ClientClosed)?;
        let (id, messages) = rx.await.map_err(|_| SessionError::ClientClosed)??;

        Ok(MessageSubscription {
            id,
            messages,
            cmd_tx: self.cmd_tx.clone(),
        })
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::EndSession { epoch: self.epoch });
    }
}

/// Live message stream for one session.
///
/// Ends (yields `None`) when the session is torn down or the connection
/// drops. Dropping the handle unregisters the listener in the driver.
#[derive(Debug)]
pub struct MessageSubscription {
    id: u64,
    messages: mpsc::Receiver<ChatMessage>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl MessageSubscription {
    /// The next live message, or `None` once the session has ended.
    pub async fn next(&mut self) -> Option<ChatMessage> {
        self.messages.recv().await
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Unsubscribe { id: self.id });
    }
}

/// The active session, as the driver tracks it.
struct ActiveSession {
    epoch: u64,
    room_id: RoomId,
    conversation_id: Option<ConversationId>,
    store: Arc<RwLock<MessageStore>>,
    subscribers: Vec<(u64, mpsc::Sender<ChatMessage>)>,
}

/// What the driver is currently waiting on.
enum Phase {
    /// No socket and no pending attempt.
    Idle,
    /// Authenticated socket held open.
    Live { sink: WsSink, stream: WsStream },
    /// Waiting out the delay before the given attempt.
    Backoff {
        attempt: u32,
        timer: Pin<Box<Sleep>>,
    },
}

/// A single reason the driver woke up.
enum Wake {
    Cmd(Option<Command>),
    Frame(Option<Result<Message, WsError>>),
    Timer(u32),
}

/// The driver task: owns the socket and all connection/session state.
struct Driver<P> {
    provider: P,
    gateway_url: String,
    policy: ReconnectPolicy,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<ClientEvent>,
    state_tx: watch::Sender<ConnectionState>,
    phase: Phase,
    namespace: Option<Namespace>,
    session: Option<ActiveSession>,
    /// Whether the current attempt cycle is a reconnect (after a drop) as
    /// opposed to a user-initiated connect.
    reconnecting: bool,
    pending_connect: Option<oneshot::Sender<Result<UserIdentity, ConnectError>>>,
    pending_join: Option<oneshot::Sender<Result<SessionSeed, JoinError>>>,
    pending_history: Option<oneshot::Sender<Result<HistoryPage, HistoryError>>>,
    next_epoch: u64,
    next_subscription: u64,
}

impl<P: TokenProvider> Driver<P> {
    /// Select-then-dispatch event loop.
    ///
    /// Exits when every command sender (client, sessions, subscriptions) has
    /// been dropped.
    async fn run(mut self) {
        loop {
            let wake = match &mut self.phase {
                Phase::Idle => Wake::Cmd(self.cmd_rx.recv().await),
                Phase::Live { stream, .. } => tokio::select! {
                    cmd = self.cmd_rx.recv() => Wake::Cmd(cmd),
                    frame = stream.next() => Wake::Frame(frame),
                },
                Phase::Backoff { attempt, timer } => {
                    let attempt = *attempt;
                    tokio::select! {
                        cmd = self.cmd_rx.recv() => Wake::Cmd(cmd),
                        () = timer.as_mut() => Wake::Timer(attempt),
                    }
                }
            };

            match wake {
                Wake::Cmd(Some(cmd)) => self.handle_command(cmd).await,
                Wake::Cmd(None) => {
                    self.teardown_socket().await;
                    break;
                }
                Wake::Frame(frame) => self.handle_socket_event(frame),
                Wake::Timer(attempt) => self.run_attempt(attempt).await,
            }
        }
        tracing::debug!("client driver exiting");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { namespace, reply } => self.handle_connect(namespace, reply).await,
            Command::Disconnect { reply } => {
                self.handle_disconnect().await;
                let _ = reply.send(());
            }
            Command::Join { request, reply } => self.handle_join(request, reply).await,
            Command::History {
                epoch,
                limit,
                offset,
                reply,
            } => self.handle_history(epoch, limit, offset, reply).await,
            Command::Send { epoch, text, reply } => self.handle_send(epoch, text, reply).await,
            Command::Typing { epoch, is_typing } => self.handle_typing(epoch, is_typing).await,
            Command::Subscribe { epoch, reply } => self.handle_subscribe(epoch, reply),
            Command::Unsubscribe { id } => {
                if let Some(session) = &mut self.session {
                    session.subscribers.retain(|(sid, _)| *sid != id);
                }
            }
            Command::EndSession { epoch } => {
                if self.session.as_ref().is_some_and(|s| s.epoch == epoch) {
                    // The owning RoomSession was dropped; no event needed.
                    self.session = None;
                }
            }
        }
    }

    /// Start a user-initiated connect cycle, replacing whatever was active.
    async fn handle_connect(
        &mut self,
        namespace: Namespace,
        reply: oneshot::Sender<Result<UserIdentity, ConnectError>>,
    ) {
        self.teardown_socket().await;
        self.fail_pending_requests();
        if let Some(stale) = self.pending_connect.take() {
            let _ = stale.send(Err(ConnectError::Cancelled));
        }
        self.end_session();

        self.namespace = Some(namespace);
        self.reconnecting = false;
        self.pending_connect = Some(reply);
        self.state_tx.send_replace(ConnectionState::Connecting);
        // The first user-initiated attempt runs without delay.
        self.schedule_attempt(1, Duration::ZERO);
    }

    /// Manual disconnect: terminal until the next `connect()`.
    async fn handle_disconnect(&mut self) {
        self.teardown_socket().await;
        self.fail_pending_requests();
        if let Some(stale) = self.pending_connect.take() {
            let _ = stale.send(Err(ConnectError::Cancelled));
        }
        self.end_session();
        self.namespace = None;
        self.reconnecting = false;
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Run one establish attempt after its backoff elapsed.
    async fn run_attempt(&mut self, attempt: u32) {
        let Some(namespace) = self.namespace else {
            self.phase = Phase::Idle;
            return;
        };

        match establish(&self.provider, &self.gateway_url, namespace).await {
            Ok(conn) => {
                self.phase = Phase::Live {
                    sink: conn.sink,
                    stream: conn.stream,
                };
                self.reconnecting = false;
                self.state_tx.send_replace(ConnectionState::Connected);
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Ok(conn.identity));
                }
            }
            Err(err) => {
                tracing::warn!(attempt, err = %err, "connection attempt failed");
                if err.is_terminal() || attempt >= self.policy.max_attempts {
                    self.fail_cycle(err);
                } else {
                    let next = attempt + 1;
                    // An expired token retries at once with a fresh one; the
                    // attempt still counts against the budget.
                    let delay = if err.retries_immediately() {
                        Duration::ZERO
                    } else {
                        self.policy.delay_for(next)
                    };
                    self.schedule_attempt(next, delay);
                }
            }
        }
    }

    /// Enter the terminal failed state and inform every observer.
    fn fail_cycle(&mut self, err: EstablishError) {
        let failure = err.into_failure();
        tracing::warn!(failure = %failure, "connection cycle failed");
        self.phase = Phase::Idle;
        self.namespace = None;
        self.reconnecting = false;
        self.state_tx.send_replace(ConnectionState::Failed {
            failure: failure.clone(),
        });
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(ConnectError::Failed { failure }));
        }
    }

    fn schedule_attempt(&mut self, attempt: u32, delay: Duration) {
        if self.reconnecting {
            self.state_tx
                .send_replace(ConnectionState::Reauthenticating { attempt });
        }
        self.phase = Phase::Backoff {
            attempt,
            timer: Box::pin(tokio::time::sleep(delay)),
        };
    }

    /// React to one socket read result while live.
    fn handle_socket_event(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => match codec::decode_server(text.as_str()) {
                Ok(server_frame) => self.handle_server_frame(server_frame),
                Err(e) => {
                    // Malformed frame: log and skip, never disconnect.
                    tracing::warn!(err = %e, "malformed frame, skipping");
                }
            },
            Some(Ok(Message::Close(_))) => {
                self.connection_lost("server closed the connection");
            }
            Some(Ok(_)) => {
                // Ping/pong/binary frames carry nothing for us.
            }
            Some(Err(e)) => {
                self.connection_lost(&format!("socket error: {e}"));
            }
            None => {
                self.connection_lost("socket stream ended");
            }
        }
    }

    /// The live socket dropped without a `disconnect()`: end the session and
    /// start the bounded reconnect cycle.
    fn connection_lost(&mut self, detail: &str) {
        tracing::warn!(detail, "connection lost; reconnecting");
        self.phase = Phase::Idle;
        self.fail_pending_requests();
        self.end_session();
        self.reconnecting = true;
        self.schedule_attempt(1, self.policy.delay_for(1));
    }

    fn handle_server_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Joined {
                room_id,
                topic,
                conversation_id,
            } => {
                let Some(reply) = self.pending_join.take() else {
                    tracing::debug!(room_id = %room_id, "joined ack with no pending join");
                    return;
                };
                self.next_epoch += 1;
                let store = Arc::new(RwLock::new(MessageStore::new()));
                self.session = Some(ActiveSession {
                    epoch: self.next_epoch,
                    room_id: room_id.clone(),
                    conversation_id: conversation_id.clone(),
                    store: Arc::clone(&store),
                    subscribers: Vec::new(),
                });
                let _ = reply.send(Ok(SessionSeed {
                    epoch: self.next_epoch,
                    room_id,
                    topic,
                    conversation_id,
                    store,
                }));
            }
            ServerFrame::History {
                room_id,
                messages,
                has_more,
            } => {
                let Some(session) = &self.session else {
                    tracing::debug!(room_id = %room_id, "history with no active session");
                    return;
                };
                if session.room_id != room_id {
                    tracing::debug!(room_id = %room_id, "history for a different room; dropping");
                    return;
                }
                session.store.write().hydrate(messages.clone());
                if let Some(reply) = self.pending_history.take() {
                    let _ = reply.send(Ok(HistoryPage { messages, has_more }));
                }
            }
            ServerFrame::Message { message } => self.handle_live_message(message),
            ServerFrame::Typing {
                room_id,
                user_id,
                display_name,
                is_typing,
            } => {
                if self.room_is_active(&room_id) {
                    self.emit(ClientEvent::Typing {
                        room_id,
                        user_id,
                        display_name,
                        is_typing,
                    });
                }
            }
            ServerFrame::UserJoined {
                room_id,
                user_id,
                display_name,
                role,
            } => {
                if self.room_is_active(&room_id) {
                    self.emit(ClientEvent::UserJoined {
                        room_id,
                        user_id,
                        display_name,
                        role,
                    });
                }
            }
            ServerFrame::UserLeft { room_id, user_id } => {
                if self.room_is_active(&room_id) {
                    self.emit(ClientEvent::UserLeft { room_id, user_id });
                }
            }
            ServerFrame::Error { message } => {
                // Attribute the fault to the oldest pending request; anything
                // else is surfaced through the event stream.
                if let Some(reply) = self.pending_join.take() {
                    let _ = reply.send(Err(JoinError::Rejected(message)));
                } else if let Some(reply) = self.pending_history.take() {
                    let _ = reply.send(Err(HistoryError::Rejected(message)));
                } else {
                    self.emit(ClientEvent::ServerError { message });
                }
            }
            ServerFrame::AuthOk { .. } | ServerFrame::AuthError { .. } => {
                tracing::debug!("auth frame outside the handshake; ignoring");
            }
        }
    }

    /// Insert a live message into the active session's store and fan it out.
    fn handle_live_message(&mut self, message: ChatMessage) {
        let Some(session) = &mut self.session else {
            tracing::debug!(room_id = %message.room_id, "message with no active session");
            return;
        };
        if message.room_id != session.room_id {
            tracing::debug!(room_id = %message.room_id, "message for a different room; dropping");
            return;
        }
        if !session.store.write().append(message.clone()) {
            // Duplicate id (already hydrated or already echoed); first wins.
            return;
        }
        session
            .subscribers
            .retain(|(id, tx)| match tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscription = *id,
                        "subscription buffer full; dropping message"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }

    /// A join supersedes the active session and any join still pending.
    async fn handle_join(
        &mut self,
        request: JoinRequest,
        reply: oneshot::Sender<Result<SessionSeed, JoinError>>,
    ) {
        let Phase::Live { sink, .. } = &mut self.phase else {
            let _ = reply.send(Err(JoinError::NotConnected));
            return;
        };

        match send_frame(sink, &ClientFrame::Join { request }).await {
            Ok(()) => {
                if let Some(stale) = self.pending_join.replace(reply) {
                    let _ = stale.send(Err(JoinError::Superseded));
                }
                self.end_session();
            }
            Err(detail) => {
                tracing::warn!(detail, "join send failed");
                let _ = reply.send(Err(JoinError::ConnectionLost));
            }
        }
    }

    async fn handle_history(
        &mut self,
        epoch: u64,
        limit: Option<usize>,
        offset: Option<usize>,
        reply: oneshot::Sender<Result<HistoryPage, HistoryError>>,
    ) {
        let Some(session) = &self.session else {
            let _ = reply.send(Err(HistoryError::SessionEnded));
            return;
        };
        if session.epoch != epoch {
            let _ = reply.send(Err(HistoryError::SessionEnded));
            return;
        }
        let room_id = session.room_id.clone();

        let Phase::Live { sink, .. } = &mut self.phase else {
            let _ = reply.send(Err(HistoryError::SessionEnded));
            return;
        };

        let frame = ClientFrame::History {
            room_id,
            limit,
            offset,
        };
        match send_frame(sink, &frame).await {
            Ok(()) => {
                if let Some(stale) = self.pending_history.replace(reply) {
                    let _ = stale.send(Err(HistoryError::Superseded));
                }
            }
            Err(detail) => {
                tracing::warn!(detail, "history send failed");
                let _ = reply.send(Err(HistoryError::ConnectionLost));
            }
        }
    }

    async fn handle_send(
        &mut self,
        epoch: u64,
        text: String,
        reply: oneshot::Sender<Result<(), SendError>>,
    ) {
        let Some(session) = &self.session else {
            let _ = reply.send(Err(SendError::SessionEnded));
            return;
        };
        if session.epoch != epoch {
            let _ = reply.send(Err(SendError::SessionEnded));
            return;
        }
        let frame = ClientFrame::Message {
            room_id: session.room_id.clone(),
            conversation_id: session.conversation_id.clone(),
            text,
        };

        let Phase::Live { sink, .. } = &mut self.phase else {
            let _ = reply.send(Err(SendError::SessionEnded));
            return;
        };

        match send_frame(sink, &frame).await {
            Ok(()) => {
                // Delivery shows up as the server echo on the subscription.
                let _ = reply.send(Ok(()));
            }
            Err(detail) => {
                tracing::warn!(detail, "message send failed");
                let _ = reply.send(Err(SendError::Transport(detail)));
            }
        }
    }

    async fn handle_typing(&mut self, epoch: u64, is_typing: bool) {
        let Some(session) = &self.session else {
            return;
        };
        if session.epoch != epoch {
            return;
        }
        let frame = ClientFrame::Typing {
            room_id: session.room_id.clone(),
            is_typing,
        };

        let Phase::Live { sink, .. } = &mut self.phase else {
            return;
        };

        // Best-effort: a lost indicator is not worth surfacing.
        if let Err(detail) = send_frame(sink, &frame).await {
            tracing::debug!(detail, "typing send failed");
        }
    }

    fn handle_subscribe(
        &mut self,
        epoch: u64,
        reply: oneshot::Sender<Result<(u64, mpsc::Receiver<ChatMessage>), SessionError>>,
    ) {
        let Some(session) = &mut self.session else {
            let _ = reply.send(Err(SessionError::Ended));
            return;
        };
        if session.epoch != epoch {
            let _ = reply.send(Err(SessionError::Ended));
            return;
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.next_subscription += 1;
        session.subscribers.push((self.next_subscription, tx));
        let _ = reply.send(Ok((self.next_subscription, rx)));
    }

    /// Close the socket if one is open. Best-effort close frame; the server
    /// also detects the TCP drop.
    async fn teardown_socket(&mut self) {
        if let Phase::Live { mut sink, .. } = std::mem::replace(&mut self.phase, Phase::Idle) {
            let _ = sink.close().await;
        }
    }

    /// Resolve in-flight join/history requests with a connection-loss error.
    fn fail_pending_requests(&mut self) {
        if let Some(reply) = self.pending_join.take() {
            let _ = reply.send(Err(JoinError::ConnectionLost));
        }
        if let Some(reply) = self.pending_history.take() {
            let _ = reply.send(Err(HistoryError::ConnectionLost));
        }
    }

    /// Tear down the active session. Dropping the subscriber senders closes
    /// every subscription stream.
    fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.emit(ClientEvent::SessionEnded {
                room_id: session.room_id,
            });
        }
    }

    fn room_is_active(&self, room_id: &RoomId) -> bool {
        self.session.as_ref().is_some_and(|s| &s.room_id == room_id)
    }

    /// Non-blocking event emission; a full channel drops the event with a
    /// warning rather than stalling the driver.
    fn emit(&self, event: ClientEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(?event, "event channel full; dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Encode and send one frame on the socket.
async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<(), String> {
    let text = codec::encode(frame).map_err(|e| e.to_string())?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}
