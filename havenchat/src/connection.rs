//! Connection lifecycle: authenticated socket establishment and the
//! reconnect policy.
//!
//! [`establish`] is the one code path for opening an authenticated socket —
//! initial connects and reconnects both run through it, so the two can never
//! diverge. Each call fetches a fresh single-use token, opens the WebSocket
//! for the requested namespace, sends the `auth` frame, and waits for the
//! server's verdict.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use havenchat_proto::auth::UserIdentity;
use havenchat_proto::codec;
use havenchat_proto::frame::{AuthErrorCode, ClientFrame, ServerFrame};
use havenchat_proto::room::Namespace;

use crate::auth::{TokenFetchError, TokenProvider};

/// Type alias for the write half of a WebSocket connection.
pub(crate) type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
pub(crate) type WsStream =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Timeout for the token REST call.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for opening the WebSocket connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for the `authOk` / `authError` verdict.
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Observable connection lifecycle state.
///
/// Owned exclusively by the client driver and published through a
/// `tokio::sync::watch` channel; transitions are the only way observers
/// learn of connectivity changes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection, and none being attempted.
    #[default]
    Disconnected,
    /// An initial `connect()` is in progress (including retries).
    Connecting,
    /// Authenticated and live.
    Connected,
    /// The connection dropped unexpectedly; a bounded reconnect cycle is
    /// running. `attempt` is the attempt about to run or running, 1-based.
    Reauthenticating {
        /// The reconnect attempt number, 1-based.
        attempt: u32,
    },
    /// The attempt budget is exhausted or the failure is non-retryable.
    /// Terminal until the next `connect()`.
    Failed {
        /// The categorized failure, for user-facing display.
        failure: ConnectFailure,
    },
}

impl ConnectionState {
    /// Whether the client currently holds a live, authenticated socket.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// User-facing failure category carried by [`ConnectionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectFailure {
    /// The token REST call kept failing.
    #[error("could not reach the authentication service: {detail}")]
    TokenFetch {
        /// Description of the last fetch failure.
        detail: String,
    },

    /// Every refreshed token was rejected as expired.
    #[error("session credential expired")]
    ExpiredCredential,

    /// The gateway rejected the credential outright.
    #[error("authentication failed: {detail}")]
    InvalidCredential {
        /// The server's rejection message.
        detail: String,
    },

    /// Transport-level failure (refused, timed out, dropped).
    #[error("connection problem: {detail}")]
    Network {
        /// Description of the last transport failure.
        detail: String,
    },
}

/// Bounded exponential backoff for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum attempts per connect/reconnect cycle.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the doubled delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based): `initial_delay` doubled per
    /// attempt, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_delay
            .saturating_mul(2_u32.saturating_pow(doublings));
        delay.min(self.max_delay)
    }
}

/// Failure of a single [`establish`] attempt, classified for retry handling.
#[derive(Debug, thiserror::Error)]
pub enum EstablishError {
    /// The token REST call failed.
    #[error("token fetch failed: {0}")]
    TokenFetch(#[from] TokenFetchError),

    /// The gateway rejected the token as expired.
    #[error("socket token expired")]
    ExpiredCredential,

    /// The gateway rejected the token as invalid or missing.
    #[error("credential rejected: {0}")]
    InvalidCredential(String),

    /// The gateway URL could not be parsed.
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),

    /// Transport-level failure.
    #[error("network failure: {0}")]
    Network(String),
}

impl EstablishError {
    /// Whether retrying cannot help (bad credential, bad URL).
    #[must_use]
    pub(crate) const fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidCredential(_) | Self::InvalidUrl(_))
    }

    /// Whether the next attempt should run without a backoff delay.
    ///
    /// True only for expired credentials: the fix (a fresh token) is known,
    /// so waiting gains nothing. The attempt still consumes budget.
    #[must_use]
    pub(crate) const fn retries_immediately(&self) -> bool {
        matches!(self, Self::ExpiredCredential)
    }

    /// Convert into the user-facing failure category.
    pub(crate) fn into_failure(self) -> ConnectFailure {
        match self {
            Self::TokenFetch(e) => ConnectFailure::TokenFetch {
                detail: e.to_string(),
            },
            Self::ExpiredCredential => ConnectFailure::ExpiredCredential,
            Self::InvalidCredential(detail) => ConnectFailure::InvalidCredential { detail },
            Self::InvalidUrl(detail) => ConnectFailure::Network {
                detail: format!("invalid gateway url: {detail}"),
            },
            Self::Network(detail) => ConnectFailure::Network { detail },
        }
    }
}

/// An authenticated socket, split and ready for the driver.
#[derive(Debug)]
pub(crate) struct EstablishedConnection {
    /// Write half.
    pub(crate) sink: WsSink,
    /// Read half.
    pub(crate) stream: WsStream,
    /// Identity attested by the server's `authOk`.
    pub(crate) identity: UserIdentity,
}

/// Open and authenticate one socket to `gateway_url` on `namespace`.
///
/// Performs the following steps:
/// 1. Fetches a fresh single-use token (10s timeout) — tokens are never
///    reused across attempts.
/// 2. Opens the WebSocket to the namespace endpoint (10s timeout).
/// 3. Sends the `auth` frame as the first frame.
/// 4. Waits for the `authOk` / `authError` verdict (5s timeout).
pub(crate) async fn establish<P: TokenProvider>(
    provider: &P,
    gateway_url: &str,
    namespace: Namespace,
) -> Result<EstablishedConnection, EstablishError> {
    // Step 1: Fetch a fresh token.
    let token = tokio::time::timeout(TOKEN_TIMEOUT, provider.fetch_token())
        .await
        .map_err(|_| {
            tracing::warn!("token fetch timed out");
            EstablishError::TokenFetch(TokenFetchError::TimedOut)
        })?
        .map_err(|e| {
            tracing::warn!(err = %e, "token fetch failed");
            EstablishError::TokenFetch(e)
        })?;

    // Step 2: Open the WebSocket to the namespace path with a timeout.
    let endpoint = url::Url::parse(gateway_url)
        .and_then(|base| base.join(namespace.path()))
        .map_err(|e| EstablishError::InvalidUrl(e.to_string()))?;

    let (ws_stream, _response) =
        tokio::time::timeout(CONNECT_TIMEOUT, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(url = %endpoint, "WebSocket connect timed out");
                EstablishError::Network("connect timed out".to_string())
            })?
            .map_err(|e| {
                tracing::warn!(url = %endpoint, err = %e, "WebSocket connect failed");
                EstablishError::Network(describe_ws_error(&e))
            })?;

    // Step 3: Split and send the auth frame.
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let auth = codec::encode(&ClientFrame::Auth { token })
        .map_err(|e| EstablishError::Network(format!("failed to encode auth frame: {e}")))?;
    ws_sink
        .send(Message::Text(auth.into()))
        .await
        .map_err(|e| {
            tracing::warn!(err = %e, "failed to send auth frame");
            EstablishError::Network(format!("failed to send auth frame: {e}"))
        })?;

    // Step 4: Wait for the auth verdict with a timeout.
    let identity = tokio::time::timeout(AUTH_TIMEOUT, wait_for_auth_verdict(&mut ws_stream))
        .await
        .map_err(|_| {
            tracing::warn!(url = %endpoint, "authentication verdict timed out");
            EstablishError::Network("authentication verdict timed out".to_string())
        })??;

    tracing::info!(
        user_id = %identity.user_id,
        namespace = %namespace,
        "socket authenticated"
    );

    Ok(EstablishedConnection {
        sink: ws_sink,
        stream: ws_stream,
        identity,
    })
}

/// Read frames until the server delivers `authOk` or `authError`.
///
/// Ping/pong and binary frames are skipped; a close, stream end, or
/// undecodable frame fails the handshake.
async fn wait_for_auth_verdict(ws_stream: &mut WsStream) -> Result<UserIdentity, EstablishError> {
    loop {
        match ws_stream.next().await {
            Some(Ok(Message::Text(text))) => match codec::decode_server(text.as_str()) {
                Ok(ServerFrame::AuthOk {
                    user_id,
                    display_name,
                    role,
                }) => {
                    return Ok(UserIdentity {
                        user_id,
                        display_name,
                        role,
                    });
                }
                Ok(ServerFrame::AuthError { code, message }) => {
                    tracing::warn!(code = ?code, message = %message, "authentication rejected");
                    return Err(match code {
                        AuthErrorCode::TokenExpired => EstablishError::ExpiredCredential,
                        AuthErrorCode::TokenInvalid | AuthErrorCode::TokenMissing => {
                            EstablishError::InvalidCredential(message)
                        }
                    });
                }
                Ok(other) => {
                    tracing::warn!(?other, "unexpected frame during authentication");
                    return Err(EstablishError::Network(
                        "unexpected frame during authentication".to_string(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed frame during authentication");
                    return Err(EstablishError::Network(format!(
                        "malformed authentication verdict: {e}"
                    )));
                }
            },
            Some(Ok(Message::Close(_))) => {
                tracing::warn!("server closed the connection during authentication");
                return Err(EstablishError::Network(
                    "server closed the connection during authentication".to_string(),
                ));
            }
            Some(Ok(_)) => {
                // Ping/pong/binary frames are not part of the handshake.
            }
            Some(Err(e)) => {
                return Err(EstablishError::Network(format!(
                    "socket error during authentication: {e}"
                )));
            }
            None => {
                return Err(EstablishError::Network(
                    "socket stream ended during authentication".to_string(),
                ));
            }
        }
    }
}

/// Describe a `tokio_tungstenite` connection error for the failure detail.
fn describe_ws_error(err: &tokio_tungstenite::tungstenite::Error) -> String {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                format!("gateway unreachable: {io_err}")
            } else {
                io_err.to_string()
            }
        }
        WsError::Tls(_) => format!("TLS error: {err}"),
        WsError::Http(response) => format!("gateway HTTP error: status {}", response.status()),
        other => format!("connection error: {other}"),
    }
}
