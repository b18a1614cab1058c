//! Socket-token issuing and redemption.
//!
//! The [`TokenIssuer`] backs the `POST /auth/socket-token` route: it mints a
//! short-lived single-use token bound to the caller's identity, and redeems
//! that token exactly once when the WebSocket auth frame arrives. Tokens are
//! ephemeral, in memory only, and lost on gateway restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use havenchat_proto::auth::UserIdentity;
use havenchat_proto::frame::AuthErrorCode;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

/// Default token lifetime. Tokens are meant to be redeemed immediately after
/// issue, so the window is short.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30);

/// A token waiting to be redeemed.
#[derive(Debug, Clone)]
struct IssuedToken {
    identity: UserIdentity,
    issued_at: Instant,
}

/// In-memory single-use token table.
///
/// Thread-safe via [`RwLock`]. The lifetime is adjustable at runtime so test
/// setups can force the expired path deterministically.
pub struct TokenIssuer {
    pending: RwLock<HashMap<String, IssuedToken>>,
    ttl: RwLock<Duration>,
    issued: AtomicU64,
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenIssuer {
    /// Creates a new issuer with the default token lifetime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TOKEN_TTL)
    }

    /// Creates a new issuer with a custom token lifetime.
    ///
    /// A lifetime of zero makes every token expire on arrival, which is how
    /// tests exercise the expired-credential path.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            ttl: RwLock::new(ttl),
            issued: AtomicU64::new(0),
        }
    }

    /// Mints a token bound to `identity` and returns it.
    pub async fn issue(&self, identity: UserIdentity) -> String {
        let token = Uuid::new_v4().to_string();
        let mut pending = self.pending.write().await;
        pending.insert(
            token.clone(),
            IssuedToken {
                identity,
                issued_at: Instant::now(),
            },
        );
        drop(pending);
        self.issued.fetch_add(1, Ordering::Relaxed);
        token
    }

    /// Redeems a token, consuming it.
    ///
    /// A token redeems successfully at most once; expired and already-used
    /// tokens are removed from the table either way.
    ///
    /// # Errors
    ///
    /// Returns [`AuthErrorCode::TokenMissing`] for an empty token,
    /// [`AuthErrorCode::TokenInvalid`] for one that was never issued (or was
    /// already used), and [`AuthErrorCode::TokenExpired`] for one whose
    /// lifetime has passed.
    pub async fn redeem(&self, token: &str) -> Result<UserIdentity, AuthErrorCode> {
        if token.is_empty() {
            return Err(AuthErrorCode::TokenMissing);
        }
        let ttl = *self.ttl.read().await;
        let mut pending = self.pending.write().await;
        let Some(issued) = pending.remove(token) else {
            return Err(AuthErrorCode::TokenInvalid);
        };
        drop(pending);
        if issued.issued_at.elapsed() >= ttl {
            return Err(AuthErrorCode::TokenExpired);
        }
        Ok(issued.identity)
    }

    /// Changes the lifetime applied to redemptions from now on.
    ///
    /// Affects already-issued tokens too, since expiry is checked at redeem
    /// time.
    pub async fn set_ttl(&self, ttl: Duration) {
        *self.ttl.write().await = ttl;
    }

    /// Total number of tokens issued since startup.
    ///
    /// Lets tests assert that a client fetched a fresh token per connection
    /// attempt.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}
