//! Socket-token provisioning types.
//!
//! Connecting is a two-step dance: the client first calls
//! `POST` [`SOCKET_TOKEN_PATH`] over HTTP (authenticated by the platform
//! session), receives a short-lived single-use token, and presents that token
//! in the first WebSocket frame. Tokens expire within seconds, so a fresh one
//! is fetched before every connection attempt.

use serde::{Deserialize, Serialize};

use crate::room::{Role, UserId};

/// HTTP path that issues socket tokens.
pub const SOCKET_TOKEN_PATH: &str = "/auth/socket-token";

/// Header carrying the caller's user id on token requests.
pub const HEADER_USER_ID: &str = "x-user-id";

/// Header carrying the caller's display name on token requests.
pub const HEADER_USER_NAME: &str = "x-user-name";

/// Header carrying the caller's role on token requests.
pub const HEADER_USER_ROLE: &str = "x-user-role";

/// Body of a successful `POST /auth/socket-token` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Always `true` on the success path.
    pub success: bool,
    /// The single-use socket token to present in the auth frame.
    #[serde(rename = "socketToken")]
    pub socket_token: String,
}

/// The identity a socket token was issued for.
///
/// The gateway binds this to the token at issue time and hands it back when
/// the token is redeemed, so the WebSocket layer never re-authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    /// Platform user id.
    pub user_id: UserId,
    /// Name to show other participants.
    pub display_name: String,
    /// Platform role.
    pub role: Role,
}
