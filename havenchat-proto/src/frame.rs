//! Wire frames exchanged between client and gateway.
//!
//! Every WebSocket text frame is one JSON object carrying an `event` tag and
//! the event's payload fields inline. [`ClientFrame`] covers everything a
//! client may send, [`ServerFrame`] everything the gateway may push.
//!
//! The first frame on a fresh socket must be [`ClientFrame::Auth`]; the
//! gateway answers with [`ServerFrame::AuthOk`] or [`ServerFrame::AuthError`]
//! and closes the socket in the error case.

use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;
use crate::room::{ConversationId, Role, RoomId, UserId};

/// History page size applied when the client does not ask for one.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Largest history page the gateway will serve.
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Resolves a requested history page size to the one the gateway will use.
///
/// `None` falls back to [`DEFAULT_HISTORY_LIMIT`]; explicit requests are
/// clamped to `1..=`[`MAX_HISTORY_LIMIT`].
#[must_use]
pub fn clamp_history_limit(requested: Option<usize>) -> usize {
    requested.map_or(DEFAULT_HISTORY_LIMIT, |n| n.clamp(1, MAX_HISTORY_LIMIT))
}

/// Target of a join: a peer-support topic room or a private conversation.
///
/// Serialized untagged, so the two shapes are told apart by their fields:
/// `{"topic": ...}` versus `{"recipientId": ..., "recipientRole": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinRequest {
    /// Join a shared topic room such as `anxiety`.
    Topic {
        /// Topic room name, one of [`crate::room::PEER_TOPICS`].
        topic: String,
    },
    /// Open (or resume) a one-to-one conversation with another user.
    #[serde(rename_all = "camelCase")]
    Private {
        /// The other participant.
        recipient_id: UserId,
        /// The other participant's role, used for conversation records.
        recipient_role: Role,
    },
}

/// Why authentication was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthErrorCode {
    /// The socket token was valid once but its lifetime has passed.
    TokenExpired,
    /// The token was never issued or is malformed.
    TokenInvalid,
    /// No token was presented at all.
    TokenMissing,
}

impl AuthErrorCode {
    /// Whether fetching a fresh token and retrying can possibly succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TokenExpired)
    }
}

/// Frames a client sends to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientFrame {
    /// First frame on every socket: present the single-use socket token.
    Auth {
        /// Token obtained from `POST /auth/socket-token`.
        token: String,
    },
    /// Enter a room. The gateway answers with [`ServerFrame::Joined`].
    Join {
        /// What to join.
        #[serde(flatten)]
        request: JoinRequest,
    },
    /// Request a page of history for a joined room.
    #[serde(rename_all = "camelCase")]
    History {
        /// Room to page through.
        room_id: RoomId,
        /// Page size, clamped by the gateway. Defaults to
        /// [`DEFAULT_HISTORY_LIMIT`].
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        /// How many messages to skip, counted back from the newest.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<usize>,
    },
    /// Send a chat message to a room.
    #[serde(rename_all = "camelCase")]
    Message {
        /// Room to deliver to.
        room_id: RoomId,
        /// Conversation record, required for private rooms.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        /// Message body. Subject to [`crate::message::MAX_MESSAGE_LEN`].
        text: String,
    },
    /// Report that this user started or stopped composing.
    #[serde(rename_all = "camelCase")]
    Typing {
        /// Room the indicator applies to.
        room_id: RoomId,
        /// `true` while composing, `false` once idle.
        is_typing: bool,
    },
}

/// Frames the gateway pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerFrame {
    /// The socket token was accepted; the connection is live.
    #[serde(rename_all = "camelCase")]
    AuthOk {
        /// Authenticated user.
        user_id: UserId,
        /// Display name bound to the token.
        display_name: String,
        /// Platform role bound to the token.
        role: Role,
    },
    /// The socket token was rejected; the gateway closes the socket next.
    AuthError {
        /// Machine-readable rejection reason.
        code: AuthErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// A join succeeded.
    #[serde(rename_all = "camelCase")]
    Joined {
        /// Canonical id of the room that was joined.
        room_id: RoomId,
        /// Topic name, present for topic rooms.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        /// Conversation record, present for private rooms.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },
    /// One page of room history, oldest first.
    #[serde(rename_all = "camelCase")]
    History {
        /// Room the page belongs to.
        room_id: RoomId,
        /// Messages in ascending `createdAt` order.
        messages: Vec<ChatMessage>,
        /// Whether older messages remain beyond this page.
        has_more: bool,
    },
    /// A new message accepted by the gateway, echoed to every participant
    /// including the sender.
    Message {
        /// The accepted message.
        #[serde(flatten)]
        message: ChatMessage,
    },
    /// Another participant started or stopped composing.
    #[serde(rename_all = "camelCase")]
    Typing {
        /// Room the indicator applies to.
        room_id: RoomId,
        /// Who is composing.
        user_id: UserId,
        /// Their display name.
        display_name: String,
        /// `true` while composing, `false` once idle.
        is_typing: bool,
    },
    /// Another participant entered the room.
    #[serde(rename_all = "camelCase")]
    UserJoined {
        /// Room they entered.
        room_id: RoomId,
        /// Who joined.
        user_id: UserId,
        /// Their display name.
        display_name: String,
        /// Their platform role.
        role: Role,
    },
    /// Another participant left the room.
    #[serde(rename_all = "camelCase")]
    UserLeft {
        /// Room they left.
        room_id: RoomId,
        /// Who left.
        user_id: UserId,
    },
    /// The gateway rejected the client's last request.
    Error {
        /// Human-readable reason.
        message: String,
    },
}
