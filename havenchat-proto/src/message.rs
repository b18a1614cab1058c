//! Chat message wire types for the `HavenChat` protocol.
//!
//! A [`ChatMessage`] is created by the gateway when it accepts a send: the
//! gateway assigns the id and `createdAt` timestamp and broadcasts the full
//! message to every room participant, including the sender. Clients never
//! fabricate messages locally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::room::{ConversationId, Role, RoomId, UserId};

/// Maximum message length in characters.
///
/// Matches the platform limit; the client rejects longer text before sending
/// and the gateway enforces the same bound.
pub const MAX_MESSAGE_LEN: usize = 2000;

/// Unique identifier for a message, assigned by the gateway.
///
/// Opaque to clients; the gateway mints time-ordered UUID v7 values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Mints a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Creates a `MessageId` from its string form.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Who sent a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    /// The sender's user id.
    pub id: UserId,
    /// Name shown next to the message.
    pub display_name: String,
    /// The sender's platform role.
    pub role: Role,
    /// Optional avatar reference (profile image URL or asset id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

/// A chat message as broadcast by the gateway.
///
/// Immutable once created. Ordering key is `created_at` ascending; ties are
/// broken by arrival order on the client side (timestamps have finite
/// resolution, so two messages can share one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Gateway-assigned unique id.
    pub id: MessageId,
    /// The room this message belongs to.
    pub room_id: RoomId,
    /// The conversation record, present for private sessions only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Who sent it.
    pub sender: SenderInfo,
    /// Message body.
    pub text: String,
    /// When the gateway accepted the message.
    pub created_at: DateTime<Utc>,
}

/// Error returned when outgoing text fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    /// Text is empty (or whitespace only) after trimming.
    #[error("message text is empty")]
    Empty,
    /// Text exceeds [`MAX_MESSAGE_LEN`].
    #[error("message too long ({len} chars, max {max})")]
    TooLong {
        /// Actual length in characters.
        len: usize,
        /// Maximum allowed length in characters.
        max: usize,
    },
}

/// Validates outgoing message text.
///
/// # Errors
///
/// Returns [`TextError::Empty`] if the text is empty after trimming, or
/// [`TextError::TooLong`] if it exceeds [`MAX_MESSAGE_LEN`] characters.
pub fn validate_text(text: &str) -> Result<(), TextError> {
    if text.trim().is_empty() {
        return Err(TextError::Empty);
    }
    let len = text.chars().count();
    if len > MAX_MESSAGE_LEN {
        return Err(TextError::TooLong {
            len,
            max: MAX_MESSAGE_LEN,
        });
    }
    Ok(())
}

/// Strips control characters from message text, preserving newlines.
///
/// The gateway applies this to every accepted message before storing and
/// broadcasting it.
#[must_use]
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect()
}
