//! Room, participant, and namespace types shared by client and gateway.
//!
//! Rooms come in two flavors: shared topic rooms on the peer namespace
//! (identified by a well-known topic string) and private conversations on the
//! private-chat namespace (identified by the sorted pair of participant ids).

use serde::{Deserialize, Serialize};

/// Topics served by the peer namespace.
///
/// Joining a topic outside this list is rejected by the gateway with an
/// `error` event.
pub const PEER_TOPICS: [&str; 6] = [
    "general",
    "anxiety",
    "depression",
    "sleep",
    "exam",
    "relationships",
];

/// Returns `true` if `topic` is one of the well-known peer topics.
#[must_use]
pub fn is_known_topic(topic: &str) -> bool {
    PEER_TOPICS.contains(&topic)
}

/// Opaque identifier for a platform user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user id from its string form.
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

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifies a room: the topic string for topic rooms, or the sorted
/// participant pair for private conversations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Creates a room id from its string form.
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

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifies a private conversation record on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Creates a conversation id from its string form.
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

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Platform role attached to every participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A student seeking support.
    Student,
    /// A professional counsellor.
    Counsellor,
    /// A trained peer volunteer.
    Volunteer,
    /// A platform administrator.
    Admin,
}

impl Role {
    /// Returns the role's lowercase wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Counsellor => "counsellor",
            Self::Volunteer => "volunteer",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Self::Student),
            "counsellor" => Ok(Self::Counsellor),
            "volunteer" => Ok(Self::Volunteer),
            "admin" => Ok(Self::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized role name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

/// Logical partition of the realtime transport.
///
/// Each namespace has its own URL path and independent connection lifecycle:
/// topic rooms live on `/peer`, one-to-one conversations on `/private-chat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Namespace {
    /// Shared topic rooms.
    #[default]
    Peer,
    /// Private one-to-one conversations.
    PrivateChat,
}

impl Namespace {
    /// Returns the namespace's URL path segment.
    #[must_use]
    pub const fn path(&self) -> &'static str {
        match self {
            Self::Peer => "/peer",
            Self::PrivateChat => "/private-chat",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peer => f.write_str("peer"),
            Self::PrivateChat => f.write_str("private-chat"),
        }
    }
}

impl std::str::FromStr for Namespace {
    type Err = UnknownNamespace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "peer" => Ok(Self::Peer),
            "private-chat" => Ok(Self::PrivateChat),
            other => Err(UnknownNamespace(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized namespace name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown namespace: {0} (expected \"peer\" or \"private-chat\")")]
pub struct UnknownNamespace(pub String);

/// Derives the private room id for a pair of participants.
///
/// The two user ids are sorted and joined with `-`, so both sides of a
/// conversation compute the same room independently of who initiated it.
#[must_use]
pub fn private_room_id(a: &UserId, b: &UserId) -> RoomId {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    RoomId::new(format!("{first}-{second}"))
}
