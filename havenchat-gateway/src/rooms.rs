//! Room membership directory for the gateway.
//!
//! Tracks which users are currently in which rooms, and the conversation
//! record attached to each private room. Rooms come into existence when the
//! first member joins and disappear when the last member leaves.
//!
//! Everything here is ephemeral — lost on gateway restart, same as the
//! connection registry.

use std::collections::{HashMap, HashSet};

use havenchat_proto::room::{ConversationId, Namespace, RoomId, UserId};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A live room: the namespace it belongs to and its current members.
#[derive(Debug, Clone)]
pub struct RoomEntry {
    /// Namespace the room was created under.
    pub namespace: Namespace,
    /// Users currently in the room.
    pub members: HashSet<UserId>,
}

/// In-memory directory of live rooms and private-conversation records.
///
/// Thread-safe via [`RwLock`]. Conversation records outlive room membership:
/// once a user pair has a conversation id, rejoining the same pair resumes it.
pub struct RoomDirectory {
    rooms: RwLock<HashMap<RoomId, RoomEntry>>,
    conversations: RwLock<HashMap<RoomId, ConversationId>>,
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomDirectory {
    /// Creates a new, empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a user to a room, creating the room on first join.
    ///
    /// Returns `true` if the user was not already a member.
    pub async fn join(&self, room_id: &RoomId, namespace: Namespace, user_id: &UserId) -> bool {
        let mut rooms = self.rooms.write().await;
        let entry = rooms.entry(room_id.clone()).or_insert_with(|| RoomEntry {
            namespace,
            members: HashSet::new(),
        });
        entry.members.insert(user_id.clone())
    }

    /// Removes a user from every room they are in.
    ///
    /// Returns the rooms the user was a member of, so the caller can announce
    /// the departure. Rooms left empty are dropped.
    pub async fn leave_all(&self, user_id: &UserId) -> Vec<RoomId> {
        let mut rooms = self.rooms.write().await;
        let mut affected = Vec::new();
        rooms.retain(|room_id, entry| {
            if entry.members.remove(user_id) {
                affected.push(room_id.clone());
            }
            !entry.members.is_empty()
        });
        drop(rooms);
        affected
    }

    /// Returns whether a user is currently in a room.
    pub async fn is_member(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .is_some_and(|entry| entry.members.contains(user_id))
    }

    /// Returns the current members of a room.
    pub async fn members(&self, room_id: &RoomId) -> Vec<UserId> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|entry| entry.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the full entry for a room, if it is live.
    pub async fn entry(&self, room_id: &RoomId) -> Option<RoomEntry> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).cloned()
    }

    /// Returns the conversation record for a private room, creating it on
    /// first use.
    ///
    /// The same room id always resolves to the same conversation, so a user
    /// pair that disconnects and rejoins resumes where they left off.
    pub async fn conversation_for(&self, room_id: &RoomId) -> ConversationId {
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(room_id.clone())
            .or_insert_with(|| ConversationId::from(format!("conv-{}", Uuid::new_v4())))
            .clone()
    }
}
