//! In-memory per-room message history.
//!
//! The [`HistoryStore`] keeps every accepted message in creation order and
//! serves the paged `history` request: pages are anchored at the newest
//! message, walk backwards by `offset`, and are returned oldest-first so the
//! client can prepend straight into its timeline.

use std::collections::HashMap;

use havenchat_proto::message::ChatMessage;
use havenchat_proto::room::RoomId;
use tokio::sync::RwLock;

/// Default maximum number of messages kept per room before the oldest are
/// evicted.
const DEFAULT_MAX_LOG_SIZE: usize = 1000;

/// In-memory per-room message log with oldest-first eviction.
///
/// Thread-safe via [`RwLock`]. Each room has an independent log capped at a
/// configurable maximum; when the cap is exceeded the oldest message is
/// dropped.
pub struct HistoryStore {
    logs: RwLock<HashMap<RoomId, Vec<ChatMessage>>>,
    max_log_size: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    /// Creates a new, empty store with the default per-room cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_log_size(DEFAULT_MAX_LOG_SIZE)
    }

    /// Creates a new, empty store with a custom per-room cap.
    #[must_use]
    pub fn with_max_log_size(max_log_size: usize) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            max_log_size,
        }
    }

    /// Appends an accepted message to its room's log.
    ///
    /// The gateway assigns timestamps under this store's lock discipline, so
    /// append order and `createdAt` order agree.
    pub async fn append(&self, message: ChatMessage) {
        let mut logs = self.logs.write().await;
        let log = logs.entry(message.room_id.clone()).or_default();
        log.push(message);
        if log.len() > self.max_log_size {
            log.remove(0);
        }
    }

    /// Returns one page of history for a room.
    ///
    /// `offset` counts back from the newest message; the page itself is
    /// oldest-first. The second element reports whether messages older than
    /// this page remain.
    pub async fn page(
        &self,
        room_id: &RoomId,
        limit: usize,
        offset: usize,
    ) -> (Vec<ChatMessage>, bool) {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(room_id) else {
            return (Vec::new(), false);
        };
        let end = log.len().saturating_sub(offset);
        let start = end.saturating_sub(limit);
        (log[start..end].to_vec(), start > 0)
    }

    /// Returns the number of messages stored for a room.
    pub async fn room_len(&self, room_id: &RoomId) -> usize {
        let logs = self.logs.read().await;
        logs.get(room_id).map_or(0, Vec::len)
    }
}
