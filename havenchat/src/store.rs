//! Client-side message timeline for one room session.
//!
//! The [`MessageStore`] owns what the UI renders: messages ordered by
//! `createdAt` ascending, with arrival order breaking ties, and duplicates
//! (by message id) dropped on arrival. History pages land via
//! [`MessageStore::hydrate`]; live traffic lands via [`MessageStore::append`].

use std::collections::HashSet;

use havenchat_proto::message::{ChatMessage, MessageId};

/// Ordered, deduplicated message timeline.
///
/// Ordering is by `created_at` ascending. Two messages with the same
/// timestamp keep their arrival order, so the timeline never reshuffles
/// under the reader's eyes.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
    seen: HashSet<MessageId>,
}

impl MessageStore {
    /// Creates an empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the timeline with a history page.
    ///
    /// The page is re-sorted and deduplicated on the way in, so a server that
    /// sends overlapping or unordered pages still yields a clean timeline.
    pub fn hydrate(&mut self, messages: Vec<ChatMessage>) {
        self.messages.clear();
        self.seen.clear();
        for message in messages {
            self.append(message);
        }
    }

    /// Inserts one live message, keeping the timeline sorted.
    ///
    /// Returns `false` if a message with the same id was already present; the
    /// first arrival wins and the duplicate is dropped.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id.clone()) {
            return false;
        }
        // Partition point keeps equal timestamps in arrival order.
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
        true
    }

    /// Returns a copy of the current timeline, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    /// Number of messages in the timeline.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the timeline holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drops every message.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.seen.clear();
    }
}
