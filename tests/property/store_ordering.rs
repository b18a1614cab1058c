//! Property-based tests for the client message timeline.
//!
//! Uses proptest to verify, across arbitrary interleavings of history
//! hydration and live appends:
//! 1. The timeline never holds two messages with the same id.
//! 2. The timeline is always sorted by `created_at`, ties in arrival order.
//! 3. For duplicate ids, the first-accepted payload wins.
//! 4. `hydrate` replaces previous contents entirely.
//!
//! Ids and timestamps are drawn from deliberately small pools so collisions
//! are common rather than rare.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use havenchat::store::MessageStore;
use havenchat_proto::message::{ChatMessage, MessageId, SenderInfo};
use havenchat_proto::room::{Role, RoomId, UserId};

// --- Strategies ---

const BASE_SECS: i64 = 1_700_000_000;

fn make_message(id: &str, offset_secs: i64, text: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(id),
        room_id: RoomId::from("general"),
        conversation_id: None,
        sender: SenderInfo {
            id: UserId::from("u1"),
            display_name: "Asha".to_string(),
            role: Role::Student,
            avatar_ref: None,
        },
        text: text.to_string(),
        created_at: DateTime::from_timestamp(BASE_SECS + offset_secs, 0).expect("in range"),
    }
}

/// Messages drawn from 8 ids and 16 timestamps, so duplicates and timestamp
/// ties show up in almost every case.
fn arb_message() -> impl Strategy<Value = ChatMessage> {
    (0u8..8, 0i64..16, "[a-z]{1,8}")
        .prop_map(|(id_n, offset, text)| make_message(&format!("m{id_n}"), offset, &text))
}

fn snapshot_ids(store: &MessageStore) -> Vec<String> {
    store
        .snapshot()
        .iter()
        .map(|m| m.id.as_str().to_string())
        .collect()
}

fn is_sorted(messages: &[ChatMessage]) -> bool {
    messages.windows(2).all(|w| w[0].created_at <= w[1].created_at)
}

// --- Property tests ---

proptest! {
    /// However messages arrive, each id appears at most once.
    #[test]
    fn appends_never_produce_duplicate_ids(messages in prop::collection::vec(arb_message(), 0..32)) {
        let mut store = MessageStore::new();
        let distinct: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        for message in messages.clone() {
            store.append(message);
        }

        let ids = snapshot_ids(&store);
        let unique: HashSet<&String> = ids.iter().collect();
        prop_assert_eq!(unique.len(), ids.len());
        prop_assert_eq!(ids.len(), distinct.len());
    }

    /// The timeline is sorted by `created_at` after any append sequence.
    #[test]
    fn timeline_is_always_sorted(messages in prop::collection::vec(arb_message(), 0..32)) {
        let mut store = MessageStore::new();
        for message in messages {
            store.append(message);
        }
        prop_assert!(is_sorted(&store.snapshot()));
    }

    /// When the same id arrives more than once, the first payload is kept
    /// and later copies are dropped, whatever their timestamps say.
    #[test]
    fn first_payload_wins_for_duplicate_ids(messages in prop::collection::vec(arb_message(), 0..32)) {
        let mut store = MessageStore::new();
        let mut first_seen: HashMap<&str, &ChatMessage> = HashMap::new();
        for message in &messages {
            first_seen.entry(message.id.as_str()).or_insert(message);
        }
        for message in messages.clone() {
            store.append(message);
        }

        for stored in store.snapshot() {
            let original = first_seen[stored.id.as_str()];
            prop_assert_eq!(&stored.text, &original.text);
            prop_assert_eq!(stored.created_at, original.created_at);
        }
    }

    /// `append` reports novelty: true exactly when the id is new.
    #[test]
    fn append_reports_novelty(ids in prop::collection::vec(0u8..32, 0..16)) {
        let mut store = MessageStore::new();
        let mut seen = HashSet::new();
        let mut expected_order = Vec::new();

        for n in ids {
            let id = format!("m{n}");
            // One shared timestamp: ordering falls back to arrival order.
            let accepted = store.append(make_message(&id, 0, "same tick"));
            prop_assert_eq!(accepted, seen.insert(id.clone()));
            if accepted {
                expected_order.push(id);
            }
        }

        // Equal timestamps never reshuffle: snapshot order is arrival order.
        prop_assert_eq!(snapshot_ids(&store), expected_order);
    }

    /// Hydrating a page and then appending live traffic yields one clean
    /// timeline: unique ids, sorted, covering both sources exactly once.
    #[test]
    fn hydrate_then_append_yields_one_clean_timeline(
        page in prop::collection::vec(arb_message(), 0..24),
        live in prop::collection::vec(arb_message(), 0..24),
    ) {
        let mut store = MessageStore::new();
        store.hydrate(page.clone());
        for message in live.clone() {
            store.append(message);
        }

        let snapshot = store.snapshot();
        let ids: HashSet<&str> = snapshot.iter().map(|m| m.id.as_str()).collect();
        prop_assert_eq!(ids.len(), snapshot.len());
        prop_assert!(is_sorted(&snapshot));

        let mut expected: HashSet<&str> = page.iter().map(|m| m.id.as_str()).collect();
        expected.extend(live.iter().map(|m| m.id.as_str()));
        prop_assert_eq!(snapshot.len(), expected.len());
    }

    /// A history page replaces whatever the timeline held before.
    #[test]
    fn hydrate_replaces_previous_contents(
        before in prop::collection::vec(arb_message(), 0..12),
        page in prop::collection::vec(arb_message(), 0..12),
    ) {
        let mut store = MessageStore::new();
        for message in before {
            store.append(message);
        }
        store.hydrate(page.clone());

        let snapshot = store.snapshot();
        let got: HashSet<&str> = snapshot.iter().map(|m| m.id.as_str()).collect();
        let expected: HashSet<&str> = page.iter().map(|m| m.id.as_str()).collect();
        prop_assert_eq!(got, expected);
        prop_assert!(is_sorted(&snapshot));
    }
}
