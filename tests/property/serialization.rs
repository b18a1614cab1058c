//! Property-based wire-protocol tests.
//!
//! Uses proptest to verify:
//! 1. Any valid `ClientFrame` survives an encode → decode round-trip.
//! 2. Any valid `ServerFrame` survives an encode → decode round-trip.
//! 3. Every encoded frame carries the `event` tag.
//! 4. Arbitrary text never panics the decoders (they return `Err` gracefully).
//! 5. `clamp_history_limit` always lands inside the served range.

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use havenchat_proto::codec;
use havenchat_proto::frame::{
    AuthErrorCode, ClientFrame, DEFAULT_HISTORY_LIMIT, JoinRequest, MAX_HISTORY_LIMIT,
    ServerFrame, clamp_history_limit,
};
use havenchat_proto::message::{ChatMessage, MessageId, SenderInfo};
use havenchat_proto::room::{ConversationId, Role, RoomId, UserId};

// --- Strategies for protocol types ---

/// Strategy for generating arbitrary `UserId` values.
fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[a-z0-9-]{1,24}".prop_map(UserId::from)
}

/// Strategy for generating arbitrary `RoomId` values.
fn arb_room_id() -> impl Strategy<Value = RoomId> {
    "[a-z0-9-]{1,32}".prop_map(RoomId::from)
}

/// Strategy for generating arbitrary `ConversationId` values.
fn arb_conversation_id() -> impl Strategy<Value = ConversationId> {
    "conv-[a-f0-9]{8,32}".prop_map(ConversationId::from)
}

/// Strategy for generating arbitrary `MessageId` values.
fn arb_message_id() -> impl Strategy<Value = MessageId> {
    "[a-f0-9-]{1,36}".prop_map(MessageId::from)
}

/// Strategy covering every platform role.
fn arb_role() -> impl Strategy<Value = Role> {
    prop_oneof![
        Just(Role::Student),
        Just(Role::Counsellor),
        Just(Role::Volunteer),
        Just(Role::Admin),
    ]
}

/// Strategy covering every auth rejection code.
fn arb_auth_error_code() -> impl Strategy<Value = AuthErrorCode> {
    prop_oneof![
        Just(AuthErrorCode::TokenExpired),
        Just(AuthErrorCode::TokenInvalid),
        Just(AuthErrorCode::TokenMissing),
    ]
}

/// Strategy for timestamps with full nanosecond precision.
fn arb_created_at() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_102_444_800i64, 0u32..1_000_000_000u32)
        .prop_map(|(secs, nanos)| DateTime::from_timestamp(secs, nanos).expect("in range"))
}

/// Strategy for generating arbitrary `SenderInfo` values.
fn arb_sender() -> impl Strategy<Value = SenderInfo> {
    (
        arb_user_id(),
        "[^\x00]{1,32}",
        arb_role(),
        prop::option::of("[!-~]{1,64}"),
    )
        .prop_map(|(id, display_name, role, avatar_ref)| SenderInfo {
            id,
            display_name,
            role,
            avatar_ref,
        })
}

/// Strategy for generating arbitrary `ChatMessage` values.
fn arb_chat_message() -> impl Strategy<Value = ChatMessage> {
    (
        arb_message_id(),
        arb_room_id(),
        prop::option::of(arb_conversation_id()),
        arb_sender(),
        "[^\x00]{1,256}",
        arb_created_at(),
    )
        .prop_map(
            |(id, room_id, conversation_id, sender, text, created_at)| ChatMessage {
                id,
                room_id,
                conversation_id,
                sender,
                text,
                created_at,
            },
        )
}

/// Strategy for both join shapes, topic and private.
fn arb_join_request() -> impl Strategy<Value = JoinRequest> {
    prop_oneof![
        "[a-z]{1,16}".prop_map(|topic| JoinRequest::Topic { topic }),
        (arb_user_id(), arb_role()).prop_map(|(recipient_id, recipient_role)| {
            JoinRequest::Private {
                recipient_id,
                recipient_role,
            }
        }),
    ]
}

/// Strategy for generating arbitrary `ClientFrame` values.
fn arb_client_frame() -> impl Strategy<Value = ClientFrame> {
    prop_oneof![
        "[A-Za-z0-9+/=]{8,64}".prop_map(|token| ClientFrame::Auth { token }),
        arb_join_request().prop_map(|request| ClientFrame::Join { request }),
        (
            arb_room_id(),
            prop::option::of(0usize..10_000),
            prop::option::of(0usize..10_000),
        )
            .prop_map(|(room_id, limit, offset)| ClientFrame::History {
                room_id,
                limit,
                offset,
            }),
        (
            arb_room_id(),
            prop::option::of(arb_conversation_id()),
            "[^\x00]{1,256}",
        )
            .prop_map(|(room_id, conversation_id, text)| ClientFrame::Message {
                room_id,
                conversation_id,
                text,
            }),
        (arb_room_id(), any::<bool>())
            .prop_map(|(room_id, is_typing)| ClientFrame::Typing { room_id, is_typing }),
    ]
}

/// Strategy for generating arbitrary `ServerFrame` values.
fn arb_server_frame() -> impl Strategy<Value = ServerFrame> {
    prop_oneof![
        (arb_user_id(), "[^\x00]{1,32}", arb_role()).prop_map(
            |(user_id, display_name, role)| ServerFrame::AuthOk {
                user_id,
                display_name,
                role,
            }
        ),
        (arb_auth_error_code(), "[^\x00]{1,64}")
            .prop_map(|(code, message)| ServerFrame::AuthError { code, message }),
        (
            arb_room_id(),
            prop::option::of("[a-z]{1,16}"),
            prop::option::of(arb_conversation_id()),
        )
            .prop_map(|(room_id, topic, conversation_id)| ServerFrame::Joined {
                room_id,
                topic,
                conversation_id,
            }),
        (
            arb_room_id(),
            prop::collection::vec(arb_chat_message(), 0..4),
            any::<bool>(),
        )
            .prop_map(|(room_id, messages, has_more)| ServerFrame::History {
                room_id,
                messages,
                has_more,
            }),
        arb_chat_message().prop_map(|message| ServerFrame::Message { message }),
        (arb_room_id(), arb_user_id(), "[^\x00]{1,32}", any::<bool>()).prop_map(
            |(room_id, user_id, display_name, is_typing)| ServerFrame::Typing {
                room_id,
                user_id,
                display_name,
                is_typing,
            }
        ),
        (arb_room_id(), arb_user_id(), "[^\x00]{1,32}", arb_role()).prop_map(
            |(room_id, user_id, display_name, role)| ServerFrame::UserJoined {
                room_id,
                user_id,
                display_name,
                role,
            }
        ),
        (arb_room_id(), arb_user_id())
            .prop_map(|(room_id, user_id)| ServerFrame::UserLeft { room_id, user_id }),
        "[^\x00]{1,64}".prop_map(|message| ServerFrame::Error { message }),
    ]
}

// --- Property tests ---

proptest! {
    /// Any valid ClientFrame survives an encode → decode round-trip.
    #[test]
    fn client_frame_round_trip(frame in arb_client_frame()) {
        let text = codec::encode(&frame).expect("encode should succeed");
        let decoded = codec::decode_client(&text).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    /// Any valid ServerFrame survives an encode → decode round-trip.
    #[test]
    fn server_frame_round_trip(frame in arb_server_frame()) {
        let text = codec::encode(&frame).expect("encode should succeed");
        let decoded = codec::decode_server(&text).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    /// Both join shapes survive the untagged round-trip unambiguously.
    #[test]
    fn join_request_round_trip(request in arb_join_request()) {
        let frame = ClientFrame::Join { request };
        let text = codec::encode(&frame).expect("encode should succeed");
        let decoded = codec::decode_client(&text).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    /// Every encoded frame is a JSON object carrying the `event` tag.
    #[test]
    fn encoded_frames_carry_the_event_tag(frame in arb_server_frame()) {
        let text = codec::encode(&frame).expect("encode should succeed");
        let value: serde_json::Value = serde_json::from_str(&text).expect("valid JSON");
        prop_assert!(value.get("event").is_some_and(serde_json::Value::is_string));
    }

    /// Arbitrary text never panics the client-frame decoder.
    #[test]
    fn arbitrary_text_never_panics_decode_client(text in ".{0,512}") {
        // Ok or Err both fine; the property is the absence of a panic.
        let _ = codec::decode_client(&text);
    }

    /// Arbitrary text never panics the server-frame decoder.
    #[test]
    fn arbitrary_text_never_panics_decode_server(text in ".{0,512}") {
        let _ = codec::decode_server(&text);
    }

    /// A frame of one direction never decodes as the other unless the shapes
    /// coincide; the decoders must never panic on the wrong direction.
    #[test]
    fn wrong_direction_decode_never_panics(frame in arb_server_frame()) {
        let text = codec::encode(&frame).expect("encode should succeed");
        let _ = codec::decode_client(&text);
    }

    /// The served history limit always lands in `1..=MAX`, with `None`
    /// falling back to the default.
    #[test]
    fn history_limit_clamp_stays_in_range(requested in prop::option::of(any::<usize>())) {
        let served = clamp_history_limit(requested);
        prop_assert!((1..=MAX_HISTORY_LIMIT).contains(&served));
        if requested.is_none() {
            prop_assert_eq!(served, DEFAULT_HISTORY_LIMIT);
        }
        // Clamping is idempotent.
        prop_assert_eq!(clamp_history_limit(Some(served)), served);
    }
}
