use agora_common::protocol::ws::{ClientEvent, PresenceUser, ServerEvent};
use agora_common::types::{Message, Notification, NotificationKind, TargetType};
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

const WS_SOURCE: &str = include_str!("../src/ws/mod.rs");

#[test]
fn websocket_contract_heartbeat_and_frame_limits() {
    let heartbeat_interval_ms = parse_u64_const(WS_SOURCE, "HEARTBEAT_INTERVAL_MS");
    let heartbeat_timeout_ms = parse_u64_const(WS_SOURCE, "HEARTBEAT_TIMEOUT_MS");
    let max_frame_bytes = parse_u64_const(WS_SOURCE, "MAX_FRAME_BYTES");

    assert_eq!(heartbeat_interval_ms, 15_000);
    assert_eq!(heartbeat_timeout_ms, 45_000);
    assert_eq!(max_frame_bytes, 65_536);
    assert!(
        heartbeat_timeout_ms >= 2 * heartbeat_interval_ms,
        "a single dropped pong must not kill the connection",
    );
}

#[test]
fn websocket_contract_client_frame_shapes() {
    let conversation_id = Uuid::new_v4();
    let message_id = Uuid::new_v4();
    let project_id = Uuid::new_v4();
    let comment_id = Uuid::new_v4();
    let idea_id = Uuid::new_v4();
    let requester_id = Uuid::new_v4();

    let samples = [
        (
            ClientEvent::JoinConversation { conversation_id },
            "join:conversation",
            &["type", "conversation_id"][..],
        ),
        (
            ClientEvent::LeaveConversation { conversation_id },
            "leave:conversation",
            &["type", "conversation_id"][..],
        ),
        (
            ClientEvent::MessageSend {
                conversation_id,
                content: Some("hello".to_string()),
                attachment_url: Some("https://cdn.example/pic.png".to_string()),
                temp_id: Some("temp-1".to_string()),
            },
            "message:send",
            &["type", "conversation_id", "content", "attachment_url", "temp_id"][..],
        ),
        (
            ClientEvent::MessageRead { conversation_id, message_id },
            "message:read",
            &["type", "conversation_id", "message_id"][..],
        ),
        (
            ClientEvent::MessagesReadAll { conversation_id },
            "messages:read:all",
            &["type", "conversation_id"][..],
        ),
        (
            ClientEvent::TypingStart { conversation_id },
            "typing:start",
            &["type", "conversation_id"][..],
        ),
        (
            ClientEvent::TypingStop { conversation_id },
            "typing:stop",
            &["type", "conversation_id"][..],
        ),
        (ClientEvent::ProjectLike { project_id }, "project:like", &["type", "project_id"][..]),
        (
            ClientEvent::ProjectComment { project_id, comment_id },
            "project:comment",
            &["type", "project_id", "comment_id"][..],
        ),
        (ClientEvent::CommentLike { comment_id }, "comment:like", &["type", "comment_id"][..]),
        (
            ClientEvent::CommentReply { comment_id, reply_id: Uuid::new_v4() },
            "comment:reply",
            &["type", "comment_id", "reply_id"][..],
        ),
        (
            ClientEvent::IdeaCollabRequest { idea_id },
            "idea:collab-request",
            &["type", "idea_id"][..],
        ),
        (
            ClientEvent::IdeaCollabAccepted { idea_id, requester_id },
            "idea:collab-accepted",
            &["type", "idea_id", "requester_id"][..],
        ),
    ];

    for (event, expected_type, expected_keys) in samples {
        let value = serde_json::to_value(event).expect("client event should serialize");
        assert_eq!(value["type"], expected_type);
        for key in expected_keys {
            assert!(
                value.get(key).is_some(),
                "serialized `{expected_type}` frame must include `{key}`",
            );
        }
    }
}

#[test]
fn websocket_contract_server_frame_shapes() {
    let conversation_id = Uuid::new_v4();
    let message_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let now = Utc::now();

    let message = Message {
        id: message_id,
        conversation_id,
        sender_id: user_id,
        content: Some("hello".to_string()),
        attachment_url: None,
        created_at: now,
        delivered_at: now,
        read_at: None,
    };
    let notification = Notification {
        id: Uuid::new_v4(),
        recipient_id: user_id,
        originator_id: Uuid::new_v4(),
        kind: NotificationKind::Like,
        message: "Ada liked your project \"Solar Co-op\"".to_string(),
        target_type: TargetType::Project,
        target_id: Uuid::new_v4(),
        read: false,
        read_at: None,
        created_at: now,
    };

    let samples = [
        (
            ServerEvent::MessageNew { message: message.clone(), temp_id: Some("temp-1".into()) },
            "message:new",
            &["type", "message", "temp_id"][..],
        ),
        (
            ServerEvent::MessageDelivered {
                message_id,
                delivered_at: now,
                temp_id: Some("temp-1".into()),
            },
            "message:delivered",
            &["type", "message_id", "delivered_at", "temp_id"][..],
        ),
        (
            ServerEvent::MessageRead { conversation_id, message_id, read_at: now },
            "message:read",
            &["type", "conversation_id", "message_id", "read_at"][..],
        ),
        (
            ServerEvent::MessagesReadAll { conversation_id, reader_id: user_id, count: 3 },
            "messages:read:all",
            &["type", "conversation_id", "reader_id", "count"][..],
        ),
        (
            ServerEvent::MessageError {
                code: "INVALID_MESSAGE".to_string(),
                error: "message must carry text or an attachment".to_string(),
                temp_id: Some("temp-1".into()),
            },
            "message:error",
            &["type", "code", "error", "temp_id"][..],
        ),
        (
            ServerEvent::UserTyping { conversation_id, user_id, typing: true },
            "user:typing",
            &["type", "conversation_id", "user_id", "typing"][..],
        ),
        (
            ServerEvent::UserActive { conversation_id, user_id, display_name: "Ada".into() },
            "user:active",
            &["type", "conversation_id", "user_id", "display_name"][..],
        ),
        (
            ServerEvent::UserInactive { conversation_id, user_id },
            "user:inactive",
            &["type", "conversation_id", "user_id"][..],
        ),
        (
            ServerEvent::ActiveUsers {
                conversation_id,
                users: vec![PresenceUser { user_id, display_name: "Ada".into() }],
            },
            "active:users",
            &["type", "conversation_id", "users"][..],
        ),
        (
            ServerEvent::Notification { notification },
            "notification",
            &["type", "notification"][..],
        ),
        (
            ServerEvent::Error {
                code: "VALIDATION_FAILED".to_string(),
                message: "malformed frame".to_string(),
                retryable: false,
            },
            "error",
            &["type", "code", "message", "retryable"][..],
        ),
    ];

    for (event, expected_type, expected_keys) in samples {
        let value = serde_json::to_value(event).expect("server event should serialize");
        assert_eq!(value["type"], expected_type);
        for key in expected_keys {
            assert!(
                value.get(key).is_some(),
                "serialized `{expected_type}` frame must include `{key}`",
            );
        }
    }
}

#[test]
fn websocket_contract_optional_fields_are_omitted_when_absent() {
    let send_without_extras = ClientEvent::MessageSend {
        conversation_id: Uuid::new_v4(),
        content: Some("hello".to_string()),
        attachment_url: None,
        temp_id: None,
    };
    let error_without_temp_id = ServerEvent::MessageError {
        code: "PERSISTENCE_FAILED".to_string(),
        error: "server could not persist data".to_string(),
        temp_id: None,
    };

    let send_json = serde_json::to_value(send_without_extras).expect("send should serialize");
    let error_json = serde_json::to_value(error_without_temp_id).expect("error should serialize");

    assert!(object_keys(&send_json).contains(&"content".to_string()));
    assert!(!object_keys(&send_json).contains(&"attachment_url".to_string()));
    assert!(!object_keys(&send_json).contains(&"temp_id".to_string()));
    assert!(!object_keys(&error_json).contains(&"temp_id".to_string()));
}

#[test]
fn websocket_contract_notification_kinds_use_client_facing_names() {
    let expected = [
        (NotificationKind::Like, "like"),
        (NotificationKind::Comment, "comment"),
        (NotificationKind::Reply, "reply"),
        (NotificationKind::CollabRequest, "collab-request"),
        (NotificationKind::CollabAccepted, "collab-accepted"),
    ];
    for (kind, name) in expected {
        assert_eq!(serde_json::to_value(kind).expect("kind should serialize"), name);
    }
}

fn object_keys(value: &Value) -> Vec<String> {
    let mut keys =
        value.as_object().expect("value should be an object").keys().cloned().collect::<Vec<_>>();
    keys.sort();
    keys
}

fn parse_u64_const(source: &str, name: &str) -> u64 {
    let needle = format!("const {name}:");
    let index = source.find(&needle).expect("constant must be declared");
    let line = source[index..].lines().next().expect("constant declaration line must exist");
    let raw_value = line
        .split('=')
        .nth(1)
        .expect("constant must have assignment")
        .trim()
        .trim_end_matches(';')
        .replace('_', "");
    raw_value
        .parse::<u64>()
        .unwrap_or_else(|error| panic!("failed to parse `{name}` from `{line}`: {error}"))
}
