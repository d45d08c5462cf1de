// WebSocket event types for the agora-chat.v1 protocol.
//
// Frames are JSON text tagged by `type`. Event names keep the
// `scope:action` form the client apps already speak.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Message, Notification};

/// Client -> Server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Join a conversation room; the joiner receives `active:users` back.
    #[serde(rename = "join:conversation")]
    JoinConversation { conversation_id: Uuid },

    /// Leave a conversation room.
    #[serde(rename = "leave:conversation")]
    LeaveConversation { conversation_id: Uuid },

    /// Send a message. `temp_id` is a client-generated correlation id,
    /// echoed back but never stored.
    #[serde(rename = "message:send")]
    MessageSend {
        conversation_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        attachment_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },

    /// Mark a single message as read.
    #[serde(rename = "message:read")]
    MessageRead { conversation_id: Uuid, message_id: Uuid },

    /// Mark every unread message from other senders in a conversation as read.
    #[serde(rename = "messages:read:all")]
    MessagesReadAll { conversation_id: Uuid },

    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: Uuid },

    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: Uuid },

    // Domain event triggers for notification fan-out.
    #[serde(rename = "project:like")]
    ProjectLike { project_id: Uuid },

    #[serde(rename = "project:comment")]
    ProjectComment { project_id: Uuid, comment_id: Uuid },

    #[serde(rename = "comment:like")]
    CommentLike { comment_id: Uuid },

    #[serde(rename = "comment:reply")]
    CommentReply { comment_id: Uuid, reply_id: Uuid },

    #[serde(rename = "idea:collab-request")]
    IdeaCollabRequest { idea_id: Uuid },

    /// Acceptance notifies the requesting user, not the idea owner.
    #[serde(rename = "idea:collab-accepted")]
    IdeaCollabAccepted { idea_id: Uuid, requester_id: Uuid },
}

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Broadcast of a freshly persisted message to every room member,
    /// sender included. `temp_id` lets the sender replace its
    /// optimistic placeholder with this authoritative record.
    #[serde(rename = "message:new")]
    MessageNew {
        message: Message,
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },

    /// Delivery acknowledgement, sent to the sender only.
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        message_id: Uuid,
        delivered_at: chrono::DateTime<chrono::Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },

    #[serde(rename = "message:read")]
    MessageRead {
        conversation_id: Uuid,
        message_id: Uuid,
        read_at: chrono::DateTime<chrono::Utc>,
    },

    /// Single aggregate event for a bulk read; `count` is the number of
    /// messages that transitioned to read.
    #[serde(rename = "messages:read:all")]
    MessagesReadAll { conversation_id: Uuid, reader_id: Uuid, count: u64 },

    /// Scoped failure of one send; only the placeholder with this
    /// `temp_id` should be marked failed.
    #[serde(rename = "message:error")]
    MessageError {
        code: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },

    #[serde(rename = "user:typing")]
    UserTyping { conversation_id: Uuid, user_id: Uuid, typing: bool },

    #[serde(rename = "user:active")]
    UserActive { conversation_id: Uuid, user_id: Uuid, display_name: String },

    #[serde(rename = "user:inactive")]
    UserInactive { conversation_id: Uuid, user_id: Uuid },

    /// Current presence snapshot, sent to a joiner.
    #[serde(rename = "active:users")]
    ActiveUsers { conversation_id: Uuid, users: Vec<PresenceUser> },

    /// Best-effort realtime copy of a persisted notification; consumers
    /// route on `notification.kind`.
    #[serde(rename = "notification")]
    Notification { notification: Notification },

    /// Protocol-level error not tied to a specific send.
    #[serde(rename = "error")]
    Error { code: String, message: String, retryable: bool },
}

/// A user currently active in a conversation room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceUser {
    pub user_id: Uuid,
    pub display_name: String,
}
