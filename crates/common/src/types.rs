// Core domain types shared across all Agora crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted chat message within a conversation.
///
/// The id is authoritative and assigned at persistence time; the
/// client-side correlation id (`temp_id`) is never part of this record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// Message body. May be absent when an attachment is present.
    pub content: Option<String>,
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// A message must carry text, an attachment, or both.
    pub fn has_body(content: Option<&str>, attachment_url: Option<&str>) -> bool {
        content.map(|text| !text.trim().is_empty()).unwrap_or(false)
            || attachment_url.map(|url| !url.trim().is_empty()).unwrap_or(false)
    }
}

/// A conversation between participants. The realtime core only touches
/// `updated_at` (inbox ordering); everything else belongs to the CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted notification record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub originator_id: Uuid,
    pub kind: NotificationKind,
    /// Human-readable summary, e.g. "Ada liked your project".
    pub message: String,
    pub target_type: TargetType,
    pub target_id: Uuid,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// The unread-uniqueness key: at most one unread notification may
    /// exist per (recipient, originator, kind, target) at any instant.
    pub fn dedup_key(&self) -> (Uuid, Uuid, NotificationKind, TargetType, Uuid) {
        (self.recipient_id, self.originator_id, self.kind, self.target_type, self.target_id)
    }
}

/// The kinds of domain events that fan out as notifications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Like,
    Comment,
    Reply,
    CollabRequest,
    CollabAccepted,
}

impl NotificationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Reply => "reply",
            Self::CollabRequest => "collab-request",
            Self::CollabAccepted => "collab-accepted",
        }
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "like" => Ok(Self::Like),
            "comment" => Ok(Self::Comment),
            "reply" => Ok(Self::Reply),
            "collab-request" => Ok(Self::CollabRequest),
            "collab-accepted" => Ok(Self::CollabAccepted),
            other => Err(format!("unknown notification kind: {other}")),
        }
    }
}

/// Entity kinds a notification can point at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Project,
    Idea,
    Comment,
}

impl TargetType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Idea => "idea",
            Self::Comment => "comment",
        }
    }
}

impl std::str::FromStr for TargetType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "project" => Ok(Self::Project),
            "idea" => Ok(Self::Idea),
            "comment" => Ok(Self::Comment),
            other => Err(format!("unknown target type: {other}")),
        }
    }
}

/// A polymorphic reference to the entity a notification is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TargetRef {
    pub target_type: TargetType,
    pub target_id: Uuid,
}

impl TargetRef {
    pub fn new(target_type: TargetType, target_id: Uuid) -> Self {
        Self { target_type, target_id }
    }
}

/// Errors shared between the service and consumer crates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("message must contain content or an attachment")]
    InvalidMessage,
    #[error("{target_type} {target_id} does not exist")]
    TargetNotFound { target_type: TargetType, target_id: Uuid },
    #[error("storage write failed: {0}")]
    PersistenceFailure(String),
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
