// Message Pipeline persistence.
//
// The store is the single source of truth for messages: a message is
// visible to clients only after `create` returns, and the id assigned
// here is the only authoritative one. Client correlation ids never
// reach this layer.

use std::collections::HashMap;
use std::sync::Arc;

use agora_common::types::Message;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage failure, surfaced to the originating client only.
#[derive(Debug, thiserror::Error)]
#[error("storage failure: {0}")]
pub struct StoreError(pub String);

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        Self(error.to_string())
    }
}

/// Result of `mark_read`: the updated message plus whether this call
/// performed the transition (marking twice is idempotent).
#[derive(Debug, Clone)]
pub struct MarkReadOutcome {
    pub message: Message,
    pub newly_read: bool,
}

#[derive(Clone)]
pub enum MessageStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryMessageStore>>),
}

#[derive(Default)]
pub struct MemoryMessageStore {
    conversations: HashMap<Uuid, DateTime<Utc>>,
    messages: Vec<Message>,
    fail_writes: bool,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: Option<String>,
    attachment_url: Option<String>,
    created_at: DateTime<Utc>,
    delivered_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content: row.content,
            attachment_url: row.attachment_url,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
        }
    }
}

impl MessageStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryMessageStore::default())))
    }

    /// Persists a new message and touches the parent conversation's
    /// `updated_at` (inbox ordering) in the same transaction.
    pub async fn create(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: Option<String>,
        attachment_url: Option<String>,
    ) -> Result<Message, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                let row = sqlx::query_as::<_, MessageRow>(
                    r#"
                    INSERT INTO messages (conversation_id, sender_id, content, attachment_url)
                    VALUES ($1, $2, $3, $4)
                    RETURNING id, conversation_id, sender_id, content, attachment_url,
                              created_at, delivered_at, read_at
                    "#,
                )
                .bind(conversation_id)
                .bind(sender_id)
                .bind(&content)
                .bind(&attachment_url)
                .fetch_one(&mut *tx)
                .await?;

                sqlx::query("UPDATE conversations SET updated_at = now() WHERE id = $1")
                    .bind(conversation_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;

                Ok(row.into())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                if guard.fail_writes {
                    return Err(StoreError("simulated write failure".to_string()));
                }

                let now = Utc::now();
                let message = Message {
                    id: Uuid::new_v4(),
                    conversation_id,
                    sender_id,
                    content,
                    attachment_url,
                    created_at: now,
                    delivered_at: now,
                    read_at: None,
                };
                guard.conversations.insert(conversation_id, now);
                guard.messages.push(message.clone());
                Ok(message)
            }
        }
    }

    /// Sets `read_at` on one message. Returns `None` when the message
    /// does not exist in that conversation; already-read messages come
    /// back with `newly_read = false`.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<MarkReadOutcome>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let updated = sqlx::query_as::<_, MessageRow>(
                    r#"
                    UPDATE messages
                    SET read_at = now()
                    WHERE id = $1 AND conversation_id = $2 AND read_at IS NULL
                    RETURNING id, conversation_id, sender_id, content, attachment_url,
                              created_at, delivered_at, read_at
                    "#,
                )
                .bind(message_id)
                .bind(conversation_id)
                .fetch_optional(pool)
                .await?;

                if let Some(row) = updated {
                    return Ok(Some(MarkReadOutcome { message: row.into(), newly_read: true }));
                }

                let existing = sqlx::query_as::<_, MessageRow>(
                    r#"
                    SELECT id, conversation_id, sender_id, content, attachment_url,
                           created_at, delivered_at, read_at
                    FROM messages
                    WHERE id = $1 AND conversation_id = $2
                    "#,
                )
                .bind(message_id)
                .bind(conversation_id)
                .fetch_optional(pool)
                .await?;

                Ok(existing
                    .map(|row| MarkReadOutcome { message: row.into(), newly_read: false }))
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                if guard.fail_writes {
                    return Err(StoreError("simulated write failure".to_string()));
                }

                let Some(message) = guard
                    .messages
                    .iter_mut()
                    .find(|m| m.id == message_id && m.conversation_id == conversation_id)
                else {
                    return Ok(None);
                };

                let newly_read = message.read_at.is_none();
                if newly_read {
                    message.read_at = Some(Utc::now());
                }
                Ok(Some(MarkReadOutcome { message: message.clone(), newly_read }))
            }
        }
    }

    /// Marks every unread message from other senders as read in one
    /// pass. Returns the number of rows that transitioned.
    pub async fn mark_all_read(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> Result<u64, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query(
                    r#"
                    UPDATE messages
                    SET read_at = now()
                    WHERE conversation_id = $1 AND sender_id <> $2 AND read_at IS NULL
                    "#,
                )
                .bind(conversation_id)
                .bind(reader_id)
                .execute(pool)
                .await?;
                Ok(result.rows_affected())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                if guard.fail_writes {
                    return Err(StoreError("simulated write failure".to_string()));
                }

                let now = Utc::now();
                let mut count = 0;
                for message in guard.messages.iter_mut().filter(|m| {
                    m.conversation_id == conversation_id
                        && m.sender_id != reader_id
                        && m.read_at.is_none()
                }) {
                    message.read_at = Some(now);
                    count += 1;
                }
                Ok(count)
            }
        }
    }

    /// Conversation history in creation order, for reconnect re-fetch.
    pub async fn list(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, MessageRow>(
                    r#"
                    SELECT id, conversation_id, sender_id, content, attachment_url,
                           created_at, delivered_at, read_at
                    FROM messages
                    WHERE conversation_id = $1
                    ORDER BY created_at, id
                    "#,
                )
                .bind(conversation_id)
                .fetch_all(pool)
                .await?;
                Ok(rows.into_iter().map(Message::from).collect())
            }
            Self::Memory(store) => {
                let guard = store.read().await;
                Ok(guard
                    .messages
                    .iter()
                    .filter(|m| m.conversation_id == conversation_id)
                    .cloned()
                    .collect())
            }
        }
    }

    /// Last-activity timestamp of a conversation, if the store has seen it.
    pub async fn conversation_updated_at(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let updated_at = sqlx::query_scalar::<_, DateTime<Utc>>(
                    "SELECT updated_at FROM conversations WHERE id = $1",
                )
                .bind(conversation_id)
                .fetch_optional(pool)
                .await?;
                Ok(updated_at)
            }
            Self::Memory(store) => {
                Ok(store.read().await.conversations.get(&conversation_id).copied())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn fail_writes_for_tests(&self, fail: bool) {
        if let Self::Memory(store) = self {
            store.write().await.fail_writes = fail;
        }
    }
}
