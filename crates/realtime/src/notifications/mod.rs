// Notification Upsert Engine.
//
// Domain events (likes, comments, replies, collaboration requests)
// resolve their target entity, compose a human-readable summary from
// the verified sender's display name, then upsert a notification row.
// Uniqueness is enforced per unread (recipient, originator, kind,
// target) tuple: repeats refresh the existing row in place instead of
// stacking duplicates. Push delivery is best effort and never gates
// the persistence step.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use agora_common::protocol::ws::ServerEvent;
use agora_common::types::{Notification, NotificationKind, TargetRef, TargetType};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::messages::StoreError;
use crate::registry::ConnectionRegistry;

/// Resolved target entity: who owns it and what to call it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub owner_id: Uuid,
    /// Display title, absent for entities without one (comments).
    pub title: Option<String>,
}

#[derive(Clone)]
pub enum TargetStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<TargetRef, TargetInfo>>>),
}

impl TargetStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Registers a resolvable target in the in-memory backend. No-op
    /// against Postgres, where targets live in the CRUD layer's tables.
    pub async fn insert(&self, target: TargetRef, info: TargetInfo) {
        if let Self::Memory(map) = self {
            map.write().await.insert(target, info);
        }
    }

    pub async fn resolve(&self, target: TargetRef) -> Result<Option<TargetInfo>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let row: Option<(Uuid, Option<String>)> = match target.target_type {
                    TargetType::Project => {
                        sqlx::query_as("SELECT owner_id, title FROM projects WHERE id = $1")
                            .bind(target.target_id)
                            .fetch_optional(pool)
                            .await?
                    }
                    TargetType::Idea => {
                        sqlx::query_as("SELECT owner_id, title FROM ideas WHERE id = $1")
                            .bind(target.target_id)
                            .fetch_optional(pool)
                            .await?
                    }
                    TargetType::Comment => {
                        sqlx::query_as(
                            "SELECT author_id, NULL::text FROM comments WHERE id = $1",
                        )
                        .bind(target.target_id)
                        .fetch_optional(pool)
                        .await?
                    }
                };
                Ok(row.map(|(owner_id, title)| TargetInfo { owner_id, title }))
            }
            Self::Memory(map) => Ok(map.read().await.get(&target).cloned()),
        }
    }
}

#[derive(Clone)]
pub enum NotificationStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<Vec<Notification>>>),
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    recipient_id: Uuid,
    originator_id: Uuid,
    kind: String,
    message: String,
    target_type: String,
    target_id: Uuid,
    read: bool,
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            recipient_id: row.recipient_id,
            originator_id: row.originator_id,
            kind: NotificationKind::from_str(&row.kind).map_err(StoreError)?,
            message: row.message,
            target_type: TargetType::from_str(&row.target_type).map_err(StoreError)?,
            target_id: row.target_id,
            read: row.read,
            read_at: row.read_at,
            created_at: row.created_at,
        })
    }
}

impl NotificationStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(Vec::new())))
    }

    /// Inserts a notification, or refreshes the matching unread row in
    /// place (new text, new timestamp) when one already exists for the
    /// same (recipient, originator, kind, target) tuple.
    pub async fn upsert(
        &self,
        recipient_id: Uuid,
        originator_id: Uuid,
        kind: NotificationKind,
        message: &str,
        target: TargetRef,
    ) -> Result<Notification, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, NotificationRow>(
                    r#"
                    INSERT INTO notifications
                        (recipient_id, originator_id, kind, message, target_type, target_id)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (recipient_id, originator_id, kind, target_type, target_id)
                        WHERE NOT read
                        DO UPDATE SET message = EXCLUDED.message, created_at = now()
                    RETURNING id, recipient_id, originator_id, kind, message,
                              target_type, target_id, read, read_at, created_at
                    "#,
                )
                .bind(recipient_id)
                .bind(originator_id)
                .bind(kind.as_str())
                .bind(message)
                .bind(target.target_type.as_str())
                .bind(target.target_id)
                .fetch_one(pool)
                .await?;
                row.try_into()
            }
            Self::Memory(rows) => {
                let mut guard = rows.write().await;
                let now = Utc::now();
                let existing = guard.iter_mut().find(|n| {
                    !n.read
                        && n.recipient_id == recipient_id
                        && n.originator_id == originator_id
                        && n.kind == kind
                        && n.target_type == target.target_type
                        && n.target_id == target.target_id
                });
                if let Some(notification) = existing {
                    notification.message = message.to_string();
                    notification.created_at = now;
                    return Ok(notification.clone());
                }

                let notification = Notification {
                    id: Uuid::new_v4(),
                    recipient_id,
                    originator_id,
                    kind,
                    message: message.to_string(),
                    target_type: target.target_type,
                    target_id: target.target_id,
                    read: false,
                    read_at: None,
                    created_at: now,
                };
                guard.push(notification.clone());
                Ok(notification)
            }
        }
    }

    /// Flips the read flag (logical destruction: the row leaves the
    /// dedup scope and a later identical event inserts fresh). Scoped
    /// to the recipient so users cannot clear each other's inboxes.
    pub async fn mark_read(
        &self,
        notification_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Option<Notification>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, NotificationRow>(
                    r#"
                    UPDATE notifications
                    SET read = TRUE, read_at = COALESCE(read_at, now())
                    WHERE id = $1 AND recipient_id = $2
                    RETURNING id, recipient_id, originator_id, kind, message,
                              target_type, target_id, read, read_at, created_at
                    "#,
                )
                .bind(notification_id)
                .bind(recipient_id)
                .fetch_optional(pool)
                .await?;
                row.map(Notification::try_from).transpose()
            }
            Self::Memory(rows) => {
                let mut guard = rows.write().await;
                let Some(notification) = guard
                    .iter_mut()
                    .find(|n| n.id == notification_id && n.recipient_id == recipient_id)
                else {
                    return Ok(None);
                };
                if !notification.read {
                    notification.read = true;
                    notification.read_at = Some(Utc::now());
                }
                Ok(Some(notification.clone()))
            }
        }
    }

    /// Recipient's notifications, newest first.
    pub async fn list_for_recipient(
        &self,
        recipient_id: Uuid,
        unread_only: bool,
    ) -> Result<Vec<Notification>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, NotificationRow>(
                    r#"
                    SELECT id, recipient_id, originator_id, kind, message,
                           target_type, target_id, read, read_at, created_at
                    FROM notifications
                    WHERE recipient_id = $1 AND (NOT $2 OR NOT read)
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(recipient_id)
                .bind(unread_only)
                .fetch_all(pool)
                .await?;
                rows.into_iter().map(Notification::try_from).collect()
            }
            Self::Memory(rows) => {
                let guard = rows.read().await;
                let mut matching: Vec<Notification> = guard
                    .iter()
                    .filter(|n| n.recipient_id == recipient_id && (!unread_only || !n.read))
                    .cloned()
                    .collect();
                matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(matching)
            }
        }
    }
}

/// Why a domain event produced no notification.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("{target_type} {target_id} does not exist")]
    TargetNotFound { target_type: TargetType, target_id: Uuid },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ties target resolution, text composition, persistence and push
/// delivery together. Shared by the WS handlers and the REST surface.
pub struct NotificationEngine {
    targets: TargetStore,
    store: NotificationStore,
    registry: Arc<ConnectionRegistry>,
}

impl NotificationEngine {
    pub fn new(
        targets: TargetStore,
        store: NotificationStore,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self { targets, store, registry }
    }

    pub fn store(&self) -> &NotificationStore {
        &self.store
    }

    /// Resolves the target, upserts the notification for its owner (or
    /// the explicit recipient when given, e.g. the requester of an
    /// accepted collaboration) and pushes it to the recipient's live
    /// connections. Self-notifications are skipped.
    pub async fn publish(
        &self,
        originator_id: Uuid,
        originator_name: &str,
        kind: NotificationKind,
        target: TargetRef,
        recipient_override: Option<Uuid>,
    ) -> Result<Option<Notification>, PublishError> {
        let Some(info) = self.targets.resolve(target).await? else {
            return Err(PublishError::TargetNotFound {
                target_type: target.target_type,
                target_id: target.target_id,
            });
        };

        let recipient_id = recipient_override.unwrap_or(info.owner_id);
        if recipient_id == originator_id {
            debug!(%originator_id, kind = kind.as_str(), "skipping self-notification");
            return Ok(None);
        }

        let message = compose_message(kind, target.target_type, originator_name, info.title.as_deref());
        let notification =
            self.store.upsert(recipient_id, originator_id, kind, &message, target).await?;

        let delivered = self
            .registry
            .send_to_user(recipient_id, ServerEvent::Notification {
                notification: notification.clone(),
            })
            .await;
        if delivered == 0 {
            debug!(%recipient_id, "recipient offline, notification persisted only");
        }

        Ok(Some(notification))
    }
}

/// Human-readable summary, e.g. `Ada liked your project "Solar Co-op"`.
fn compose_message(
    kind: NotificationKind,
    target_type: TargetType,
    originator_name: &str,
    title: Option<&str>,
) -> String {
    let verb = match (kind, target_type) {
        (NotificationKind::Like, TargetType::Comment) => "liked your comment".to_string(),
        (NotificationKind::Like, t) => format!("liked your {t}"),
        (NotificationKind::Comment, t) => format!("commented on your {t}"),
        (NotificationKind::Reply, _) => "replied to your comment".to_string(),
        (NotificationKind::CollabRequest, t) => format!("wants to collaborate on your {t}"),
        (NotificationKind::CollabAccepted, t) => {
            format!("accepted your collaboration request on their {t}")
        }
    };
    match title {
        Some(title) => format!("{originator_name} {verb} \"{title}\""),
        None => format!("{originator_name} {verb}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_target() -> TargetRef {
        TargetRef::new(TargetType::Project, Uuid::new_v4())
    }

    async fn engine_with_project(owner_id: Uuid) -> (NotificationEngine, TargetRef) {
        let targets = TargetStore::memory();
        let target = project_target();
        targets
            .insert(target, TargetInfo { owner_id, title: Some("Solar Co-op".into()) })
            .await;
        let registry = Arc::new(ConnectionRegistry::new());
        (NotificationEngine::new(targets, NotificationStore::memory(), registry), target)
    }

    #[tokio::test]
    async fn repeat_event_refreshes_instead_of_duplicating() {
        let store = NotificationStore::memory();
        let recipient = Uuid::new_v4();
        let originator = Uuid::new_v4();
        let target = project_target();

        let first = store
            .upsert(recipient, originator, NotificationKind::Like, "Ada liked it", target)
            .await
            .unwrap();
        let second = store
            .upsert(recipient, originator, NotificationKind::Like, "Ada liked it again", target)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.message, "Ada liked it again");
        assert!(second.created_at >= first.created_at);
        let all = store.list_for_recipient(recipient, false).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn read_row_leaves_dedup_scope() {
        let store = NotificationStore::memory();
        let recipient = Uuid::new_v4();
        let originator = Uuid::new_v4();
        let target = project_target();

        let first = store
            .upsert(recipient, originator, NotificationKind::Like, "liked", target)
            .await
            .unwrap();
        store.mark_read(first.id, recipient).await.unwrap().expect("row should exist");

        let second = store
            .upsert(recipient, originator, NotificationKind::Like, "liked", target)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        let unread = store.list_for_recipient(recipient, true).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, second.id);
        let all = store.list_for_recipient(recipient, false).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn different_kinds_do_not_collide() {
        let store = NotificationStore::memory();
        let recipient = Uuid::new_v4();
        let originator = Uuid::new_v4();
        let target = project_target();

        store
            .upsert(recipient, originator, NotificationKind::Like, "liked", target)
            .await
            .unwrap();
        store
            .upsert(recipient, originator, NotificationKind::Comment, "commented", target)
            .await
            .unwrap();

        assert_eq!(store.list_for_recipient(recipient, true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_read_is_scoped_to_the_recipient() {
        let store = NotificationStore::memory();
        let recipient = Uuid::new_v4();
        let notification = store
            .upsert(recipient, Uuid::new_v4(), NotificationKind::Like, "liked", project_target())
            .await
            .unwrap();

        let stranger = Uuid::new_v4();
        assert!(store.mark_read(notification.id, stranger).await.unwrap().is_none());

        let marked = store
            .mark_read(notification.id, recipient)
            .await
            .unwrap()
            .expect("row should exist");
        assert!(marked.read);
        assert!(marked.read_at.is_some());
    }

    #[tokio::test]
    async fn publish_resolves_owner_and_composes_text() {
        let owner = Uuid::new_v4();
        let (engine, target) = engine_with_project(owner).await;
        let originator = Uuid::new_v4();

        let notification = engine
            .publish(originator, "Ada", NotificationKind::Like, target, None)
            .await
            .unwrap()
            .expect("notification should be produced");

        assert_eq!(notification.recipient_id, owner);
        assert_eq!(notification.message, "Ada liked your project \"Solar Co-op\"");
    }

    #[tokio::test]
    async fn publish_skips_self_notification() {
        let owner = Uuid::new_v4();
        let (engine, target) = engine_with_project(owner).await;

        let outcome = engine
            .publish(owner, "Ada", NotificationKind::Like, target, None)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(engine.store().list_for_recipient(owner, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_unknown_target_is_an_error() {
        let engine = {
            let registry = Arc::new(ConnectionRegistry::new());
            NotificationEngine::new(TargetStore::memory(), NotificationStore::memory(), registry)
        };
        let result = engine
            .publish(Uuid::new_v4(), "Ada", NotificationKind::Like, project_target(), None)
            .await;
        assert!(matches!(result, Err(PublishError::TargetNotFound { .. })));
    }

    #[tokio::test]
    async fn recipient_override_routes_to_requester() {
        let owner = Uuid::new_v4();
        let requester = Uuid::new_v4();
        let targets = TargetStore::memory();
        let idea = TargetRef::new(TargetType::Idea, Uuid::new_v4());
        targets.insert(idea, TargetInfo { owner_id: owner, title: Some("Bike lanes".into()) }).await;
        let engine = NotificationEngine::new(
            targets,
            NotificationStore::memory(),
            Arc::new(ConnectionRegistry::new()),
        );

        let notification = engine
            .publish(owner, "Ada", NotificationKind::CollabAccepted, idea, Some(requester))
            .await
            .unwrap()
            .expect("notification should be produced");
        assert_eq!(notification.recipient_id, requester);
        assert_eq!(
            notification.message,
            "Ada accepted your collaboration request on their idea \"Bike lanes\""
        );
    }

    #[test]
    fn comment_targets_compose_without_title() {
        let text = compose_message(NotificationKind::Reply, TargetType::Comment, "Ada", None);
        assert_eq!(text, "Ada replied to your comment");
        let text = compose_message(NotificationKind::Like, TargetType::Comment, "Ada", None);
        assert_eq!(text, "Ada liked your comment");
    }
}
