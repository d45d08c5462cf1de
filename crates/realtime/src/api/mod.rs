// Fallback REST surface.
//
// Everything here mirrors a WS operation for clients whose socket is
// down: same stores, same broadcasts, same error codes. The response
// body is the synchronous equivalent of the frames the socket path
// would deliver.

use agora_common::protocol::ws::ServerEvent;
use agora_common::types::{Message as ChatMessage, Notification};
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::auth::middleware::{require_bearer_auth, AuthenticatedUser};
use crate::error::{ApiError, ErrorCode};
use crate::validation::{attachment_url_is_safe, ValidatedJson};
use crate::ws::RealtimeState;

pub fn router(state: RealtimeState) -> Router {
    let auth_layer =
        middleware::from_fn_with_state(state.verifier.clone(), require_bearer_auth);

    Router::new()
        .route("/v1/messages", post(create_message))
        .route("/v1/conversations/{conversation_id}/read", patch(mark_conversation_read))
        .route("/v1/conversations/{conversation_id}/messages", get(list_conversation_messages))
        .route("/v1/notifications", get(list_notifications))
        .route("/v1/notifications/{notification_id}/read", patch(mark_notification_read))
        .route_layer(auth_layer)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub conversation_id: Uuid,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub temp_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct MessageEnvelope {
    message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    temp_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReadAllResponse {
    conversation_id: Uuid,
    count: u64,
}

#[derive(Debug, Serialize)]
struct MessagesResponse {
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct NotificationsResponse {
    notifications: Vec<Notification>,
}

#[derive(Debug, Serialize)]
struct NotificationEnvelope {
    notification: Notification,
}

/// `message:send` over HTTP. The room still gets its `message:new`
/// broadcast; the sender gets the authoritative message (and echoed
/// temp_id) in the response body instead of a socket frame.
async fn create_message(
    State(state): State<RealtimeState>,
    Extension(user): Extension<AuthenticatedUser>,
    ValidatedJson(payload): ValidatedJson<CreateMessageRequest>,
) -> Response {
    if !ChatMessage::has_body(payload.content.as_deref(), payload.attachment_url.as_deref()) {
        return ApiError::from_code(ErrorCode::InvalidMessage).into_response();
    }
    if let Some(url) = payload.attachment_url.as_deref() {
        if !url.trim().is_empty() && !attachment_url_is_safe(url) {
            return ApiError::new(
                ErrorCode::InvalidMessage,
                "attachment_url must be an absolute http(s) URL",
            )
            .into_response();
        }
    }

    let message = match state
        .messages
        .create(payload.conversation_id, user.user_id, payload.content, payload.attachment_url)
        .await
    {
        Ok(message) => message,
        Err(error) => {
            warn!(conversation_id = %payload.conversation_id, %error, "message persistence failed");
            return ApiError::from_code(ErrorCode::PersistenceFailed).into_response();
        }
    };

    state
        .registry
        .broadcast_to_room(payload.conversation_id, ServerEvent::MessageNew {
            message: message.clone(),
            temp_id: payload.temp_id.clone(),
        })
        .await;

    (StatusCode::CREATED, Json(MessageEnvelope { message, temp_id: payload.temp_id }))
        .into_response()
}

/// `messages:read:all` over HTTP: bulk update plus the single
/// aggregate room event.
async fn mark_conversation_read(
    State(state): State<RealtimeState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<Uuid>,
) -> Response {
    let count = match state.messages.mark_all_read(conversation_id, user.user_id).await {
        Ok(count) => count,
        Err(error) => {
            warn!(%conversation_id, %error, "bulk read persistence failed");
            return ApiError::from_code(ErrorCode::PersistenceFailed).into_response();
        }
    };

    state
        .registry
        .broadcast_to_room(conversation_id, ServerEvent::MessagesReadAll {
            conversation_id,
            reader_id: user.user_id,
            count,
        })
        .await;

    Json(ReadAllResponse { conversation_id, count }).into_response()
}

/// Reconnect re-fetch: the push channel keeps no outbox, so clients
/// reload history here after a gap.
async fn list_conversation_messages(
    State(state): State<RealtimeState>,
    Path(conversation_id): Path<Uuid>,
) -> Response {
    match state.messages.list(conversation_id).await {
        Ok(messages) => Json(MessagesResponse { messages }).into_response(),
        Err(error) => {
            warn!(%conversation_id, %error, "message history fetch failed");
            ApiError::from_code(ErrorCode::PersistenceFailed).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListNotificationsQuery {
    #[serde(default)]
    unread: bool,
}

async fn list_notifications(
    State(state): State<RealtimeState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ListNotificationsQuery>,
) -> Response {
    match state.notifications.store().list_for_recipient(user.user_id, query.unread).await {
        Ok(notifications) => Json(NotificationsResponse { notifications }).into_response(),
        Err(error) => {
            warn!(user_id = %user.user_id, %error, "notification fetch failed");
            ApiError::from_code(ErrorCode::PersistenceFailed).into_response()
        }
    }
}

async fn mark_notification_read(
    State(state): State<RealtimeState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(notification_id): Path<Uuid>,
) -> Response {
    match state.notifications.store().mark_read(notification_id, user.user_id).await {
        Ok(Some(notification)) => Json(NotificationEnvelope { notification }).into_response(),
        Ok(None) => ApiError::from_code(ErrorCode::NotFound).into_response(),
        Err(error) => {
            warn!(%notification_id, %error, "notification read persistence failed");
            ApiError::from_code(ErrorCode::PersistenceFailed).into_response()
        }
    }
}
