// agora-chat.v1 WebSocket surface.
//
// One upgrade route carries the whole protocol: the session token is
// verified before the upgrade completes, then a single task per
// connection drains its outbound channel, relays heartbeats and
// dispatches inbound frames. Every inbound frame produces replies for
// the requesting connection only; fan-out to other connections always
// goes through the registry.

use std::sync::Arc;

use agora_common::protocol::ws::{ClientEvent, ServerEvent};
use agora_common::types::{Message as ChatMessage, NotificationKind, TargetRef, TargetType};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::jwt::{SessionTokenVerifier, VerifiedIdentity};
use crate::error::{
    request_id_from_headers_or_generate, with_request_id_scope, ApiError, ErrorCode,
};
use crate::messages::MessageStore;
use crate::metrics;
use crate::notifications::{NotificationEngine, PublishError};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::typing::TypingTracker;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 45_000;
pub(crate) const MAX_FRAME_BYTES: u32 = 65_536;

/// Everything the WS and REST surfaces share. Cheap to clone: all
/// fields are handles.
#[derive(Clone)]
pub struct RealtimeState {
    pub verifier: Arc<SessionTokenVerifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub typing: TypingTracker,
    pub messages: MessageStore,
    pub notifications: Arc<NotificationEngine>,
}

pub fn router(state: RealtimeState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsUpgradeQuery {
    #[serde(default)]
    token: String,
}

/// Token verification happens here, before the upgrade completes: a
/// bad token yields a plain 401 and no socket ever opens.
async fn ws_upgrade(
    State(state): State<RealtimeState>,
    Query(query): Query<WsUpgradeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match state.verifier.verify(&query.token) {
        Ok(identity) => identity,
        Err(error) => {
            warn!(%error, "rejecting websocket upgrade");
            return ApiError::from_code(ErrorCode::AuthInvalidToken).into_response();
        }
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES as usize).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, identity, socket)).await;
    })
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}

async fn handle_socket(state: RealtimeState, identity: VerifiedIdentity, mut socket: WebSocket) {
    let connection_id: ConnectionId = Uuid::new_v4();
    let mut outbound_receiver =
        state.registry.register(connection_id, identity.user_id, identity.display_name.clone()).await;
    metrics::ws_connection_opened();
    info!(%connection_id, user_id = %identity.user_id, "websocket connected");

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects
    // if no pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    'session: loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(%connection_id, "heartbeat timeout, disconnecting");
                    break 'session;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break 'session;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break 'session;
                        }
                    }
                    None => break 'session,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break 'session;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES as usize {
                            close_frame_too_large(&mut socket).await;
                            break 'session;
                        }

                        let event = match serde_json::from_str::<ClientEvent>(&raw_message) {
                            Ok(event) => event,
                            Err(_) => {
                                let invalid = ServerEvent::Error {
                                    code: ErrorCode::ValidationFailed.as_str().to_string(),
                                    message: "invalid websocket frame payload".to_string(),
                                    retryable: false,
                                };
                                if send_event(&mut socket, &invalid).await.is_err() {
                                    break 'session;
                                }
                                continue;
                            }
                        };

                        let started_at = Instant::now();
                        let event_name = client_event_name(&event);
                        let (replies, is_error) =
                            dispatch_client_event(&state, connection_id, &identity, event).await;
                        metrics::record_ws_request(
                            event_name,
                            is_error,
                            started_at.elapsed().as_millis() as u64,
                        );

                        for reply in replies {
                            if send_event(&mut socket, &reply).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break 'session;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break 'session,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break 'session;
                    }
                }
            }
        }
    }

    cleanup_connection(&state, connection_id).await;
    metrics::ws_connection_closed();
    info!(%connection_id, user_id = %identity.user_id, "websocket disconnected");
}

/// Disconnect cascade: depart every joined room, stop typing where the
/// departing connection was the user's last one, tell remaining members.
pub(crate) async fn cleanup_connection(state: &RealtimeState, connection_id: ConnectionId) {
    for departure in state.registry.on_disconnect(connection_id).await {
        if !departure.last_for_user {
            continue;
        }
        state.typing.stop(departure.conversation_id, departure.user_id).await;
        state
            .registry
            .broadcast_to_room(departure.conversation_id, ServerEvent::UserInactive {
                conversation_id: departure.conversation_id,
                user_id: departure.user_id,
            })
            .await;
    }
}

fn client_event_name(event: &ClientEvent) -> &'static str {
    match event {
        ClientEvent::JoinConversation { .. } => "join:conversation",
        ClientEvent::LeaveConversation { .. } => "leave:conversation",
        ClientEvent::MessageSend { .. } => "message:send",
        ClientEvent::MessageRead { .. } => "message:read",
        ClientEvent::MessagesReadAll { .. } => "messages:read:all",
        ClientEvent::TypingStart { .. } => "typing:start",
        ClientEvent::TypingStop { .. } => "typing:stop",
        ClientEvent::ProjectLike { .. } => "project:like",
        ClientEvent::ProjectComment { .. } => "project:comment",
        ClientEvent::CommentLike { .. } => "comment:like",
        ClientEvent::CommentReply { .. } => "comment:reply",
        ClientEvent::IdeaCollabRequest { .. } => "idea:collab-request",
        ClientEvent::IdeaCollabAccepted { .. } => "idea:collab-accepted",
    }
}

/// Routes one inbound event. Returns the frames owed to the requesting
/// connection plus an error flag for the request metrics; fan-out to
/// other connections happens inside.
pub(crate) async fn dispatch_client_event(
    state: &RealtimeState,
    connection_id: ConnectionId,
    identity: &VerifiedIdentity,
    event: ClientEvent,
) -> (Vec<ServerEvent>, bool) {
    match event {
        ClientEvent::JoinConversation { conversation_id } => {
            (handle_join(state, connection_id, conversation_id).await, false)
        }
        ClientEvent::LeaveConversation { conversation_id } => {
            handle_leave(state, connection_id, conversation_id).await;
            (Vec::new(), false)
        }
        ClientEvent::MessageSend { conversation_id, content, attachment_url, temp_id } => {
            match handle_message_send(
                state,
                connection_id,
                identity.user_id,
                conversation_id,
                content,
                attachment_url,
                temp_id,
            )
            .await
            {
                Ok(replies) => (replies, false),
                Err(error_event) => (vec![error_event], true),
            }
        }
        ClientEvent::MessageRead { conversation_id, message_id } => {
            match handle_message_read(state, connection_id, conversation_id, message_id).await {
                Ok(replies) => (replies, false),
                Err(error_event) => (vec![error_event], true),
            }
        }
        ClientEvent::MessagesReadAll { conversation_id } => {
            match handle_messages_read_all(state, connection_id, identity.user_id, conversation_id)
                .await
            {
                Ok(replies) => (replies, false),
                Err(error_event) => (vec![error_event], true),
            }
        }
        ClientEvent::TypingStart { conversation_id } => {
            handle_typing(state, connection_id, identity.user_id, conversation_id, true).await;
            (Vec::new(), false)
        }
        ClientEvent::TypingStop { conversation_id } => {
            handle_typing(state, connection_id, identity.user_id, conversation_id, false).await;
            (Vec::new(), false)
        }
        other => {
            let Some((kind, target, recipient_override)) = notification_trigger(&other) else {
                return (Vec::new(), false);
            };
            let failed = handle_domain_event(state, identity, kind, target, recipient_override)
                .await
                .is_err();
            (Vec::new(), failed)
        }
    }
}

pub(crate) async fn handle_join(
    state: &RealtimeState,
    connection_id: ConnectionId,
    conversation_id: Uuid,
) -> Vec<ServerEvent> {
    let Some(outcome) = state.registry.join(connection_id, conversation_id).await else {
        return Vec::new();
    };

    if outcome.first_for_user {
        state
            .registry
            .broadcast_to_room_excluding_user(conversation_id, outcome.user_id, ServerEvent::UserActive {
                conversation_id,
                user_id: outcome.user_id,
                display_name: outcome.display_name.clone(),
            })
            .await;
    }

    vec![ServerEvent::ActiveUsers { conversation_id, users: outcome.members }]
}

pub(crate) async fn handle_leave(
    state: &RealtimeState,
    connection_id: ConnectionId,
    conversation_id: Uuid,
) {
    let Some(departure) = state.registry.leave(connection_id, conversation_id).await else {
        return;
    };

    if departure.last_for_user {
        state.typing.stop(conversation_id, departure.user_id).await;
        state
            .registry
            .broadcast_to_room(conversation_id, ServerEvent::UserInactive {
                conversation_id,
                user_id: departure.user_id,
            })
            .await;
    }
}

/// The send pipeline: validate, persist, broadcast, ack. Exactly one of
/// `message:new` / `message:error` reaches the sender per attempt, and
/// the error path never touches other in-flight sends.
pub(crate) async fn handle_message_send(
    state: &RealtimeState,
    connection_id: ConnectionId,
    sender_id: Uuid,
    conversation_id: Uuid,
    content: Option<String>,
    attachment_url: Option<String>,
    temp_id: Option<String>,
) -> Result<Vec<ServerEvent>, ServerEvent> {
    if !ChatMessage::has_body(content.as_deref(), attachment_url.as_deref()) {
        return Err(ServerEvent::MessageError {
            code: ErrorCode::InvalidMessage.as_str().to_string(),
            error: ErrorCode::InvalidMessage.default_message().to_string(),
            temp_id,
        });
    }

    if let Some(url) = attachment_url.as_deref() {
        if !url.trim().is_empty() && !crate::validation::attachment_url_is_safe(url) {
            return Err(ServerEvent::MessageError {
                code: ErrorCode::InvalidMessage.as_str().to_string(),
                error: "attachment_url must be an absolute http(s) URL".to_string(),
                temp_id,
            });
        }
    }

    let message = match state
        .messages
        .create(conversation_id, sender_id, content, attachment_url)
        .await
    {
        Ok(message) => message,
        Err(error) => {
            warn!(%conversation_id, %sender_id, %error, "message persistence failed");
            return Err(ServerEvent::MessageError {
                code: ErrorCode::PersistenceFailed.as_str().to_string(),
                error: ErrorCode::PersistenceFailed.default_message().to_string(),
                temp_id,
            });
        }
    };

    state
        .registry
        .broadcast_to_room_excluding_connection(conversation_id, connection_id, ServerEvent::MessageNew {
            message: message.clone(),
            temp_id: temp_id.clone(),
        })
        .await;

    // The sender's own connection gets its copy directly, member or
    // not, so the optimistic placeholder can always be reconciled.
    Ok(vec![
        ServerEvent::MessageNew { message: message.clone(), temp_id: temp_id.clone() },
        ServerEvent::MessageDelivered {
            message_id: message.id,
            delivered_at: message.delivered_at,
            temp_id,
        },
    ])
}

pub(crate) async fn handle_message_read(
    state: &RealtimeState,
    connection_id: ConnectionId,
    conversation_id: Uuid,
    message_id: Uuid,
) -> Result<Vec<ServerEvent>, ServerEvent> {
    let outcome = state.messages.mark_read(conversation_id, message_id).await.map_err(|error| {
        warn!(%conversation_id, %message_id, %error, "read receipt persistence failed");
        ServerEvent::Error {
            code: ErrorCode::PersistenceFailed.as_str().to_string(),
            message: ErrorCode::PersistenceFailed.default_message().to_string(),
            retryable: true,
        }
    })?;

    let Some(outcome) = outcome else {
        return Err(ServerEvent::Error {
            code: ErrorCode::NotFound.as_str().to_string(),
            message: "message not found in conversation".to_string(),
            retryable: false,
        });
    };

    // Marking an already-read message is a quiet no-op.
    if !outcome.newly_read {
        return Ok(Vec::new());
    }

    let read_at = outcome.message.read_at.unwrap_or(outcome.message.created_at);
    let event = ServerEvent::MessageRead { conversation_id, message_id, read_at };
    state
        .registry
        .broadcast_to_room_excluding_connection(conversation_id, connection_id, event.clone())
        .await;
    Ok(vec![event])
}

pub(crate) async fn handle_messages_read_all(
    state: &RealtimeState,
    connection_id: ConnectionId,
    reader_id: Uuid,
    conversation_id: Uuid,
) -> Result<Vec<ServerEvent>, ServerEvent> {
    let count =
        state.messages.mark_all_read(conversation_id, reader_id).await.map_err(|error| {
            warn!(%conversation_id, %reader_id, %error, "bulk read persistence failed");
            ServerEvent::Error {
                code: ErrorCode::PersistenceFailed.as_str().to_string(),
                message: ErrorCode::PersistenceFailed.default_message().to_string(),
                retryable: true,
            }
        })?;

    // One aggregate event no matter how many rows transitioned.
    let event = ServerEvent::MessagesReadAll { conversation_id, reader_id, count };
    state
        .registry
        .broadcast_to_room_excluding_connection(conversation_id, connection_id, event.clone())
        .await;
    Ok(vec![event])
}

pub(crate) async fn handle_typing(
    state: &RealtimeState,
    connection_id: ConnectionId,
    user_id: Uuid,
    conversation_id: Uuid,
    typing: bool,
) {
    // Typing presence only makes sense inside a joined room.
    if !state.registry.is_member(connection_id, conversation_id).await {
        return;
    }

    if typing {
        state.typing.start(conversation_id, user_id).await;
    } else {
        state.typing.stop(conversation_id, user_id).await;
    }
}

/// Maps a domain trigger to (kind, target, explicit recipient). Returns
/// `None` for events that are not notification triggers.
pub(crate) fn notification_trigger(
    event: &ClientEvent,
) -> Option<(NotificationKind, TargetRef, Option<Uuid>)> {
    match event {
        ClientEvent::ProjectLike { project_id } => Some((
            NotificationKind::Like,
            TargetRef::new(TargetType::Project, *project_id),
            None,
        )),
        ClientEvent::ProjectComment { project_id, .. } => Some((
            NotificationKind::Comment,
            TargetRef::new(TargetType::Project, *project_id),
            None,
        )),
        ClientEvent::CommentLike { comment_id } => Some((
            NotificationKind::Like,
            TargetRef::new(TargetType::Comment, *comment_id),
            None,
        )),
        ClientEvent::CommentReply { comment_id, .. } => Some((
            NotificationKind::Reply,
            TargetRef::new(TargetType::Comment, *comment_id),
            None,
        )),
        ClientEvent::IdeaCollabRequest { idea_id } => Some((
            NotificationKind::CollabRequest,
            TargetRef::new(TargetType::Idea, *idea_id),
            None,
        )),
        ClientEvent::IdeaCollabAccepted { idea_id, requester_id } => Some((
            NotificationKind::CollabAccepted,
            TargetRef::new(TargetType::Idea, *idea_id),
            Some(*requester_id),
        )),
        _ => None,
    }
}

/// Domain events are fire-and-forget from the socket's point of view:
/// failures are logged and dropped, never replied to or retried.
pub(crate) async fn handle_domain_event(
    state: &RealtimeState,
    identity: &VerifiedIdentity,
    kind: NotificationKind,
    target: TargetRef,
    recipient_override: Option<Uuid>,
) -> Result<(), PublishError> {
    state
        .notifications
        .publish(identity.user_id, &identity.display_name, kind, target, recipient_override)
        .await
        .map(drop)
        .map_err(|error| {
            warn!(kind = kind.as_str(), %error, "dropping domain event");
            error
        })
}
