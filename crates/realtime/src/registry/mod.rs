// Connection Registry
//
// Tracks every live WebSocket connection: its verified identity, the
// set of conversation rooms it has joined, and its outbound channel.
// All room membership is mutated through this API; broadcast observes
// the membership snapshot at the moment of the call.
//
// A single instance is constructed at startup and shared by Arc;
// there is no ambient global state.

use std::collections::{HashMap, HashSet};

use agora_common::protocol::ws::{PresenceUser, ServerEvent};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug)]
struct ConnectionRecord {
    user_id: Uuid,
    display_name: String,
    rooms: HashSet<Uuid>,
    outbound: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    /// conversation_id -> member connection ids. Derived state: always
    /// reconstructable by replaying connect/join events.
    rooms: HashMap<Uuid, HashSet<ConnectionId>>,
}

/// Result of a successful `join`.
#[derive(Debug)]
pub struct JoinOutcome {
    /// True when this is the user's first live connection in the room,
    /// i.e. other members should be told the user is now active.
    pub first_for_user: bool,
    pub user_id: Uuid,
    pub display_name: String,
    /// Current member list (unique users, joiner included) at join time.
    pub members: Vec<PresenceUser>,
}

/// Result of a successful `leave` (explicit or via disconnect).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDeparture {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    /// True when the user has no remaining connection in the room, so
    /// remaining members should be told the user is no longer active
    /// and any typing state for (conversation, user) must be stopped.
    pub last_for_user: bool,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an authenticated connection. Returns the receiver end
    /// of its outbound event channel.
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        user_id: Uuid,
        display_name: String,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;
        state.connections.insert(
            connection_id,
            ConnectionRecord { user_id, display_name, rooms: HashSet::new(), outbound: sender },
        );
        receiver
    }

    /// Adds the connection to a room. Idempotent: joining twice only
    /// refreshes membership. Returns `None` for unknown connections
    /// (already cleaned up after a disconnect race).
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        conversation_id: Uuid,
    ) -> Option<JoinOutcome> {
        let mut state = self.state.write().await;
        let record = state.connections.get(&connection_id)?;
        let user_id = record.user_id;
        let display_name = record.display_name.clone();

        let already_present = user_connection_count(&state, conversation_id, user_id) > 0;

        state.rooms.entry(conversation_id).or_default().insert(connection_id);
        if let Some(record) = state.connections.get_mut(&connection_id) {
            record.rooms.insert(conversation_id);
        }

        let members = room_members(&state, conversation_id);

        Some(JoinOutcome { first_for_user: !already_present, user_id, display_name, members })
    }

    /// Removes the connection from a room. Unknown connections or
    /// non-membership are no-ops.
    pub async fn leave(
        &self,
        connection_id: ConnectionId,
        conversation_id: Uuid,
    ) -> Option<RoomDeparture> {
        let mut state = self.state.write().await;
        let user_id = state.connections.get(&connection_id)?.user_id;

        let was_member = match state.rooms.get_mut(&conversation_id) {
            Some(members) => members.remove(&connection_id),
            None => false,
        };
        if !was_member {
            return None;
        }
        if state.rooms.get(&conversation_id).is_some_and(HashSet::is_empty) {
            state.rooms.remove(&conversation_id);
        }
        if let Some(record) = state.connections.get_mut(&connection_id) {
            record.rooms.remove(&conversation_id);
        }

        let last_for_user = user_connection_count(&state, conversation_id, user_id) == 0;

        Some(RoomDeparture { conversation_id, user_id, last_for_user })
    }

    /// Releases all per-connection resources. Returns one departure per
    /// room the connection belonged to; an unknown connection yields an
    /// empty list (concurrent disconnects are expected).
    pub async fn on_disconnect(&self, connection_id: ConnectionId) -> Vec<RoomDeparture> {
        let mut state = self.state.write().await;
        let Some(record) = state.connections.remove(&connection_id) else {
            return Vec::new();
        };

        let mut departures = Vec::with_capacity(record.rooms.len());
        for conversation_id in record.rooms {
            if let Some(members) = state.rooms.get_mut(&conversation_id) {
                members.remove(&connection_id);
                if members.is_empty() {
                    state.rooms.remove(&conversation_id);
                }
            }

            let last_for_user =
                user_connection_count(&state, conversation_id, record.user_id) == 0;
            departures.push(RoomDeparture {
                conversation_id,
                user_id: record.user_id,
                last_for_user,
            });
        }

        departures
    }

    pub async fn identity(&self, connection_id: ConnectionId) -> Option<(Uuid, String)> {
        self.state
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|record| (record.user_id, record.display_name.clone()))
    }

    pub async fn is_member(&self, connection_id: ConnectionId, conversation_id: Uuid) -> bool {
        self.state
            .read()
            .await
            .rooms
            .get(&conversation_id)
            .is_some_and(|members| members.contains(&connection_id))
    }

    /// Unique users currently joined to a conversation.
    pub async fn members(&self, conversation_id: Uuid) -> Vec<PresenceUser> {
        room_members(&*self.state.read().await, conversation_id)
    }

    /// True when the user has at least one live connection anywhere.
    pub async fn user_is_connected(&self, user_id: Uuid) -> bool {
        self.state.read().await.connections.values().any(|record| record.user_id == user_id)
    }

    /// Sends to a single connection. Returns false when the connection
    /// is gone (already cleaned up).
    pub async fn send_to_connection(
        &self,
        connection_id: ConnectionId,
        event: ServerEvent,
    ) -> bool {
        let sender = {
            let state = self.state.read().await;
            state.connections.get(&connection_id).map(|record| record.outbound.clone())
        };
        sender.is_some_and(|sender| sender.send(event).is_ok())
    }

    /// Sends to every live connection of a user, room membership aside.
    /// Best-effort: returns the number of connections reached.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) -> usize {
        let recipients: Vec<_> = {
            let state = self.state.read().await;
            state
                .connections
                .values()
                .filter(|record| record.user_id == user_id)
                .map(|record| record.outbound.clone())
                .collect()
        };

        recipients.into_iter().filter(|sender| sender.send(event.clone()).is_ok()).count()
    }

    /// Broadcasts to every current member connection of a room.
    pub async fn broadcast_to_room(&self, conversation_id: Uuid, event: ServerEvent) -> usize {
        self.broadcast_filtered(conversation_id, event, |_, _| true).await
    }

    /// Broadcasts to every member connection except those owned by
    /// `excluded_user` (e.g. typing events never echo to the typist).
    pub async fn broadcast_to_room_excluding_user(
        &self,
        conversation_id: Uuid,
        excluded_user: Uuid,
        event: ServerEvent,
    ) -> usize {
        self.broadcast_filtered(conversation_id, event, |_, user_id| user_id != excluded_user)
            .await
    }

    /// Broadcasts to every member connection except one. Used when the
    /// originating connection gets its own tailored copy of the event.
    pub async fn broadcast_to_room_excluding_connection(
        &self,
        conversation_id: Uuid,
        excluded_connection: ConnectionId,
        event: ServerEvent,
    ) -> usize {
        self.broadcast_filtered(conversation_id, event, |connection_id, _| {
            connection_id != excluded_connection
        })
        .await
    }

    async fn broadcast_filtered<F>(
        &self,
        conversation_id: Uuid,
        event: ServerEvent,
        include: F,
    ) -> usize
    where
        F: Fn(ConnectionId, Uuid) -> bool,
    {
        // Snapshot recipients under the read lock, send after releasing it.
        let recipients: Vec<_> = {
            let state = self.state.read().await;
            let Some(members) = state.rooms.get(&conversation_id) else {
                return 0;
            };
            members
                .iter()
                .filter_map(|connection_id| {
                    state.connections.get(connection_id).map(|record| (*connection_id, record))
                })
                .filter(|(connection_id, record)| include(*connection_id, record.user_id))
                .map(|(_, record)| record.outbound.clone())
                .collect()
        };

        recipients.into_iter().filter(|sender| sender.send(event.clone()).is_ok()).count()
    }
}

fn user_connection_count(state: &RegistryState, conversation_id: Uuid, user_id: Uuid) -> usize {
    state
        .rooms
        .get(&conversation_id)
        .map(|members| {
            members
                .iter()
                .filter(|connection_id| {
                    state
                        .connections
                        .get(connection_id)
                        .is_some_and(|record| record.user_id == user_id)
                })
                .count()
        })
        .unwrap_or(0)
}

fn room_members(state: &RegistryState, conversation_id: Uuid) -> Vec<PresenceUser> {
    let Some(members) = state.rooms.get(&conversation_id) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut users: Vec<PresenceUser> = members
        .iter()
        .filter_map(|connection_id| state.connections.get(connection_id))
        .filter(|record| seen.insert(record.user_id))
        .map(|record| PresenceUser {
            user_id: record.user_id,
            display_name: record.display_name.clone(),
        })
        .collect();
    users.sort_by_key(|user| user.user_id);
    users
}
