// Typing State Machine
//
// Per (conversation, user) ephemeral state: idle -> typing -> idle via
// explicit stop, timer expiry, or disconnect. Broadcasts are
// edge-triggered: only the idle->typing and typing->idle transitions
// emit a `user:typing` event, never a renewal.
//
// Each live entry owns exactly one expiry timer. Arming a new timer
// atomically cancels the prior one for the same key (abort + generation
// bump), so a raced abort can never double-fire.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use agora_common::protocol::ws::ServerEvent;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::registry::ConnectionRegistry;

/// How long a typing indicator survives without renewal.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct TypingEntry {
    generation: u64,
    abort: AbortHandle,
}

/// Tracks who is typing where, with automatic expiry.
#[derive(Clone)]
pub struct TypingTracker {
    registry: Arc<ConnectionRegistry>,
    entries: Arc<Mutex<HashMap<(Uuid, Uuid), TypingEntry>>>,
    generations: Arc<AtomicU64>,
    expiry: Duration,
}

impl TypingTracker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_expiry(registry, TYPING_EXPIRY)
    }

    pub fn with_expiry(registry: Arc<ConnectionRegistry>, expiry: Duration) -> Self {
        Self {
            registry,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            expiry,
        }
    }

    /// idle -> typing: broadcasts `typing=true` to the other room
    /// members and arms the expiry timer. Already typing: resets the
    /// timer without re-broadcasting.
    pub async fn start(&self, conversation_id: Uuid, user_id: Uuid) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let abort = self.spawn_expiry(conversation_id, user_id, generation);

        let was_idle = {
            let mut entries = self.entries.lock().await;
            let previous =
                entries.insert((conversation_id, user_id), TypingEntry { generation, abort });
            match previous {
                Some(entry) => {
                    entry.abort.abort();
                    false
                }
                None => true,
            }
        };

        if was_idle {
            self.broadcast_typing(conversation_id, user_id, true).await;
        }
    }

    /// typing -> idle: cancels the timer and broadcasts `typing=false`.
    /// No-op when already idle.
    pub async fn stop(&self, conversation_id: Uuid, user_id: Uuid) {
        let was_typing = {
            let mut entries = self.entries.lock().await;
            match entries.remove(&(conversation_id, user_id)) {
                Some(entry) => {
                    entry.abort.abort();
                    true
                }
                None => false,
            }
        };

        if was_typing {
            self.broadcast_typing(conversation_id, user_id, false).await;
        }
    }

    /// Whether (conversation, user) currently has a live typing entry.
    pub async fn is_typing(&self, conversation_id: Uuid, user_id: Uuid) -> bool {
        self.entries.lock().await.contains_key(&(conversation_id, user_id))
    }

    /// Number of live entries across all conversations. A non-zero value
    /// after all owners disconnected indicates a leaked timer.
    pub async fn live_entries(&self) -> usize {
        self.entries.lock().await.len()
    }

    fn spawn_expiry(&self, conversation_id: Uuid, user_id: Uuid, generation: u64) -> AbortHandle {
        let tracker = self.clone();
        let expiry = self.expiry;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            tracker.expire(conversation_id, user_id, generation).await;
        });
        handle.abort_handle()
    }

    /// Timer completion path: behaves exactly like `stop`, but only if
    /// the firing timer is still the current one for its key.
    async fn expire(&self, conversation_id: Uuid, user_id: Uuid, generation: u64) {
        let still_current = {
            let mut entries = self.entries.lock().await;
            match entries.get(&(conversation_id, user_id)) {
                Some(entry) if entry.generation == generation => {
                    entries.remove(&(conversation_id, user_id));
                    true
                }
                _ => false,
            }
        };

        if still_current {
            self.broadcast_typing(conversation_id, user_id, false).await;
        }
    }

    async fn broadcast_typing(&self, conversation_id: Uuid, user_id: Uuid, typing: bool) {
        self.registry
            .broadcast_to_room_excluding_user(
                conversation_id,
                user_id,
                ServerEvent::UserTyping { conversation_id, user_id, typing },
            )
            .await;
    }
}
