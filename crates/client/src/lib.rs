//! Client-side reconciliation for the agora-chat.v1 protocol.
//!
//! Sending is optimistic: the UI renders a placeholder immediately and
//! the server's authoritative record replaces it later, correlated by
//! a client-generated `temp_id`. This crate keeps that bookkeeping in
//! one place so the push path (`message:new` frames) and the fallback
//! path (REST responses) reconcile identically.

use agora_common::types::Message;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// How a send leaves the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Live WebSocket; the ack arrives as a `message:new` frame.
    Push,
    /// REST `POST /v1/messages`; the ack is the response body.
    Fallback,
}

impl DeliveryPath {
    pub fn select(socket_connected: bool) -> Self {
        if socket_connected {
            Self::Push
        } else {
            Self::Fallback
        }
    }
}

/// An unsent message as the user composed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub content: Option<String>,
    pub attachment_url: Option<String>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: Some(content.into()), attachment_url: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderStatus {
    Sending,
    Failed { error: String },
}

/// A locally rendered message awaiting its authoritative record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub temp_id: String,
    pub draft: MessageDraft,
    pub submitted_at: DateTime<Utc>,
    pub status: PlaceholderStatus,
}

/// One row of the conversation timeline as the UI should render it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    Pending(Placeholder),
    Confirmed(Message),
}

impl TimelineEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Per-conversation send bookkeeping.
///
/// Invariant: at most one timeline entry per `temp_id` and per
/// authoritative message id, whatever order acks and broadcasts
/// arrive in.
#[derive(Debug)]
pub struct Outbox {
    conversation_id: Uuid,
    entries: Vec<TimelineEntry>,
    needs_refetch: bool,
}

impl Outbox {
    pub fn new(conversation_id: Uuid) -> Self {
        Self { conversation_id, entries: Vec::new(), needs_refetch: false }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_pending()).count()
    }

    /// True after a reconnect until `load_history` replays the
    /// server-side state.
    pub fn needs_refetch(&self) -> bool {
        self.needs_refetch
    }

    /// Renders a `Sending` placeholder and returns its correlation id.
    pub fn submit(&mut self, draft: MessageDraft) -> String {
        let temp_id = format!("temp-{}", Uuid::new_v4());
        self.entries.push(TimelineEntry::Pending(Placeholder {
            temp_id: temp_id.clone(),
            draft,
            submitted_at: Utc::now(),
            status: PlaceholderStatus::Sending,
        }));
        temp_id
    }

    /// Feeds an authoritative record in, from either delivery path.
    ///
    /// A matching `temp_id` replaces that placeholder in place; an
    /// unknown or absent `temp_id` appends (a message from another
    /// sender, or our own send acked on the other path first). Records
    /// already present by message id are dropped, so hearing about the
    /// same send twice leaves exactly one entry.
    pub fn resolve(&mut self, message: Message, temp_id: Option<&str>) {
        if message.conversation_id != self.conversation_id {
            return;
        }
        if self.contains_message(message.id) {
            // Second ack for the same record; clear any placeholder it
            // was correlated with and keep the single confirmed entry.
            if let Some(temp_id) = temp_id {
                self.entries.retain(|entry| {
                    !matches!(entry, TimelineEntry::Pending(p) if p.temp_id == temp_id)
                });
            }
            return;
        }

        let matching_placeholder = temp_id.and_then(|temp_id| {
            self.entries.iter().position(
                |entry| matches!(entry, TimelineEntry::Pending(p) if p.temp_id == temp_id),
            )
        });

        match matching_placeholder {
            Some(index) => self.entries[index] = TimelineEntry::Confirmed(message),
            None => self.entries.push(TimelineEntry::Confirmed(message)),
        }
    }

    /// Marks one placeholder `Failed`. Unknown temp_ids are no-ops:
    /// a failure report must never touch other in-flight sends.
    pub fn fail(&mut self, temp_id: &str, error: impl Into<String>) {
        let failed = self.entries.iter_mut().find_map(|entry| match entry {
            TimelineEntry::Pending(p) if p.temp_id == temp_id => Some(p),
            _ => None,
        });
        if let Some(placeholder) = failed {
            placeholder.status = PlaceholderStatus::Failed { error: error.into() };
        }
    }

    /// Flips a `Failed` placeholder back to `Sending` and hands the
    /// draft back for resubmission. `None` when the temp_id does not
    /// name a failed placeholder.
    pub fn retry(&mut self, temp_id: &str) -> Option<MessageDraft> {
        let placeholder = self.entries.iter_mut().find_map(|entry| match entry {
            TimelineEntry::Pending(p) if p.temp_id == temp_id => Some(p),
            _ => None,
        })?;
        if !matches!(placeholder.status, PlaceholderStatus::Failed { .. }) {
            return None;
        }
        placeholder.status = PlaceholderStatus::Sending;
        Some(placeholder.draft.clone())
    }

    /// Reconnect: the push channel has no outbox, so confirmed state is
    /// stale. Drops it, keeps placeholders (their fate is unknown) and
    /// raises the refetch flag.
    pub fn on_reconnect(&mut self) {
        self.entries.retain(TimelineEntry::is_pending);
        self.needs_refetch = true;
    }

    /// Replays re-fetched history under the surviving placeholders and
    /// clears the refetch flag. Placeholders whose message made it to
    /// the server before the disconnect are resolved by the history
    /// itself only when the caller still holds their temp_id mapping;
    /// everything else stays pending for an explicit retry.
    pub fn load_history(&mut self, messages: Vec<Message>) {
        let placeholders: Vec<TimelineEntry> =
            self.entries.iter().filter(|entry| entry.is_pending()).cloned().collect();
        self.entries = messages
            .into_iter()
            .filter(|message| message.conversation_id == self.conversation_id)
            .map(TimelineEntry::Confirmed)
            .collect();
        self.entries.extend(placeholders);
        self.needs_refetch = false;
    }

    fn contains_message(&self, message_id: Uuid) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry, TimelineEntry::Confirmed(m) if m.id == message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed(conversation_id: Uuid, content: &str) -> Message {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            content: Some(content.to_string()),
            attachment_url: None,
            created_at: now,
            delivered_at: now,
            read_at: None,
        }
    }

    #[test]
    fn submit_renders_a_sending_placeholder() {
        let mut outbox = Outbox::new(Uuid::new_v4());
        let temp_id = outbox.submit(MessageDraft::text("hello"));

        assert_eq!(outbox.entries().len(), 1);
        let TimelineEntry::Pending(placeholder) = &outbox.entries()[0] else {
            panic!("submit should render a placeholder");
        };
        assert_eq!(placeholder.temp_id, temp_id);
        assert_eq!(placeholder.status, PlaceholderStatus::Sending);
    }

    #[test]
    fn resolve_replaces_exactly_the_matching_placeholder() {
        let conversation_id = Uuid::new_v4();
        let mut outbox = Outbox::new(conversation_id);
        let temp_id = outbox.submit(MessageDraft::text("hello"));
        let message = confirmed(conversation_id, "hello");

        outbox.resolve(message.clone(), Some(&temp_id));

        assert_eq!(outbox.entries().len(), 1, "no duplicate remains");
        assert_eq!(outbox.entries()[0], TimelineEntry::Confirmed(message));
    }

    #[test]
    fn resolve_without_temp_id_appends() {
        let conversation_id = Uuid::new_v4();
        let mut outbox = Outbox::new(conversation_id);
        let temp_id = outbox.submit(MessageDraft::text("mine"));

        // Someone else's message arrives while ours is in flight.
        outbox.resolve(confirmed(conversation_id, "theirs"), None);

        assert_eq!(outbox.entries().len(), 2);
        assert_eq!(outbox.pending_count(), 1);
        // Our placeholder is untouched.
        assert!(matches!(
            &outbox.entries()[0],
            TimelineEntry::Pending(p) if p.temp_id == temp_id
        ));
    }

    #[test]
    fn both_delivery_paths_reporting_the_same_record_leave_one_entry() {
        let conversation_id = Uuid::new_v4();
        let mut outbox = Outbox::new(conversation_id);
        let temp_id = outbox.submit(MessageDraft::text("hello"));
        let message = confirmed(conversation_id, "hello");

        // Fallback response first, push broadcast second.
        outbox.resolve(message.clone(), Some(&temp_id));
        outbox.resolve(message.clone(), Some(&temp_id));

        assert_eq!(outbox.entries().len(), 1);

        // And the reverse arrival order: broadcast without the temp_id
        // first, then the correlated ack.
        let mut outbox = Outbox::new(conversation_id);
        let temp_id = outbox.submit(MessageDraft::text("hello"));
        outbox.resolve(message.clone(), None);
        outbox.resolve(message, Some(&temp_id));

        assert_eq!(outbox.entries().len(), 1);
        assert_eq!(outbox.pending_count(), 0);
    }

    #[test]
    fn fail_marks_only_the_named_placeholder() {
        let conversation_id = Uuid::new_v4();
        let mut outbox = Outbox::new(conversation_id);
        let failing = outbox.submit(MessageDraft::text("first"));
        let surviving = outbox.submit(MessageDraft::text("second"));

        outbox.fail(&failing, "server could not persist data");

        let statuses: Vec<_> = outbox
            .entries()
            .iter()
            .filter_map(|entry| match entry {
                TimelineEntry::Pending(p) => Some((p.temp_id.clone(), p.status.clone())),
                _ => None,
            })
            .collect();
        assert!(matches!(&statuses[0], (id, PlaceholderStatus::Failed { .. }) if *id == failing));
        assert!(
            matches!(&statuses[1], (id, PlaceholderStatus::Sending) if *id == surviving),
            "other in-flight sends stay untouched"
        );
    }

    #[test]
    fn unknown_temp_ids_are_noops() {
        let conversation_id = Uuid::new_v4();
        let mut outbox = Outbox::new(conversation_id);
        outbox.submit(MessageDraft::text("hello"));
        let before = outbox.entries().to_vec();

        outbox.fail("temp-nope", "whatever");
        assert_eq!(outbox.entries(), &before[..]);
        assert!(outbox.retry("temp-nope").is_none());
    }

    #[test]
    fn retry_revives_only_failed_placeholders() {
        let mut outbox = Outbox::new(Uuid::new_v4());
        let temp_id = outbox.submit(MessageDraft::text("hello"));

        // Still sending: nothing to retry.
        assert!(outbox.retry(&temp_id).is_none());

        outbox.fail(&temp_id, "timeout");
        let draft = outbox.retry(&temp_id).expect("failed placeholder should be retryable");
        assert_eq!(draft.content.as_deref(), Some("hello"));
        assert!(matches!(
            &outbox.entries()[0],
            TimelineEntry::Pending(p) if p.status == PlaceholderStatus::Sending
        ));
    }

    #[test]
    fn messages_for_other_conversations_are_ignored() {
        let mut outbox = Outbox::new(Uuid::new_v4());
        outbox.resolve(confirmed(Uuid::new_v4(), "stray"), None);
        assert!(outbox.entries().is_empty());
    }

    #[test]
    fn reconnect_drops_confirmed_state_and_flags_refetch() {
        let conversation_id = Uuid::new_v4();
        let mut outbox = Outbox::new(conversation_id);
        outbox.resolve(confirmed(conversation_id, "old"), None);
        let temp_id = outbox.submit(MessageDraft::text("in flight"));

        outbox.on_reconnect();

        assert!(outbox.needs_refetch());
        assert_eq!(outbox.entries().len(), 1);
        assert!(matches!(
            &outbox.entries()[0],
            TimelineEntry::Pending(p) if p.temp_id == temp_id
        ));
    }

    #[test]
    fn load_history_replays_server_state_under_placeholders() {
        let conversation_id = Uuid::new_v4();
        let mut outbox = Outbox::new(conversation_id);
        outbox.submit(MessageDraft::text("in flight"));
        outbox.on_reconnect();

        let history = vec![confirmed(conversation_id, "a"), confirmed(conversation_id, "b")];
        outbox.load_history(history);

        assert!(!outbox.needs_refetch());
        assert_eq!(outbox.entries().len(), 3);
        assert!(!outbox.entries()[0].is_pending());
        assert!(!outbox.entries()[1].is_pending());
        assert!(outbox.entries()[2].is_pending(), "placeholder survives the refetch");
    }

    #[test]
    fn delivery_path_follows_connectivity() {
        assert_eq!(DeliveryPath::select(true), DeliveryPath::Push);
        assert_eq!(DeliveryPath::select(false), DeliveryPath::Fallback);
    }
}
