//! Ordered, deduplicated message list for the active conversation.
//!
//! Messages are kept sorted by timestamp; messages sharing a timestamp keep
//! their insertion order. Identity is the message id. When an incoming message
//! carries an id the store has never seen, an exact `(timestamp, text,
//! direction)` match against an already confirmed message is treated as a
//! re-delivery and dropped.

use shared::domain::{Direction, Message, MessageKind};
use tracing::{debug, warn};
use uuid::Uuid;

const FALLBACK_ID_PREFIX: &str = "gen-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged,
    Unchanged,
    DuplicateSuppressed,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Merged)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Replaces the whole list, e.g. after a history load.
    pub fn replace_all(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.clear();
        for mut message in messages {
            ensure_id(&mut message);
            match self.position(&message.id) {
                Some(index) => {
                    let merged = merge(&self.messages[index], message);
                    self.messages[index] = merged;
                }
                None => self.messages.push(message),
            }
        }
        // stable: equal timestamps keep their page order
        self.messages.sort_by_key(|m| m.timestamp);
    }

    pub fn upsert(&mut self, mut message: Message) -> UpsertOutcome {
        ensure_id(&mut message);

        if let Some(index) = self.position(&message.id) {
            let existing = &self.messages[index];
            let merged = merge(existing, message);
            if merged == *existing {
                return UpsertOutcome::Unchanged;
            }
            if merged.timestamp == existing.timestamp {
                self.messages[index] = merged;
            } else {
                self.messages.remove(index);
                self.insert_sorted(merged);
            }
            return UpsertOutcome::Merged;
        }

        if let Some(existing) = self.find_redelivery(&message) {
            debug!(
                message_id = %message.id,
                existing_id = %existing.id,
                "store: dropping re-delivered message"
            );
            return UpsertOutcome::DuplicateSuppressed;
        }

        self.insert_sorted(message);
        UpsertOutcome::Inserted
    }

    pub fn remove_by_id(&mut self, id: &str) -> Option<Message> {
        let index = self.position(id)?;
        Some(self.messages.remove(index))
    }

    /// Swaps a provisional message for its confirmed counterpart in one step.
    pub fn promote(&mut self, temp_id: &str, confirmed: Message) -> UpsertOutcome {
        let removed = self.remove_by_id(temp_id);
        let outcome = self.upsert(confirmed);
        if removed.is_some() && !outcome.changed() {
            // the provisional entry is gone, so the visible list still changed
            return UpsertOutcome::Merged;
        }
        outcome
    }

    /// Oldest provisional outgoing text message whose trimmed text equals `text`.
    pub fn find_pending_text(&self, text: &str) -> Option<&Message> {
        let text = text.trim();
        self.messages.iter().find(|m| {
            m.is_provisional()
                && m.direction == Direction::Out
                && m.kind == MessageKind::Text
                && m.normalized_text() == Some(text)
        })
    }

    /// Oldest provisional outgoing photo.
    pub fn find_pending_photo(&self) -> Option<&Message> {
        self.messages.iter().find(|m| {
            m.is_provisional() && m.direction == Direction::Out && m.kind == MessageKind::Photo
        })
    }

    /// Id of the newest server-confirmed message.
    pub fn latest_confirmed_id(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_confirmed())
            .map(|m| m.id.as_str())
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    fn insert_sorted(&mut self, message: Message) {
        let index = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(index, message);
    }

    fn find_redelivery(&self, message: &Message) -> Option<&Message> {
        self.messages.iter().find(|m| {
            m.is_confirmed()
                && m.direction == message.direction
                && m.kind == message.kind
                && m.timestamp == message.timestamp
                && m.normalized_text() == message.normalized_text()
                && m.attachment.as_ref().map(|a| &a.url) == message.attachment.as_ref().map(|a| &a.url)
        })
    }
}

fn ensure_id(message: &mut Message) {
    if message.id.trim().is_empty() {
        message.id = format!("{FALLBACK_ID_PREFIX}{}", Uuid::new_v4());
        warn!(message_id = %message.id, "store: message without id, assigned fallback id");
    }
}

fn merge(existing: &Message, incoming: Message) -> Message {
    Message {
        id: incoming.id,
        direction: incoming.direction,
        kind: incoming.kind,
        text: incoming.text.or_else(|| existing.text.clone()),
        attachment: incoming.attachment.or_else(|| existing.attachment.clone()),
        timestamp: incoming.timestamp,
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
