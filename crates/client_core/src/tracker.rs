//! Optimistic send bookkeeping and echo reconciliation.
//!
//! Servers never echo the client's temporary id, so an outgoing echo is tied
//! back to its optimistic message by content: trimmed text for text sends,
//! the bare "image" marker for photo sends. A recorded send is only
//! reconcilable inside the dedup window; entries are pruned lazily whenever a
//! peer's ledger is touched.
//!
//! Known limitations: two identical texts sent within the window may promote
//! in either order, and any photo echo matches the oldest pending photo. An
//! echo arriving after the window is stored as a new message; by then the
//! controller has already turned the optimistic message into an error notice.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use shared::domain::{Direction, Message, MessageKind, TEMP_ID_PREFIX};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::store::{MessageStore, UpsertOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFingerprint {
    Text(String),
    Image,
}

impl SendFingerprint {
    pub fn text(raw: &str) -> Self {
        SendFingerprint::Text(raw.trim().to_string())
    }

    pub fn of(message: &Message) -> Option<Self> {
        match message.kind {
            MessageKind::Text => message.normalized_text().map(Self::text),
            MessageKind::Photo => Some(SendFingerprint::Image),
            MessageKind::ErrorNotice => None,
        }
    }
}

#[derive(Debug, Clone)]
struct RecentSend {
    fingerprint: SendFingerprint,
    sent_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// An optimistic message was replaced by its confirmed echo.
    Promoted {
        temp_id: String,
        outcome: UpsertOutcome,
    },
    /// No optimistic counterpart; the message went through a plain upsert.
    Applied(UpsertOutcome),
}

impl Reconciliation {
    pub fn changed(&self) -> bool {
        match self {
            Reconciliation::Promoted { .. } => true,
            Reconciliation::Applied(outcome) => outcome.changed(),
        }
    }
}

#[derive(Debug)]
pub struct OptimisticSendTracker {
    window: Duration,
    capacity: usize,
    recent: HashMap<String, VecDeque<RecentSend>>,
    temp_seq: u64,
}

impl OptimisticSendTracker {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            recent: HashMap::new(),
            temp_seq: 0,
        }
    }

    pub fn next_temp_id(&mut self, at: DateTime<Utc>) -> String {
        self.temp_seq += 1;
        format!("{TEMP_ID_PREFIX}{}-{}", at.timestamp_millis(), self.temp_seq)
    }

    pub fn record(&mut self, peer: &str, fingerprint: SendFingerprint, now: Instant) {
        self.prune(peer, now);
        let entries = self.recent.entry(peer.to_string()).or_default();
        entries.push_back(RecentSend {
            fingerprint,
            sent_at: now,
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Drops the most recent matching entry, used when a send is rolled back.
    pub fn forget(&mut self, peer: &str, fingerprint: &SendFingerprint) -> bool {
        let Some(entries) = self.recent.get_mut(peer) else {
            return false;
        };
        let Some(index) = entries.iter().rposition(|e| &e.fingerprint == fingerprint) else {
            return false;
        };
        entries.remove(index);
        true
    }

    /// Consumes the oldest unexpired entry matching `fingerprint`.
    pub fn take_match(&mut self, peer: &str, fingerprint: &SendFingerprint, now: Instant) -> bool {
        self.prune(peer, now);
        let Some(entries) = self.recent.get_mut(peer) else {
            return false;
        };
        let Some(index) = entries.iter().position(|e| &e.fingerprint == fingerprint) else {
            return false;
        };
        entries.remove(index);
        true
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }

    /// Applies a message from the push channel or the poller to the store.
    ///
    /// Outgoing messages that match a recorded send promote the oldest
    /// provisional message with the same content; everything else is upserted.
    pub fn reconcile(
        &mut self,
        store: &mut MessageStore,
        peer: &str,
        message: Message,
        now: Instant,
    ) -> Reconciliation {
        if message.direction == Direction::Out && !store.contains(&message.id) {
            if let Some(fingerprint) = SendFingerprint::of(&message) {
                if self.take_match(peer, &fingerprint, now) {
                    let temp_id = match &fingerprint {
                        SendFingerprint::Text(text) => store.find_pending_text(text),
                        SendFingerprint::Image => store.find_pending_photo(),
                    }
                    .map(|m| m.id.clone());
                    if let Some(temp_id) = temp_id {
                        debug!(
                            peer_id = peer,
                            temp_id = %temp_id,
                            message_id = %message.id,
                            "tracker: promoting optimistic message"
                        );
                        let outcome = store.promote(&temp_id, message);
                        return Reconciliation::Promoted { temp_id, outcome };
                    }
                }
            }
        }
        Reconciliation::Applied(store.upsert(message))
    }

    fn prune(&mut self, peer: &str, now: Instant) {
        let window = self.window;
        if let Some(entries) = self.recent.get_mut(peer) {
            entries.retain(|e| now.saturating_duration_since(e.sent_at) <= window);
            if entries.is_empty() {
                self.recent.remove(peer);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/tracker_tests.rs"]
mod tests;
