//! Polling fallback used while the push channel is in `Failed`.

use std::sync::Arc;

use async_trait::async_trait;
use shared::domain::{ConversationContext, Message};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::api::ConversationApi;

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// Messages newer than the last one seen, oldest first.
    Fetched(Vec<Message>),
    Failed(String),
}

#[async_trait]
pub trait PollSink: Send + Sync + 'static {
    async fn deliver_poll(&self, event: PollEvent);
}

pub struct PollingDriver {
    task: Option<JoinHandle<()>>,
}

impl PollingDriver {
    pub fn spawn(
        api: Arc<dyn ConversationApi>,
        context: ConversationContext,
        limit: u32,
        period: Duration,
        last_seen_id: Option<String>,
        sink: Arc<dyn PollSink>,
    ) -> Self {
        let task = tokio::spawn(poll_loop(api, context, limit, period, last_seen_id, sink));
        Self { task: Some(task) }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PollingDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    api: Arc<dyn ConversationApi>,
    context: ConversationContext,
    limit: u32,
    period: Duration,
    mut last_seen_id: Option<String>,
    sink: Arc<dyn PollSink>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let page = match api
            .fetch_messages(&context.account_id, &context.conversation_id, limit)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    account_id = %context.account_id,
                    conversation_id = %context.conversation_id,
                    "poll: fetch failed: {err:#}"
                );
                sink.deliver_poll(PollEvent::Failed(format!("{err:#}"))).await;
                continue;
            }
        };

        let fresh = newer_than(page, last_seen_id.as_deref());
        if fresh.is_empty() {
            continue;
        }
        if let Some(newest) = fresh.iter().rev().find(|m| !m.id.is_empty()) {
            last_seen_id = Some(newest.id.clone());
        }
        debug!(count = fresh.len(), "poll: new messages");
        sink.deliver_poll(PollEvent::Fetched(fresh)).await;
    }
}

/// Sorts a fetched page ascending and keeps what follows `last_seen_id`.
/// An unknown or absent marker yields the whole page; the store's id dedup absorbs the overlap.
pub fn newer_than(mut page: Vec<Message>, last_seen_id: Option<&str>) -> Vec<Message> {
    page.sort_by_key(|m| m.timestamp);
    match last_seen_id.and_then(|id| page.iter().position(|m| m.id == id)) {
        Some(index) => page.split_off(index + 1),
        None => page,
    }
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
