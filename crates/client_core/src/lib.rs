use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        Attachment, ConversationContext, Direction, Message, MessageKind, ERROR_NOTICE_ID_PREFIX,
        TEMP_ID_PREFIX,
    },
    protocol::{MessageEvent, NotificationPayload, PushFrame, SendAck},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod poller;
pub mod store;
pub mod tracker;
pub mod transport;

pub use api::{
    ConversationApi, HttpConversationApi, ImageUpload, MissingConversationApi,
    MissingTokenProvider, StaticTokenProvider, TokenProvider,
};
pub use channel::ChannelStatus;
pub use config::{load_settings, SyncSettings};
pub use error::SyncError;
pub use transport::{MissingPushConnector, PushConnector, WsPushConnector};

use channel::{ChannelConfig, ChannelEvent, ChannelSession, ChannelSink};
use poller::{PollEvent, PollSink, PollingDriver};
use store::MessageStore;
use tracker::{OptimisticSendTracker, SendFingerprint};

/// Leading text of the notice that replaces a rejected send.
pub const SEND_FAILURE_PREFIX: &str = "Failed to send: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryStatus {
    #[default]
    Idle,
    Loading,
    Loaded,
    /// The last load failed; `retry_history` may be called.
    Failed,
}

/// Status snapshot for connection indicators.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub is_live: bool,
    pub is_polling: bool,
    pub last_error: Option<String>,
    pub channel: ChannelStatus,
    pub reconnect_attempt: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub history: HistoryStatus,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    MessagesChanged,
    ConnectionChanged(ConnectionState),
    Notification(NotificationPayload),
    /// A message arrived for a conversation other than the active one.
    ConversationUpdated {
        account_id: String,
        peer_id: String,
    },
    HistoryFailed(String),
    Error(String),
}

/// Keeps the active conversation's message list consistent across history,
/// the push channel, the polling fallback and optimistic sends.
pub struct ConversationSync {
    api: Arc<dyn ConversationApi>,
    connector: Arc<dyn PushConnector>,
    tokens: Arc<dyn TokenProvider>,
    settings: SyncSettings,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
}

struct SyncState {
    context: Option<ConversationContext>,
    /// Bumped on every context change; work tagged with an older value is discarded.
    generation: u64,
    store: MessageStore,
    tracker: OptimisticSendTracker,
    channel: Option<ChannelSession>,
    channel_epoch: u64,
    poller: Option<PollingDriver>,
    poller_epoch: u64,
    history_task: Option<JoinHandle<()>>,
    /// Confirmation deadlines of in-flight optimistic sends, keyed by temp id.
    expiries: HashMap<String, JoinHandle<()>>,
    connection: ConnectionState,
}

impl SyncState {
    fn teardown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.shutdown();
        }
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }
        if let Some(task) = self.history_task.take() {
            task.abort();
        }
        for (_, task) in self.expiries.drain() {
            task.abort();
        }
    }
}

impl ConversationSync {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        connector: Arc<dyn PushConnector>,
        tokens: Arc<dyn TokenProvider>,
        settings: SyncSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let tracker =
            OptimisticSendTracker::new(settings.dedup_window(), settings.recent_send_capacity());
        Arc::new(Self {
            api,
            connector,
            tokens,
            settings,
            inner: Mutex::new(SyncState {
                context: None,
                generation: 0,
                store: MessageStore::new(),
                tracker,
                channel: None,
                channel_epoch: 0,
                poller: None,
                poller_epoch: 0,
                history_task: None,
                expiries: HashMap::new(),
                connection: ConnectionState::default(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn context(&self) -> Option<ConversationContext> {
        self.inner.lock().await.context.clone()
    }

    /// Ordered snapshot of the active conversation.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.store.snapshot()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection.clone()
    }

    /// Switches to `context`: tears down the previous channel, poller and
    /// history fetch, then starts the history load and a fresh push channel
    /// side by side.
    pub async fn set_context(self: &Arc<Self>, context: ConversationContext) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        state.generation += 1;
        let generation = state.generation;
        state.teardown();
        state.store.clear();
        state.tracker.reset();
        state.connection = ConnectionState {
            history: HistoryStatus::Loading,
            ..ConnectionState::default()
        };
        state.context = Some(context.clone());
        info!(
            account_id = %context.account_id,
            peer_id = %context.peer_id,
            conversation_id = %context.conversation_id,
            generation,
            "sync: conversation selected"
        );
        state.history_task = Some(self.spawn_history_load(generation, context));
        self.open_channel_locked(state);
        self.emit(SyncEvent::MessagesChanged);
        self.emit(SyncEvent::ConnectionChanged(state.connection.clone()));
    }

    /// Drops the active conversation and stops all background work.
    pub async fn clear_context(&self) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        state.generation += 1;
        state.teardown();
        state.store.clear();
        state.tracker.reset();
        state.connection = ConnectionState::default();
        if state.context.take().is_some() {
            info!(generation = state.generation, "sync: conversation cleared");
        }
        self.emit(SyncEvent::MessagesChanged);
        self.emit(SyncEvent::ConnectionChanged(state.connection.clone()));
    }

    /// Reloads history for the current conversation after a failed load.
    pub async fn retry_history(self: &Arc<Self>) -> Result<(), SyncError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let context = state.context.clone().ok_or(SyncError::NoContext)?;
        if let Some(task) = state.history_task.take() {
            task.abort();
        }
        state.connection.history = HistoryStatus::Loading;
        state.history_task = Some(self.spawn_history_load(state.generation, context));
        self.emit(SyncEvent::ConnectionChanged(state.connection.clone()));
        Ok(())
    }

    /// Opens a new push channel for the current conversation. Polling, if
    /// active, continues until the new channel reaches `Open`. A live channel
    /// is left alone.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), SyncError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.context.is_none() {
            return Err(SyncError::NoContext);
        }
        let running = state
            .channel
            .as_ref()
            .is_some_and(ChannelSession::is_running);
        if state.connection.is_live && running {
            debug!("sync: channel already live, reconnect skipped");
            return Ok(());
        }
        info!(generation = state.generation, "sync: manual reconnect");
        state.connection.reconnect_attempt = 0;
        self.open_channel_locked(state);
        self.emit(SyncEvent::ConnectionChanged(state.connection.clone()));
        Ok(())
    }

    pub async fn send_text(self: &Arc<Self>, text: &str) -> Result<(), SyncError> {
        if text.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let fingerprint = SendFingerprint::text(text);
        let (generation, context, temp_id) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let context = state.context.clone().ok_or(SyncError::NoContext)?;
            let now = Utc::now();
            let temp_id = state.tracker.next_temp_id(now);
            state
                .tracker
                .record(context.peer_id.as_str(), fingerprint.clone(), Instant::now());
            state
                .store
                .upsert(Message::text(temp_id.clone(), Direction::Out, text, now));
            self.arm_confirmation_expiry(state, &temp_id);
            self.emit(SyncEvent::MessagesChanged);
            (state.generation, context, temp_id)
        };

        let result = self
            .api
            .send_text(&context.account_id, &context.peer_id, text)
            .await;
        self.finish_send(generation, &context, &temp_id, Some(&fingerprint), result)
            .await
    }

    /// Uploads `image` and sends it as a photo message. The echo window starts
    /// once the upload has finished.
    pub async fn send_image(self: &Arc<Self>, image: ImageUpload) -> Result<(), SyncError> {
        let (generation, context, temp_id) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let context = state.context.clone().ok_or(SyncError::NoContext)?;
            let now = Utc::now();
            let temp_id = state.tracker.next_temp_id(now);
            let mut preview = Attachment::photo("");
            preview.description = Some(image.filename.clone());
            state
                .store
                .upsert(Message::photo(temp_id.clone(), Direction::Out, preview, now));
            self.emit(SyncEvent::MessagesChanged);
            (state.generation, context, temp_id)
        };

        let uploaded = match self.api.upload_image(&context.account_id, image).await {
            Ok(uploaded) => uploaded,
            Err(err) => {
                return self
                    .finish_send(generation, &context, &temp_id, None, Err(err))
                    .await
            }
        };

        {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            if state.generation != generation {
                info!(temp_id = %temp_id, "sync: conversation changed during upload, image not sent");
                return Err(SyncError::Superseded);
            }
            state
                .tracker
                .record(context.peer_id.as_str(), SendFingerprint::Image, Instant::now());
            self.arm_confirmation_expiry(state, &temp_id);
            if let Some(url) = uploaded.url.as_deref() {
                if let Some(mut preview) = state.store.get(&temp_id).cloned() {
                    if let Some(attachment) = preview.attachment.as_mut() {
                        attachment.url = url.to_string();
                    }
                    if state.store.upsert(preview).changed() {
                        self.emit(SyncEvent::MessagesChanged);
                    }
                }
            }
        }

        let result = self
            .api
            .send_image(&context.account_id, &context.peer_id, &uploaded.attachment_id)
            .await;
        self.finish_send(
            generation,
            &context,
            &temp_id,
            Some(&SendFingerprint::Image),
            result,
        )
        .await
    }

    async fn finish_send(
        &self,
        generation: u64,
        context: &ConversationContext,
        temp_id: &str,
        recorded: Option<&SendFingerprint>,
        result: anyhow::Result<SendAck>,
    ) -> Result<(), SyncError> {
        let err = match result {
            Ok(ack) => {
                debug!(temp_id, message_id = ?ack.message_id, "sync: send accepted");
                return Ok(());
            }
            Err(err) => SyncError::from_collaborator(err),
        };
        warn!(
            account_id = %context.account_id,
            peer_id = %context.peer_id,
            temp_id,
            "sync: send failed: {err}"
        );

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.generation == generation {
            if let Some(fingerprint) = recorded {
                state.tracker.forget(context.peer_id.as_str(), fingerprint);
            }
            if let Some(expiry) = state.expiries.remove(temp_id) {
                expiry.abort();
            }
            match state.store.remove_by_id(temp_id) {
                Some(provisional) => {
                    state.store.upsert(error_notice(&provisional, &err));
                    self.emit(SyncEvent::MessagesChanged);
                }
                None => debug!(temp_id, "sync: send already confirmed, no error notice"),
            }
        }
        self.emit(SyncEvent::Error(err.to_string()));
        Err(err)
    }

    /// Turns `temp_id` into an error notice if no echo has promoted it once
    /// the dedup window has passed.
    fn arm_confirmation_expiry(self: &Arc<Self>, state: &mut SyncState, temp_id: &str) {
        let sync = Arc::downgrade(self);
        let generation = state.generation;
        let deadline = Instant::now() + self.settings.dedup_window();
        let id = temp_id.to_string();
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(sync) = sync.upgrade() {
                sync.expire_send(generation, &id).await;
            }
        });
        if let Some(previous) = state.expiries.insert(temp_id.to_string(), task) {
            previous.abort();
        }
    }

    async fn expire_send(&self, generation: u64, temp_id: &str) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.generation != generation {
            return;
        }
        state.expiries.remove(temp_id);
        let Some(provisional) = state.store.remove_by_id(temp_id) else {
            return;
        };
        let err = SyncError::Unconfirmed;
        warn!(temp_id, "sync: send not confirmed within the echo window");
        state.store.upsert(error_notice(&provisional, &err));
        self.emit(SyncEvent::MessagesChanged);
        self.emit(SyncEvent::Error(err.to_string()));
    }

    fn spawn_history_load(
        self: &Arc<Self>,
        generation: u64,
        context: ConversationContext,
    ) -> JoinHandle<()> {
        let sync = Arc::downgrade(self);
        let api = Arc::clone(&self.api);
        let limit = self.settings.history_limit();
        let deadline = self.settings.request_timeout();
        tokio::spawn(async move {
            let fetch = api.fetch_messages(&context.account_id, &context.conversation_id, limit);
            let result = match timeout(deadline, fetch).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("history request timed out after {deadline:?}")),
            };
            if let Some(sync) = sync.upgrade() {
                sync.apply_history(generation, result).await;
            }
        })
    }

    /// Returns false when the result belongs to a superseded context.
    async fn apply_history(
        &self,
        generation: u64,
        result: anyhow::Result<Vec<Message>>,
    ) -> bool {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.generation != generation {
            debug!(generation, "sync: discarding stale history response");
            return false;
        }
        match result {
            Ok(page) => {
                // everything already in the store arrived live for this context
                let live = state.store.snapshot();
                let count = page.len();
                state.store.replace_all(page);
                for message in live {
                    state.store.upsert(message);
                }
                state.connection.history = HistoryStatus::Loaded;
                debug!(generation, count, "sync: history loaded");
                self.emit(SyncEvent::MessagesChanged);
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(generation, "sync: history load failed: {reason}");
                state.connection.history = HistoryStatus::Failed;
                state.connection.last_error = Some(reason.clone());
                self.emit(SyncEvent::HistoryFailed(reason));
            }
        }
        self.emit(SyncEvent::ConnectionChanged(state.connection.clone()));
        true
    }

    fn open_channel_locked(self: &Arc<Self>, state: &mut SyncState) {
        if let Some(mut previous) = state.channel.take() {
            previous.shutdown();
        }
        state.channel_epoch += 1;
        let sink = Arc::new(ContextSink {
            sync: Arc::downgrade(self),
            generation: state.generation,
            epoch: state.channel_epoch,
        });
        state.channel = Some(ChannelSession::spawn(
            Arc::clone(&self.connector),
            Arc::clone(&self.tokens),
            ChannelConfig::from(&self.settings),
            sink,
        ));
    }

    fn start_polling_locked(self: &Arc<Self>, state: &mut SyncState) {
        if state.poller.as_ref().is_some_and(PollingDriver::is_running) {
            return;
        }
        let Some(context) = state.context.clone() else {
            return;
        };
        state.poller_epoch += 1;
        let sink = Arc::new(ContextSink {
            sync: Arc::downgrade(self),
            generation: state.generation,
            epoch: state.poller_epoch,
        });
        let last_seen = state.store.latest_confirmed_id().map(str::to_string);
        warn!(
            account_id = %context.account_id,
            peer_id = %context.peer_id,
            "sync: push channel failed, falling back to polling"
        );
        state.poller = Some(PollingDriver::spawn(
            Arc::clone(&self.api),
            context,
            self.settings.history_limit(),
            self.settings.poll_interval(),
            last_seen,
            sink,
        ));
        state.connection.is_polling = true;
    }

    async fn on_channel_event(self: &Arc<Self>, generation: u64, epoch: u64, event: ChannelEvent) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.generation != generation || state.channel_epoch != epoch {
            return;
        }
        match event {
            ChannelEvent::Status(status) => {
                state.connection.channel = status;
                state.connection.is_live = status == ChannelStatus::Open;
                match status {
                    ChannelStatus::Open => {
                        state.connection.reconnect_attempt = 0;
                        state.connection.last_error = None;
                        if let Some(mut poller) = state.poller.take() {
                            info!("sync: push channel restored, polling stopped");
                            poller.stop();
                        }
                        state.connection.is_polling = false;
                    }
                    ChannelStatus::Reconnecting { attempt } => {
                        state.connection.reconnect_attempt = attempt;
                    }
                    ChannelStatus::Failed => self.start_polling_locked(state),
                    ChannelStatus::Idle | ChannelStatus::Connecting => {}
                }
            }
            ChannelEvent::Heartbeat(at) => state.connection.last_heartbeat_at = Some(at),
            ChannelEvent::TransportError(reason) => state.connection.last_error = Some(reason),
            ChannelEvent::Frame(frame) => {
                self.apply_frame(state, frame);
                return;
            }
        }
        self.emit(SyncEvent::ConnectionChanged(state.connection.clone()));
    }

    async fn on_poll_event(&self, generation: u64, epoch: u64, event: PollEvent) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.generation != generation || state.poller_epoch != epoch {
            return;
        }
        match event {
            PollEvent::Fetched(messages) => {
                let mut changed = false;
                for message in messages {
                    changed |= self.apply_inbound(state, message);
                }
                if changed {
                    self.emit(SyncEvent::MessagesChanged);
                }
            }
            PollEvent::Failed(reason) => {
                state.connection.last_error = Some(reason);
                self.emit(SyncEvent::ConnectionChanged(state.connection.clone()));
            }
        }
    }

    fn apply_frame(&self, state: &mut SyncState, frame: PushFrame) {
        match frame {
            PushFrame::Notification(notification) => {
                self.emit(SyncEvent::Notification(notification));
            }
            PushFrame::Ack(ack) => {
                debug!(message_id = ?ack.message_id, status = ?ack.status, "sync: send acknowledged");
            }
            frame => {
                if let Some(event) = frame.into_message_event() {
                    self.apply_message_event(state, event);
                }
            }
        }
    }

    fn apply_message_event(&self, state: &mut SyncState, event: MessageEvent) {
        let Some(context) = state.context.as_ref() else {
            return;
        };
        if !event.matches(context) {
            debug!(
                account_id = %event.account_id,
                peer_id = %event.peer_id(),
                "sync: message for another conversation"
            );
            self.emit(SyncEvent::ConversationUpdated {
                account_id: event.account_id.clone(),
                peer_id: event.peer_id().to_string(),
            });
            return;
        }
        // a re-delivery without a timestamp keeps the stored one
        let received_at = event
            .id
            .as_deref()
            .and_then(|id| state.store.get(id))
            .map_or_else(Utc::now, |known| known.timestamp);
        if self.apply_inbound(state, event.into_message(received_at)) {
            self.emit(SyncEvent::MessagesChanged);
        }
    }

    /// Shared landing point for push and poll messages.
    fn apply_inbound(&self, state: &mut SyncState, message: Message) -> bool {
        let Some(peer) = state.context.as_ref().map(|c| c.peer_id.clone()) else {
            return false;
        };
        state
            .tracker
            .reconcile(&mut state.store, peer.as_str(), message, Instant::now())
            .changed()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for ConversationSync {
    fn drop(&mut self) {
        self.inner.get_mut().teardown();
    }
}

fn error_notice(provisional: &Message, err: &SyncError) -> Message {
    let suffix = provisional
        .id
        .strip_prefix(TEMP_ID_PREFIX)
        .unwrap_or(&provisional.id);
    Message {
        id: format!("{ERROR_NOTICE_ID_PREFIX}{suffix}"),
        direction: Direction::Out,
        kind: MessageKind::ErrorNotice,
        text: Some(format!("{SEND_FAILURE_PREFIX}{err}")),
        attachment: None,
        timestamp: provisional.timestamp,
    }
}

/// Routes channel and poll events back to the controller, tagged with the
/// context generation and session they were spawned for.
struct ContextSink {
    sync: Weak<ConversationSync>,
    generation: u64,
    epoch: u64,
}

#[async_trait]
impl ChannelSink for ContextSink {
    async fn deliver(&self, event: ChannelEvent) {
        if let Some(sync) = self.sync.upgrade() {
            sync.on_channel_event(self.generation, self.epoch, event)
                .await;
        }
    }
}

#[async_trait]
impl PollSink for ContextSink {
    async fn deliver_poll(&self, event: PollEvent) {
        if let Some(sync) = self.sync.upgrade() {
            sync.on_poll_event(self.generation, self.epoch, event).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
