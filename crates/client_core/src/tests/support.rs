//! In-memory collaborators shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{AccountId, ConversationId, Direction, Message, PeerId},
    error::ApiException,
    protocol::{SendAck, UploadImageResponse},
};
use tokio::{
    sync::{mpsc, Notify},
    time::{sleep, Duration},
};

use crate::{
    api::{ConversationApi, ImageUpload, TokenProvider},
    channel::{ChannelEvent, ChannelSink, ChannelStatus},
    poller::{PollEvent, PollSink},
    transport::{InboundFrame, PushConnection, PushConnector},
};

pub(crate) fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn confirmed(id: &str, direction: Direction, text: &str, seconds: i64) -> Message {
    Message::text(id, direction, text, ts(seconds))
}

pub(crate) struct FakeConnection {
    inbound: mpsc::UnboundedReceiver<Result<InboundFrame>>,
    sent: Arc<StdMutex<Vec<String>>>,
    dropped: Arc<AtomicBool>,
}

/// Test-side end of a [`FakeConnection`].
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    inbound: mpsc::UnboundedSender<Result<InboundFrame>>,
    sent: Arc<StdMutex<Vec<String>>>,
    dropped: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn push_text(&self, text: impl Into<String>) {
        self.push(InboundFrame::Text(text.into()));
    }

    pub fn push(&self, frame: InboundFrame) {
        let _ = self.inbound.send(Ok(frame));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.inbound.send(Err(anyhow!(reason.to_string())));
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

pub(crate) fn fake_connection() -> (FakeConnection, ConnectionHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(StdMutex::new(Vec::new()));
    let dropped = Arc::new(AtomicBool::new(false));
    (
        FakeConnection {
            inbound: rx,
            sent: sent.clone(),
            dropped: dropped.clone(),
        },
        ConnectionHandle {
            inbound: tx,
            sent,
            dropped,
        },
    )
}

#[async_trait]
impl PushConnection for FakeConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sent.lock().expect("sent lock").push(text);
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

enum ConnectStep {
    Refuse,
    Accept(FakeConnection),
}

/// Connector that replays a queue of outcomes and refuses once the queue is empty.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    steps: StdMutex<VecDeque<ConnectStep>>,
    tokens: StdMutex<Vec<String>>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn accept_next(&self) -> ConnectionHandle {
        let (connection, handle) = fake_connection();
        self.steps
            .lock()
            .expect("steps lock")
            .push_back(ConnectStep::Accept(connection));
        handle
    }

    pub fn refuse_next(&self) {
        self.steps
            .lock()
            .expect("steps lock")
            .push_back(ConnectStep::Refuse);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().expect("tokens lock").clone()
    }
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn connect(&self, token: &str) -> Result<Box<dyn PushConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .expect("tokens lock")
            .push(token.to_string());
        let step = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .unwrap_or(ConnectStep::Refuse);
        match step {
            ConnectStep::Accept(connection) => Ok(Box::new(connection)),
            ConnectStep::Refuse => Err(anyhow!("connection refused")),
        }
    }
}

/// Hands out `token-1`, `token-2`, ... so tests can tell fetches apart.
#[derive(Default)]
pub(crate) struct CountingTokens {
    issued: AtomicUsize,
}

#[async_trait]
impl TokenProvider for CountingTokens {
    async fn bearer_token(&self) -> Result<String> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("token-{n}"))
    }
}

pub(crate) struct RecordingChannelSink {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl RecordingChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl ChannelSink for RecordingChannelSink {
    async fn deliver(&self, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }
}

pub(crate) async fn next_status(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelStatus {
    loop {
        match rx.recv().await.expect("channel event") {
            ChannelEvent::Status(status) => return status,
            _ => continue,
        }
    }
}

pub(crate) struct RecordingPollSink {
    tx: mpsc::UnboundedSender<PollEvent>,
}

impl RecordingPollSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PollEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl PollSink for RecordingPollSink {
    async fn deliver_poll(&self, event: PollEvent) {
        let _ = self.tx.send(event);
    }
}

/// Scriptable conversation backend.
#[derive(Default)]
pub(crate) struct FakeApi {
    histories: StdMutex<HashMap<String, Vec<Message>>>,
    history_delays: StdMutex<HashMap<String, Duration>>,
    failing_fetches: AtomicUsize,
    fetches: AtomicUsize,
    send_failures: StdMutex<VecDeque<ApiException>>,
    send_gate: StdMutex<Option<Arc<Notify>>>,
    sent_texts: StdMutex<Vec<(String, String)>>,
    sent_images: StdMutex<Vec<(String, String)>>,
    uploads: AtomicUsize,
    upload_delay: StdMutex<Option<Duration>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_history(&self, conversation: &str, messages: Vec<Message>) {
        self.histories
            .lock()
            .expect("history lock")
            .insert(conversation.to_string(), messages);
    }

    pub fn push_history(&self, conversation: &str, message: Message) {
        self.histories
            .lock()
            .expect("history lock")
            .entry(conversation.to_string())
            .or_default()
            .push(message);
    }

    pub fn delay_history(&self, conversation: &str, delay: Duration) {
        self.history_delays
            .lock()
            .expect("delay lock")
            .insert(conversation.to_string(), delay);
    }

    /// The next `count` history fetches fail.
    pub fn fail_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn reject_next_send(&self, err: ApiException) {
        self.send_failures
            .lock()
            .expect("send failures lock")
            .push_back(err);
    }

    /// Holds every send until the returned notifier is triggered.
    pub fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().expect("gate lock") = Some(gate.clone());
        gate
    }

    pub fn sent_texts(&self) -> Vec<(String, String)> {
        self.sent_texts.lock().expect("sent lock").clone()
    }

    pub fn sent_images(&self) -> Vec<(String, String)> {
        self.sent_images.lock().expect("sent lock").clone()
    }

    pub fn delay_uploads(&self, delay: Duration) {
        *self.upload_delay.lock().expect("upload delay lock") = Some(delay);
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) {
        let gate = self.send_gate.lock().expect("gate lock").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn next_send_failure(&self) -> Option<ApiException> {
        self.send_failures
            .lock()
            .expect("send failures lock")
            .pop_front()
    }
}

#[async_trait]
impl ConversationApi for FakeApi {
    async fn fetch_messages(
        &self,
        _account_id: &AccountId,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .history_delays
            .lock()
            .expect("delay lock")
            .get(conversation_id.as_str())
            .copied();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let failing = self.failing_fetches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_fetches.store(failing - 1, Ordering::SeqCst);
            return Err(anyhow!("history backend unavailable"));
        }
        let mut page = self
            .histories
            .lock()
            .expect("history lock")
            .get(conversation_id.as_str())
            .cloned()
            .unwrap_or_default();
        // newest first, like the real backend
        page.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn send_text(&self, _account_id: &AccountId, peer_id: &PeerId, text: &str) -> Result<SendAck> {
        self.pass_gate().await;
        if let Some(err) = self.next_send_failure() {
            return Err(err.into());
        }
        self.sent_texts
            .lock()
            .expect("sent lock")
            .push((peer_id.to_string(), text.to_string()));
        Ok(SendAck { message_id: None })
    }

    async fn send_image(
        &self,
        _account_id: &AccountId,
        peer_id: &PeerId,
        attachment_id: &str,
    ) -> Result<SendAck> {
        self.pass_gate().await;
        if let Some(err) = self.next_send_failure() {
            return Err(err.into());
        }
        self.sent_images
            .lock()
            .expect("sent lock")
            .push((peer_id.to_string(), attachment_id.to_string()));
        Ok(SendAck { message_id: None })
    }

    async fn upload_image(
        &self,
        _account_id: &AccountId,
        image: ImageUpload,
    ) -> Result<UploadImageResponse> {
        let delay = *self.upload_delay.lock().expect("upload delay lock");
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(UploadImageResponse {
            attachment_id: format!("att-{n}"),
            url: Some(format!("https://cdn.example/{}", image.filename)),
        })
    }
}

/// A `new_message` frame as the push server would send it.
pub(crate) fn message_frame(
    id: &str,
    account: &str,
    peer: &str,
    direction: Direction,
    text: &str,
    seconds: i64,
) -> String {
    let (sender, recipient) = match direction {
        Direction::Out => (account, peer),
        Direction::In => (peer, account),
    };
    serde_json::json!({
        "type": "new_message",
        "payload": {
            "id": id,
            "account_id": account,
            "sender_id": sender,
            "recipient_id": recipient,
            "direction": direction,
            "text": text,
            "timestamp": ts(seconds),
        }
    })
    .to_string()
}
