//! Push channel client.
//!
//! One [`ChannelSession`] drives one connection for one conversation context
//! through `Idle -> Connecting -> Open -> Reconnecting -> ... -> Idle | Failed`.
//! The session owns a single task; every timer (heartbeat, staleness,
//! reconnect delay) lives inside that task, so aborting it is a complete and
//! synchronous teardown.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::protocol::PushFrame;
use tokio::{
    task::JoinHandle,
    time::{interval_at, sleep, sleep_until, timeout, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    api::TokenProvider,
    config::SyncSettings,
    transport::{InboundFrame, PushConnection, PushConnector, NORMAL_CLOSE},
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting {
        attempt: u32,
    },
    /// Reconnect attempts exhausted; stays here until the context changes.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Heartbeat(DateTime<Utc>),
    Frame(PushFrame),
    TransportError(String),
}

#[async_trait]
pub trait ChannelSink: Send + Sync + 'static {
    async fn deliver(&self, event: ChannelEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl From<&SyncSettings> for ChannelConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval(),
            stale_after: settings.stale_after(),
            reconnect_delay: settings.reconnect_delay(),
            max_reconnect_attempts: settings.max_reconnect_attempts,
        }
    }
}

/// Owner of a running push channel; dropping it tears the channel down.
pub struct ChannelSession {
    task: Option<JoinHandle<()>>,
}

impl ChannelSession {
    pub fn spawn(
        connector: Arc<dyn PushConnector>,
        tokens: Arc<dyn TokenProvider>,
        config: ChannelConfig,
        sink: Arc<dyn ChannelSink>,
    ) -> Self {
        let runner = ChannelRunner {
            connector,
            tokens,
            config,
            sink,
        };
        Self {
            task: Some(tokio::spawn(runner.run())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Aborts the channel task and with it the socket and every timer. Safe to repeat.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum SessionEnd {
    Clean,
    Abnormal(String),
}

struct ChannelRunner {
    connector: Arc<dyn PushConnector>,
    tokens: Arc<dyn TokenProvider>,
    config: ChannelConfig,
    sink: Arc<dyn ChannelSink>,
}

impl ChannelRunner {
    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            self.status(ChannelStatus::Connecting).await;
            let failure = match self.connect().await {
                Ok(connection) => {
                    attempt = 0;
                    info!("channel: open");
                    self.status(ChannelStatus::Open).await;
                    match self.pump(connection).await {
                        SessionEnd::Clean => {
                            info!("channel: closed by server");
                            self.status(ChannelStatus::Idle).await;
                            return;
                        }
                        SessionEnd::Abnormal(reason) => reason,
                    }
                }
                Err(err) => format!("{err:#}"),
            };

            warn!(attempt, reason = %failure, "channel: connection lost");
            self.sink
                .deliver(ChannelEvent::TransportError(failure))
                .await;

            if attempt >= self.config.max_reconnect_attempts {
                warn!(
                    attempts = attempt,
                    "channel: reconnect attempts exhausted, giving up"
                );
                self.status(ChannelStatus::Failed).await;
                return;
            }
            attempt += 1;
            self.status(ChannelStatus::Reconnecting { attempt }).await;
            sleep(self.config.reconnect_delay).await;
        }
    }

    async fn status(&self, status: ChannelStatus) {
        self.sink.deliver(ChannelEvent::Status(status)).await;
    }

    async fn connect(&self) -> Result<Box<dyn PushConnection>> {
        let token = self
            .tokens
            .bearer_token()
            .await
            .context("failed to obtain bearer token for push channel")?;
        self.connector.connect(&token).await
    }

    async fn pump(&self, mut connection: Box<dyn PushConnection>) -> SessionEnd {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            let stale_deadline = last_seen + self.config.stale_after;
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(err) = self.send_ping(connection.as_mut()).await {
                        return SessionEnd::Abnormal(format!("heartbeat send failed: {err:#}"));
                    }
                }
                _ = sleep_until(stale_deadline) => {
                    if timeout(CLOSE_TIMEOUT, connection.close()).await.is_err() {
                        debug!("channel: close of stale connection timed out");
                    }
                    return SessionEnd::Abnormal(format!(
                        "no frames received for {:?}",
                        self.config.stale_after
                    ));
                }
                frame = connection.next_frame() => match frame {
                    None => {
                        return SessionEnd::Abnormal("push stream ended without close frame".into());
                    }
                    Some(Err(err)) => return SessionEnd::Abnormal(format!("{err:#}")),
                    Some(Ok(InboundFrame::Close(code))) => {
                        if code == Some(NORMAL_CLOSE) {
                            return SessionEnd::Clean;
                        }
                        return SessionEnd::Abnormal(format!("closed with code {code:?}"));
                    }
                    Some(Ok(InboundFrame::Text(text))) => {
                        last_seen = Instant::now();
                        self.dispatch(&text).await;
                    }
                    Some(Ok(InboundFrame::Binary(bytes))) => {
                        last_seen = Instant::now();
                        match String::from_utf8(bytes) {
                            Ok(text) => self.dispatch(&text).await,
                            Err(err) => warn!("channel: dropping frame with invalid encoding: {err}"),
                        }
                    }
                },
            }
        }
    }

    async fn send_ping(&self, connection: &mut dyn PushConnection) -> Result<()> {
        let ping = serde_json::to_string(&PushFrame::Ping)?;
        connection.send_text(ping).await
    }

    async fn dispatch(&self, text: &str) {
        let frame = match serde_json::from_str::<PushFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("channel: dropping malformed frame: {err}");
                return;
            }
        };
        debug!(frame_type = frame.type_name(), "channel: frame received");
        match frame {
            PushFrame::Pong => {
                self.sink.deliver(ChannelEvent::Heartbeat(Utc::now())).await;
            }
            PushFrame::Ping => debug!("channel: server ping"),
            PushFrame::Unknown(_) => debug!("channel: ignoring unknown frame"),
            frame => self.sink.deliver(ChannelEvent::Frame(frame)).await,
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
