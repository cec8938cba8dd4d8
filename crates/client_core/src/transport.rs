use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use url::Url;

/// Close code of a clean, intentional shutdown.
pub const NORMAL_CLOSE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<u16>),
}

/// One live push connection.
#[async_trait]
pub trait PushConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    /// `None` once the underlying stream has ended.
    async fn next_frame(&mut self) -> Option<Result<InboundFrame>>;
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Box<dyn PushConnection>>;
}

pub struct MissingPushConnector;

#[async_trait]
impl PushConnector for MissingPushConnector {
    async fn connect(&self, _token: &str) -> Result<Box<dyn PushConnection>> {
        Err(anyhow!("push channel endpoint is unavailable"))
    }
}

/// Websocket push connector; the bearer credential travels as a `token` query parameter.
pub struct WsPushConnector {
    endpoint: String,
}

impl WsPushConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn socket_url(&self, token: &str) -> Result<Url> {
        let endpoint = self.endpoint.trim();
        let ws_url = if let Some(rest) = endpoint.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = endpoint.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            endpoint.to_string()
        } else {
            return Err(anyhow!(
                "push endpoint must start with http://, https://, ws:// or wss://"
            ));
        };
        let mut url = Url::parse(&ws_url)
            .with_context(|| format!("invalid push endpoint: {}", self.endpoint))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

#[async_trait]
impl PushConnector for WsPushConnector {
    async fn connect(&self, token: &str) -> Result<Box<dyn PushConnection>> {
        let url = self.socket_url(token)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.endpoint))?;
        Ok(Box::new(WsPushConnection { stream }))
    }
}

pub struct WsPushConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for WsPushConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .context("websocket send failed")
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(anyhow!("websocket receive failed: {err}"))),
            };
            let frame = match message {
                WsMessage::Text(text) => InboundFrame::Text(text),
                WsMessage::Binary(bytes) => InboundFrame::Binary(bytes),
                WsMessage::Close(frame) => InboundFrame::Close(frame.map(|f| u16::from(f.code))),
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .context("websocket close failed")
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
