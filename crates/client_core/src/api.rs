use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, Response};
use shared::{
    domain::{AccountId, ConversationId, Message, PeerId},
    error::{ApiError, ApiException},
    protocol::{
        HistoryPage, SendAck, SendImageRequest, SendTextRequest, UploadImageResponse,
    },
};
use url::Url;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;
}

pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub struct MissingTokenProvider;

#[async_trait]
impl TokenProvider for MissingTokenProvider {
    async fn bearer_token(&self) -> Result<String> {
        Err(anyhow!("no bearer credential available"))
    }
}

#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// REST calls the sync core depends on.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Most recent `limit` messages, in whatever order the backend returns them.
    async fn fetch_messages(
        &self,
        account_id: &AccountId,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>>;
    async fn send_text(&self, account_id: &AccountId, peer_id: &PeerId, text: &str)
        -> Result<SendAck>;
    async fn send_image(
        &self,
        account_id: &AccountId,
        peer_id: &PeerId,
        attachment_id: &str,
    ) -> Result<SendAck>;
    async fn upload_image(
        &self,
        account_id: &AccountId,
        image: ImageUpload,
    ) -> Result<UploadImageResponse>;
}

pub struct MissingConversationApi;

#[async_trait]
impl ConversationApi for MissingConversationApi {
    async fn fetch_messages(
        &self,
        account_id: &AccountId,
        _conversation_id: &ConversationId,
        _limit: u32,
    ) -> Result<Vec<Message>> {
        Err(anyhow!("conversation api unavailable for account {account_id}"))
    }

    async fn send_text(
        &self,
        account_id: &AccountId,
        _peer_id: &PeerId,
        _text: &str,
    ) -> Result<SendAck> {
        Err(anyhow!("conversation api unavailable for account {account_id}"))
    }

    async fn send_image(
        &self,
        account_id: &AccountId,
        _peer_id: &PeerId,
        _attachment_id: &str,
    ) -> Result<SendAck> {
        Err(anyhow!("conversation api unavailable for account {account_id}"))
    }

    async fn upload_image(
        &self,
        account_id: &AccountId,
        _image: ImageUpload,
    ) -> Result<UploadImageResponse> {
        Err(anyhow!("conversation api unavailable for account {account_id}"))
    }
}

pub struct HttpConversationApi {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpConversationApi {
    /// Every request made through this client is abandoned after `request_timeout`.
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            tokens,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid api base url: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("api base url cannot carry a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Turns non-2xx responses into errors, keeping the backend's `{code, message}` body when present.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(ApiException::from(api_error).into()),
        Err(_) => Err(anyhow!("request failed with status {status}: {body}")),
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn fetch_messages(
        &self,
        account_id: &AccountId,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let token = self.tokens.bearer_token().await?;
        let url = self.endpoint(&[
            "accounts",
            account_id.as_str(),
            "conversations",
            conversation_id.as_str(),
            "messages",
        ])?;
        let response = self
            .http
            .get(url)
            .query(&[("limit", limit)])
            .bearer_auth(token)
            .send()
            .await
            .context("failed to fetch conversation messages")?;
        let page: HistoryPage = check_status(response).await?.json().await?;
        Ok(page.into_messages())
    }

    async fn send_text(
        &self,
        account_id: &AccountId,
        peer_id: &PeerId,
        text: &str,
    ) -> Result<SendAck> {
        let token = self.tokens.bearer_token().await?;
        let url = self.endpoint(&["accounts", account_id.as_str(), "messages", "text"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&SendTextRequest {
                peer_id: peer_id.to_string(),
                text: text.to_string(),
            })
            .send()
            .await
            .context("failed to send text message")?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn send_image(
        &self,
        account_id: &AccountId,
        peer_id: &PeerId,
        attachment_id: &str,
    ) -> Result<SendAck> {
        let token = self.tokens.bearer_token().await?;
        let url = self.endpoint(&["accounts", account_id.as_str(), "messages", "image"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&SendImageRequest {
                peer_id: peer_id.to_string(),
                attachment_id: attachment_id.to_string(),
            })
            .send()
            .await
            .context("failed to send image message")?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn upload_image(
        &self,
        account_id: &AccountId,
        image: ImageUpload,
    ) -> Result<UploadImageResponse> {
        let token = self.tokens.bearer_token().await?;
        let url = self.endpoint(&["accounts", account_id.as_str(), "images"])?;
        let mime_type = image
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .query(&[
                ("filename", image.filename.as_str()),
                ("mime_type", mime_type.as_str()),
            ])
            .header(CONTENT_TYPE, mime_type.as_str())
            .body(image.bytes)
            .send()
            .await
            .context("failed to upload image")?;
        Ok(check_status(response).await?.json().await?)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
