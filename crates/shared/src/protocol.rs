use chrono::{DateTime, Utc};
use serde::{de, de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{Attachment, ConversationContext, Direction, Message, MessageKind};

/// Upstream identifiers arrive as JSON strings or numbers depending on the platform.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl From<RawId> for String {
    fn from(value: RawId) -> Self {
        match value {
            RawId::Text(v) => v,
            RawId::Signed(v) => v.to_string(),
            RawId::Unsigned(v) => v.to_string(),
        }
    }
}

fn flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

fn optional_flexible_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?
        .map(String::from)
        .filter(|id| !id.is_empty()))
}

fn infer_kind(kind: Option<MessageKind>, attachment: &Option<Attachment>) -> MessageKind {
    kind.unwrap_or(if attachment.is_some() {
        MessageKind::Photo
    } else {
        MessageKind::Text
    })
}

/// Body of every message-carrying push frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    #[serde(
        default,
        alias = "message_id",
        deserialize_with = "optional_flexible_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(deserialize_with = "flexible_id")]
    pub account_id: String,
    #[serde(deserialize_with = "flexible_id")]
    pub sender_id: String,
    #[serde(deserialize_with = "flexible_id")]
    pub recipient_id: String,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageEvent {
    /// The other party: the recipient of outgoing messages, the sender of incoming ones.
    pub fn peer_id(&self) -> &str {
        match self.direction {
            Direction::Out => &self.recipient_id,
            Direction::In => &self.sender_id,
        }
    }

    pub fn matches(&self, context: &ConversationContext) -> bool {
        self.account_id == context.account_id.as_str() && self.peer_id() == context.peer_id.as_str()
    }

    /// Converts into a store message. A missing id is left empty for the store to fill.
    pub fn into_message(self, received_at: DateTime<Utc>) -> Message {
        Message {
            id: self.id.unwrap_or_default(),
            direction: self.direction,
            kind: infer_kind(self.kind, &self.attachment),
            text: self.text,
            attachment: self.attachment,
            timestamp: self.timestamp.unwrap_or(received_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(
        default,
        deserialize_with = "optional_flexible_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// A push channel frame. Frames are `{"type": ..., "payload": ...}` objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushFrame {
    Ping,
    Pong,
    Ack(AckPayload),
    Notification(NotificationPayload),
    NewMessage(MessageEvent),
    ZaloMessage(MessageEvent),
    MessengerMessage(MessageEvent),
    /// Any frame type this client does not understand; carries the raw type name.
    #[serde(skip_serializing)]
    Unknown(String),
}

impl PushFrame {
    pub fn message_event(&self) -> Option<&MessageEvent> {
        match self {
            PushFrame::NewMessage(event)
            | PushFrame::ZaloMessage(event)
            | PushFrame::MessengerMessage(event) => Some(event),
            _ => None,
        }
    }

    pub fn into_message_event(self) -> Option<MessageEvent> {
        match self {
            PushFrame::NewMessage(event)
            | PushFrame::ZaloMessage(event)
            | PushFrame::MessengerMessage(event) => Some(event),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            PushFrame::Ping => "ping",
            PushFrame::Pong => "pong",
            PushFrame::Ack(_) => "ack",
            PushFrame::Notification(_) => "notification",
            PushFrame::NewMessage(_) => "new_message",
            PushFrame::ZaloMessage(_) => "zalo_message",
            PushFrame::MessengerMessage(_) => "messenger_message",
            PushFrame::Unknown(name) => name,
        }
    }
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "data")]
    payload: Value,
}

fn from_payload<T>(payload: Value) -> serde_json::Result<T>
where
    T: DeserializeOwned,
{
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload)
}

impl<'de> Deserialize<'de> for PushFrame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawFrame::deserialize(deserializer)?;
        let frame = match raw.kind.as_str() {
            "ping" => Ok(PushFrame::Ping),
            "pong" => Ok(PushFrame::Pong),
            "ack" => from_payload(raw.payload).map(PushFrame::Ack),
            "notification" => from_payload(raw.payload).map(PushFrame::Notification),
            "new_message" | "new-message" => from_payload(raw.payload).map(PushFrame::NewMessage),
            "zalo_message" => from_payload(raw.payload).map(PushFrame::ZaloMessage),
            "messenger_message" => from_payload(raw.payload).map(PushFrame::MessengerMessage),
            _ => Ok(PushFrame::Unknown(raw.kind)),
        };
        frame.map_err(de::Error::custom)
    }
}

/// One entry of a conversation history page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    #[serde(
        default,
        alias = "message_id",
        deserialize_with = "optional_flexible_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub timestamp: DateTime<Utc>,
}

impl From<HistoryMessage> for Message {
    fn from(value: HistoryMessage) -> Self {
        Message {
            id: value.id.unwrap_or_default(),
            direction: value.direction,
            kind: infer_kind(value.kind, &value.attachment),
            text: value.text,
            attachment: value.attachment,
            timestamp: value.timestamp,
        }
    }
}

/// History endpoints answer with either a bare array or `{"messages": [...]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HistoryPage {
    List(Vec<HistoryMessage>),
    Wrapped { messages: Vec<HistoryMessage> },
}

impl HistoryPage {
    pub fn into_messages(self) -> Vec<Message> {
        let entries = match self {
            HistoryPage::List(entries) => entries,
            HistoryPage::Wrapped { messages } => messages,
        };
        entries.into_iter().map(Message::from).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTextRequest {
    pub peer_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendImageRequest {
    pub peer_id: String,
    pub attachment_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    #[serde(
        default,
        alias = "id",
        deserialize_with = "optional_flexible_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadImageResponse {
    #[serde(deserialize_with = "flexible_id")]
    pub attachment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
