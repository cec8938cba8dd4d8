use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix carried by client-generated ids of messages not yet confirmed by the server.
pub const TEMP_ID_PREFIX: &str = "temp-";
/// Prefix carried by locally generated error-notice messages.
pub const ERROR_NOTICE_ID_PREFIX: &str = "error-";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(AccountId);
id_newtype!(PeerId);
id_newtype!(ConversationId);

/// The (account, peer, conversation) triple identifying the chat being synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationContext {
    pub account_id: AccountId,
    pub peer_id: PeerId,
    pub conversation_id: ConversationId,
}

impl ConversationContext {
    pub fn new(
        account_id: impl Into<AccountId>,
        peer_id: impl Into<PeerId>,
        conversation_id: impl Into<ConversationId>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            peer_id: peer_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    #[serde(alias = "image")]
    Photo,
    ErrorNotice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    #[default]
    #[serde(alias = "image")]
    Photo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type", default)]
    pub kind: AttachmentKind,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Attachment {
    pub fn photo(url: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Photo,
            url: url.into(),
            thumbnail_url: None,
            description: None,
        }
    }
}

/// One inbound or outbound chat event as held by the message store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub direction: Direction,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn text(
        id: impl Into<String>,
        direction: Direction,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            kind: MessageKind::Text,
            text: Some(text.into()),
            attachment: None,
            timestamp,
        }
    }

    pub fn photo(
        id: impl Into<String>,
        direction: Direction,
        attachment: Attachment,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            kind: MessageKind::Photo,
            text: None,
            attachment: Some(attachment),
            timestamp,
        }
    }

    /// True for optimistic messages still waiting for server confirmation.
    pub fn is_provisional(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    pub fn is_error_notice(&self) -> bool {
        self.kind == MessageKind::ErrorNotice
    }

    /// Confirmed messages carry a server-assigned id.
    pub fn is_confirmed(&self) -> bool {
        !self.is_provisional() && !self.is_error_notice()
    }

    /// Trimmed text used for content-based echo matching.
    pub fn normalized_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim)
    }
}
