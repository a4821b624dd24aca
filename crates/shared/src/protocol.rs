use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, Participant, Role, SessionId, UserId},
    error::ApiError,
};

/// Frames sent by the client over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Identify {
        user_id: UserId,
        name: String,
        role: Role,
    },
    JoinSession {
        session_id: SessionId,
    },
    LeaveSession {
        session_id: SessionId,
    },
    Typing {
        session_id: SessionId,
        user_id: UserId,
    },
    StopTyping {
        session_id: SessionId,
        user_id: UserId,
    },
    MarkRead {
        session_id: SessionId,
        message_ids: Vec<MessageId>,
    },
}

/// Events pushed by the server over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: MessagePayload,
    },
    Typing {
        session_id: SessionId,
        user_id: UserId,
    },
    StopTyping {
        session_id: SessionId,
        user_id: UserId,
    },
    MessageRead {
        session_id: SessionId,
        message_ids: Vec<MessageId>,
    },
    MessageDelivered {
        session_id: SessionId,
        message_ids: Vec<MessageId>,
    },
    Error(ApiError),
}

/// Server-confirmed delivery state carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

/// Message sender as the server encodes it: either a populated participant or a bare user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SenderRef {
    Participant(Participant),
    Id(UserId),
}

impl SenderRef {
    pub fn into_participant(self) -> Participant {
        match self {
            SenderRef::Participant(participant) => participant,
            SenderRef::Id(id) => Participant {
                id,
                name: String::new(),
                role: Role::default(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Rfc3339(DateTime<Utc>),
    EpochMillis(i64),
}

impl WireTimestamp {
    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Rfc3339(value) => Some(value),
            WireTimestamp::EpochMillis(ms) => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

impl From<DateTime<Utc>> for WireTimestamp {
    fn from(value: DateTime<Utc>) -> Self {
        WireTimestamp::Rfc3339(value)
    }
}

/// A message as the server encodes it.
///
/// Decoding goes through [`RawMessagePayload`]: document stores often carry
/// both spellings of a field (`_id` next to `id`, `createdAt` next to
/// `timestamp`), so each spelling is read separately and the first one present
/// wins. Encoding always uses the canonical names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessagePayload")]
pub struct MessagePayload {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender: SenderRef,
    pub content: String,
    pub attachments: Vec<AttachmentPayload>,
    pub timestamp: WireTimestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
}

#[derive(Deserialize)]
struct RawMessagePayload {
    id: Option<MessageId>,
    #[serde(rename = "_id")]
    document_id: Option<MessageId>,
    session_id: Option<SessionId>,
    #[serde(rename = "sessionId")]
    session_id_camel: Option<SessionId>,
    #[serde(rename = "chatId")]
    chat_id_camel: Option<SessionId>,
    chat_id: Option<SessionId>,
    sender: SenderRef,
    content: Option<String>,
    text: Option<String>,
    attachments: Option<Vec<AttachmentPayload>>,
    timestamp: Option<WireTimestamp>,
    #[serde(rename = "createdAt")]
    created_at_camel: Option<WireTimestamp>,
    created_at: Option<WireTimestamp>,
    status: Option<DeliveryStatus>,
}

impl TryFrom<RawMessagePayload> for MessagePayload {
    type Error = String;

    fn try_from(raw: RawMessagePayload) -> Result<Self, Self::Error> {
        let id = raw
            .id
            .or(raw.document_id)
            .ok_or("message is missing `id`/`_id`")?;
        let session_id = raw
            .session_id
            .or(raw.session_id_camel)
            .or(raw.chat_id_camel)
            .or(raw.chat_id)
            .ok_or_else(|| format!("message {id} is missing its session id"))?;
        let timestamp = raw
            .timestamp
            .or(raw.created_at_camel)
            .or(raw.created_at)
            .ok_or_else(|| format!("message {id} is missing `timestamp`/`createdAt`"))?;
        Ok(Self {
            id,
            session_id,
            sender: raw.sender,
            content: raw.content.or(raw.text).unwrap_or_default(),
            attachments: raw.attachments.unwrap_or_default(),
            timestamp,
            status: raw.status,
        })
    }
}

/// Attachment descriptor. Like [`MessagePayload`], every spelling is read
/// separately so upload records carrying several of them still decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAttachmentPayload")]
pub struct AttachmentPayload {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    pub url: String,
}

#[derive(Deserialize)]
struct RawAttachmentPayload {
    name: Option<String>,
    #[serde(rename = "originalName")]
    original_name: Option<String>,
    filename: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    mime_type: Option<String>,
    #[serde(rename = "mimeType")]
    mime_type_camel: Option<String>,
    size: Option<u64>,
    size_bytes: Option<u64>,
    url: Option<String>,
    path: Option<String>,
}

impl TryFrom<RawAttachmentPayload> for AttachmentPayload {
    type Error = String;

    fn try_from(raw: RawAttachmentPayload) -> Result<Self, Self::Error> {
        let name = raw
            .name
            .or(raw.original_name)
            .or(raw.filename)
            .ok_or("attachment is missing its name")?;
        let url = raw
            .url
            .or(raw.path)
            .ok_or_else(|| format!("attachment {name} is missing `url`/`path`"))?;
        Ok(Self {
            name,
            mime_type: raw.kind.or(raw.mime_type).or(raw.mime_type_camel).unwrap_or_default(),
            size: raw.size.or(raw.size_bytes).unwrap_or_default(),
            url,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveSessionRequest {
    pub user_id: UserId,
    pub counterpart_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
