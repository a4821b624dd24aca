use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use shared::domain::{MessageId, Participant, SessionId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
    Delivered,
    Read,
}

impl MessageStatus {
    /// Position on the confirmed path `sent -> delivered -> read`.
    pub(crate) fn confirmed_rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sent => Some(0),
            MessageStatus::Delivered => Some(1),
            MessageStatus::Read => Some(2),
            MessageStatus::Pending | MessageStatus::Failed => None,
        }
    }
}

/// A server-confirmed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender: Participant,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub url: String,
}

/// Raw file payload waiting to be uploaded.
#[derive(Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub name: String,
    pub mime_type: Option<String>,
    pub bytes: Arc<[u8]>,
}

impl FileUpload {
    pub fn new(name: impl Into<String>, mime_type: Option<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            mime_type,
            bytes: Arc::from(bytes.into()),
        }
    }
}

impl fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUpload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub id: SessionId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypingSignal {
    pub session_id: SessionId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected { exhausted: bool },
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}
