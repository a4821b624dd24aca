use thiserror::Error;

/// Errors surfaced by the messaging core.
///
/// The type is `Clone` so that a single in-flight connection or resolution
/// future can hand the same outcome to every caller awaiting it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("authentication required")]
    AuthRequired,
    #[error("session resolution failed: {0}")]
    SessionResolutionFailure(#[source] Box<ChatError>),
    #[error("session not found")]
    SessionNotFound,
    #[error("request timed out")]
    NetworkTimeout,
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("attachment upload failed: {0}")]
    UploadFailure(String),
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionExhausted { attempts: u32 },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session cache error: {0}")]
    Cache(String),
}

impl ChatError {
    pub fn resolution(cause: ChatError) -> Self {
        match cause {
            already @ ChatError::SessionResolutionFailure(_) => already,
            other => ChatError::SessionResolutionFailure(Box::new(other)),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChatError::NetworkTimeout
        } else if err.is_decode() {
            ChatError::MalformedResponse(err.to_string())
        } else {
            ChatError::Transport(err.to_string())
        }
    }

    pub(crate) fn from_storage(err: anyhow::Error) -> Self {
        ChatError::Cache(format!("{err:#}"))
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
