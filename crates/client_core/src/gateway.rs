use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, RequestBuilder, Response, StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use shared::{
    domain::{Identity, SessionId, UserId},
    error::ApiError,
    protocol::{
        AttachmentPayload, DeliveryStatus, MessagePayload, ResolveSessionRequest,
        SendMessageRequest, WireTimestamp,
    },
};
use tracing::{debug, info};
use url::Url;

use crate::{
    config::ClientSettings,
    error::{ChatError, ChatResult},
    types::{Attachment, ChatSession, FileUpload, Message, MessageStatus},
};

/// Request/response boundary to the chat service.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn resolve_session(&self, user: &UserId, counterpart: &UserId) -> ChatResult<ChatSession>;
    /// History sorted ascending by timestamp; an unknown session yields an empty list.
    async fn fetch_history(&self, session: &SessionId, limit: u32) -> ChatResult<Vec<Message>>;
    /// Bounded history fetch that fails with `SessionNotFound` for unknown sessions.
    async fn probe_session(&self, session: &SessionId, limit: u32) -> ChatResult<()>;
    async fn send(
        &self,
        session: &SessionId,
        content: &str,
        attachments: &[Attachment],
    ) -> ChatResult<Message>;
    async fn upload_attachments(
        &self,
        files: Vec<FileUpload>,
        session: &SessionId,
    ) -> ChatResult<Vec<Attachment>>;
}

pub(crate) fn validate_outgoing(content: &str, has_attachments: bool) -> ChatResult<()> {
    if content.trim().is_empty() && !has_attachments {
        return Err(ChatError::Validation("message content must not be empty".into()));
    }
    Ok(())
}

pub struct HttpGateway {
    http: Client,
    server_url: String,
    token: Option<String>,
    request_timeout: Duration,
    upload_timeout: Duration,
}

impl HttpGateway {
    pub fn new(settings: &ClientSettings, identity: &Identity) -> Self {
        Self {
            http: Client::new(),
            server_url: settings.server_url.clone(),
            token: identity.token.clone(),
            request_timeout: settings.request_timeout(),
            upload_timeout: settings.upload_timeout(),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> ChatResult<Url> {
        let mut url = Url::parse(&self.server_url).map_err(|err| {
            ChatError::Validation(format!("invalid server url '{}': {err}", self.server_url))
        })?;
        url.path_segments_mut()
            .map_err(|_| ChatError::Validation(format!("server url cannot be a base: {}", self.server_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn history_request(&self, session: &SessionId, limit: u32) -> ChatResult<Option<Vec<Message>>> {
        let url = self.endpoint(&["chat", "sessions", session.as_str(), "messages"])?;
        let response = self
            .authorize(self.http.get(url))
            .query(&[("limit", limit.clamp(1, 500))])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(session_id = %session, "chat: history requested for unknown session");
            return Ok(None);
        }
        let body = read_json(check_status(response).await?).await?;
        normalize_history(body).map(Some)
    }
}

#[async_trait]
impl ChatGateway for HttpGateway {
    async fn resolve_session(&self, user: &UserId, counterpart: &UserId) -> ChatResult<ChatSession> {
        let url = self.endpoint(&["chat", "sessions"])?;
        let response = self
            .authorize(self.http.post(url))
            .json(&ResolveSessionRequest {
                user_id: user.clone(),
                counterpart_id: counterpart.clone(),
            })
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        let body = read_json(check_status(response).await?).await?;
        let session = normalize_session(body, user, counterpart)?;
        info!(session_id = %session.id, counterpart = %counterpart, "chat: session resolved by server");
        Ok(session)
    }

    async fn fetch_history(&self, session: &SessionId, limit: u32) -> ChatResult<Vec<Message>> {
        Ok(self.history_request(session, limit).await?.unwrap_or_default())
    }

    async fn probe_session(&self, session: &SessionId, limit: u32) -> ChatResult<()> {
        match self.history_request(session, limit).await? {
            Some(_) => Ok(()),
            None => Err(ChatError::SessionNotFound),
        }
    }

    async fn send(
        &self,
        session: &SessionId,
        content: &str,
        attachments: &[Attachment],
    ) -> ChatResult<Message> {
        validate_outgoing(content, !attachments.is_empty())?;
        let url = self.endpoint(&["chat", "sessions", session.as_str(), "messages"])?;
        let response = self
            .authorize(self.http.post(url))
            .json(&SendMessageRequest {
                content: content.to_string(),
                attachments: attachments.iter().map(attachment_payload).collect(),
            })
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        let body = read_json(check_status(response).await?).await?;
        normalize_sent(body)
    }

    async fn upload_attachments(
        &self,
        files: Vec<FileUpload>,
        session: &SessionId,
    ) -> ChatResult<Vec<Attachment>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let expected = files.len();
        let mut form = Form::new();
        for file in files {
            let mut part = Part::bytes(file.bytes.to_vec()).file_name(file.name.clone());
            if let Some(mime_type) = &file.mime_type {
                part = part
                    .mime_str(mime_type)
                    .map_err(|err| ChatError::UploadFailure(format!("invalid mime type for {}: {err}", file.name)))?;
            }
            form = form.part("files", part);
        }

        let url = self.endpoint(&["chat", "sessions", session.as_str(), "attachments"])?;
        let response = self
            .authorize(self.http.post(url))
            .multipart(form)
            .timeout(self.upload_timeout)
            .send()
            .await
            .map_err(|err| match ChatError::from_reqwest(err) {
                ChatError::Transport(reason) => ChatError::UploadFailure(reason),
                other => other,
            })?;
        let response = check_status(response).await.map_err(|err| match err {
            ChatError::Transport(reason) => ChatError::UploadFailure(reason),
            other => other,
        })?;
        let attachments = normalize_uploaded(read_json(response).await?)?;
        if attachments.len() != expected {
            return Err(ChatError::MalformedResponse(format!(
                "upload returned {} descriptors for {expected} files",
                attachments.len()
            )));
        }
        Ok(attachments)
    }
}

async fn check_status(response: Response) -> ChatResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ChatError::AuthRequired);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ChatError::SessionNotFound);
    }
    let detail = response
        .json::<ApiError>()
        .await
        .map(|err| err.message)
        .unwrap_or_default();
    Err(ChatError::Transport(format!("server returned {status}: {detail}")))
}

async fn read_json(response: Response) -> ChatResult<Value> {
    response.json::<Value>().await.map_err(|err| {
        if err.is_timeout() {
            ChatError::NetworkTimeout
        } else {
            ChatError::MalformedResponse(err.to_string())
        }
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryEnvelope {
    Bare(Vec<MessagePayload>),
    Messages { messages: Vec<MessagePayload> },
    Chat { chat: ChatBody },
}

#[derive(Deserialize)]
struct ChatBody {
    #[serde(default)]
    messages: Vec<MessagePayload>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SessionEnvelope {
    Direct(SessionBody),
    Chat { chat: SessionBody },
}

#[derive(Deserialize)]
#[serde(try_from = "RawSessionBody")]
struct SessionBody {
    session_id: SessionId,
    created_at: Option<WireTimestamp>,
}

#[derive(Deserialize)]
struct RawSessionBody {
    session_id: Option<SessionId>,
    #[serde(rename = "sessionId")]
    session_id_camel: Option<SessionId>,
    #[serde(rename = "chatId")]
    chat_id_camel: Option<SessionId>,
    id: Option<SessionId>,
    #[serde(rename = "_id")]
    document_id: Option<SessionId>,
    created_at: Option<WireTimestamp>,
    #[serde(rename = "createdAt")]
    created_at_camel: Option<WireTimestamp>,
}

impl TryFrom<RawSessionBody> for SessionBody {
    type Error = &'static str;

    fn try_from(raw: RawSessionBody) -> Result<Self, Self::Error> {
        let session_id = raw
            .session_id
            .or(raw.session_id_camel)
            .or(raw.chat_id_camel)
            .or(raw.id)
            .or(raw.document_id)
            .ok_or("session body carries no id")?;
        Ok(Self {
            session_id,
            created_at: raw.created_at.or(raw.created_at_camel),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SentEnvelope {
    Wrapped { message: MessagePayload },
    Bare(MessagePayload),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UploadEnvelope {
    Bare(Vec<AttachmentPayload>),
    Wrapped {
        #[serde(alias = "files")]
        attachments: Vec<AttachmentPayload>,
    },
}

/// Accepts a bare array, `{messages: [...]}` or `{chat: {messages: [...]}}`.
pub fn normalize_history(body: Value) -> ChatResult<Vec<Message>> {
    let envelope: HistoryEnvelope = serde_json::from_value(body)
        .map_err(|err| ChatError::MalformedResponse(format!("unrecognized history shape: {err}")))?;
    let payloads = match envelope {
        HistoryEnvelope::Bare(messages) | HistoryEnvelope::Messages { messages } => messages,
        HistoryEnvelope::Chat { chat } => chat.messages,
    };
    let mut messages = payloads
        .into_iter()
        .map(normalize_message)
        .collect::<ChatResult<Vec<_>>>()?;
    messages.sort_by_key(|message| message.timestamp);
    Ok(messages)
}

/// Converts one wire message into the canonical schema.
pub fn normalize_message(payload: MessagePayload) -> ChatResult<Message> {
    let timestamp = payload.timestamp.to_utc().ok_or_else(|| {
        ChatError::MalformedResponse(format!("message {} has an out-of-range timestamp", payload.id))
    })?;
    let status = match payload.status {
        None | Some(DeliveryStatus::Sent) => MessageStatus::Sent,
        Some(DeliveryStatus::Delivered) => MessageStatus::Delivered,
        Some(DeliveryStatus::Read) => MessageStatus::Read,
    };
    Ok(Message {
        id: payload.id,
        session_id: payload.session_id,
        sender: payload.sender.into_participant(),
        content: payload.content,
        attachments: payload.attachments.into_iter().map(attachment_from_payload).collect(),
        timestamp,
        status,
    })
}

fn normalize_session(body: Value, user: &UserId, counterpart: &UserId) -> ChatResult<ChatSession> {
    let envelope: SessionEnvelope = serde_json::from_value(body)
        .map_err(|err| ChatError::MalformedResponse(format!("unrecognized session shape: {err}")))?;
    let body = match envelope {
        SessionEnvelope::Direct(body) | SessionEnvelope::Chat { chat: body } => body,
    };
    Ok(ChatSession {
        id: body.session_id,
        participant_a: user.clone(),
        participant_b: counterpart.clone(),
        created_at: body.created_at.and_then(WireTimestamp::to_utc),
    })
}

fn normalize_sent(body: Value) -> ChatResult<Message> {
    let envelope: SentEnvelope = serde_json::from_value(body)
        .map_err(|err| ChatError::MalformedResponse(format!("unrecognized message shape: {err}")))?;
    match envelope {
        SentEnvelope::Wrapped { message } | SentEnvelope::Bare(message) => normalize_message(message),
    }
}

fn normalize_uploaded(body: Value) -> ChatResult<Vec<Attachment>> {
    let envelope: UploadEnvelope = serde_json::from_value(body)
        .map_err(|err| ChatError::MalformedResponse(format!("unrecognized upload shape: {err}")))?;
    let payloads = match envelope {
        UploadEnvelope::Bare(attachments) | UploadEnvelope::Wrapped { attachments } => attachments,
    };
    Ok(payloads.into_iter().map(attachment_from_payload).collect())
}

fn attachment_from_payload(payload: AttachmentPayload) -> Attachment {
    Attachment {
        name: payload.name,
        mime_type: payload.mime_type,
        size: payload.size,
        url: payload.url,
    }
}

fn attachment_payload(attachment: &Attachment) -> AttachmentPayload {
    AttachmentPayload {
        name: attachment.name.clone(),
        mime_type: attachment.mime_type.clone(),
        size: attachment.size,
        url: attachment.url.clone(),
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
