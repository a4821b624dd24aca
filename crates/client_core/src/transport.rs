use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::Identity,
    protocol::{ClientFrame, ServerEvent},
};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    Local,
    Remote,
    Error,
}

#[derive(Debug)]
pub enum LinkEvent {
    Event(ServerEvent),
    Closed {
        initiator: CloseInitiator,
        reason: Option<String>,
    },
}

/// One live push link. Dropping `shutdown` (or sending on it) closes the link locally.
pub struct PushLink {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
    pub shutdown: oneshot::Sender<()>,
}

#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub server_url: String,
    pub identity: Identity,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn open(&self, request: &LinkRequest) -> ChatResult<PushLink>;
}

/// WebSocket push transport.
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

pub fn push_endpoint(server_url: &str, identity: &Identity) -> ChatResult<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|err| ChatError::Validation(format!("invalid server url '{server_url}': {err}")))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ChatError::Validation(format!(
                "server_url must start with http:// or https://, got {other}://"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Validation(format!("cannot derive websocket url from {server_url}")))?;
    url.path_segments_mut()
        .map_err(|_| ChatError::Validation(format!("server url cannot be a base: {server_url}")))?
        .pop_if_empty()
        .push("ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", identity.user_id.as_str());
    Ok(url)
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn open(&self, request: &LinkRequest) -> ChatResult<PushLink> {
        let url = push_endpoint(&request.server_url, &request.identity)?;
        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ChatError::Transport(format!("invalid websocket request: {err}")))?;
        if let Some(token) = &request.identity.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ChatError::Validation("token is not a valid header value".into()))?;
            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(ws_request))
            .await
            .map_err(|_| ChatError::NetworkTimeout)?
            .map_err(|err| ChatError::Transport(format!("failed to connect websocket {url}: {err}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let writer_events = inbound_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!("push: dropping unencodable frame: {err}");
                                continue;
                            }
                        };
                        if let Err(err) = ws_writer.send(Message::Text(text)).await {
                            debug!("push: websocket send failed: {err}");
                            let _ = writer_events.send(LinkEvent::Closed {
                                initiator: CloseInitiator::Error,
                                reason: Some(format!("websocket send failed: {err}")),
                            });
                            return;
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if inbound_tx.send(LinkEvent::Event(event)).is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!("push: invalid server event: {err}"),
                    },
                    Ok(Message::Close(frame)) => {
                        let _ = inbound_tx.send(LinkEvent::Closed {
                            initiator: CloseInitiator::Remote,
                            reason: frame.map(|f| f.reason.to_string()),
                        });
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = inbound_tx.send(LinkEvent::Closed {
                            initiator: CloseInitiator::Error,
                            reason: Some(format!("websocket receive failed: {err}")),
                        });
                        return;
                    }
                }
            }
            let _ = inbound_tx.send(LinkEvent::Closed {
                initiator: CloseInitiator::Error,
                reason: Some("websocket stream ended".into()),
            });
        });

        Ok(PushLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            shutdown: shutdown_tx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
