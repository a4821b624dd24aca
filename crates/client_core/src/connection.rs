//! Ownership of the single live push link.
//!
//! A `ConnectionManager` holds at most one link at a time. Establishment
//! (initial or reconnect) runs as one shared future so concurrent callers
//! converge on the same `ConnectionId`. Every establishment is tagged with the
//! generation it was started under; `disconnect` and identity changes bump the
//! generation, which makes stale establishments discard their link.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::{
    domain::{Identity, SessionId},
    protocol::{ClientFrame, ServerEvent},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ClientSettings, ReconnectPolicy},
    error::{ChatError, ChatResult},
    events::{EventBus, EventKind, PushEvent, Subscription},
    gateway::normalize_message,
    transport::{CloseInitiator, LinkEvent, LinkRequest, PushConnector, PushLink},
    types::{ConnectionId, ConnectionState, TypingSignal},
};

type SharedConnect = Shared<BoxFuture<'static, ChatResult<ConnectionId>>>;

#[derive(Debug, Clone, Copy)]
enum Establish {
    Initial,
    Reconnect { immediate: bool },
}

struct ActiveLink {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    shutdown: Option<oneshot::Sender<()>>,
    pump: JoinHandle<()>,
}

impl ActiveLink {
    fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.pump.abort();
    }
}

struct ConnectionInner {
    identity: Option<Identity>,
    link: Option<ActiveLink>,
    pending: Option<(u64, SharedConnect)>,
    joined: BTreeSet<SessionId>,
    state: ConnectionState,
    generation: u64,
}

pub struct ConnectionManager {
    connector: Arc<dyn PushConnector>,
    server_url: String,
    policy: ReconnectPolicy,
    bus: EventBus,
    inner: Mutex<ConnectionInner>,
    next_link: AtomicU64,
    next_token: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn PushConnector>,
        server_url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            server_url: server_url.into(),
            policy,
            bus: EventBus::new(),
            inner: Mutex::new(ConnectionInner {
                identity: None,
                link: None,
                pending: None,
                joined: BTreeSet::new(),
                state: ConnectionState::Idle,
                generation: 0,
            }),
            next_link: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
        })
    }

    pub fn from_settings(settings: &ClientSettings, connector: Arc<dyn PushConnector>) -> Arc<Self> {
        Self::new(connector, settings.server_url.clone(), settings.reconnect_policy())
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn identity(&self) -> Option<Identity> {
        self.lock().identity.clone()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.lock().link.as_ref().map(|link| link.id)
    }

    pub fn joined_sessions(&self) -> Vec<SessionId> {
        self.lock().joined.iter().cloned().collect()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: FnMut(&PushEvent) + Send + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    /// Returns the live connection for `identity`, opening one if needed.
    pub async fn connect(self: &Arc<Self>, identity: Identity) -> ChatResult<ConnectionId> {
        let (pending, announce) = {
            let mut inner = self.lock();
            if inner.identity.as_ref() == Some(&identity) {
                if let Some(link) = &inner.link {
                    return Ok(link.id);
                }
                if let Some((_, pending)) = &inner.pending {
                    (pending.clone(), false)
                } else {
                    inner.state = ConnectionState::Connecting;
                    (self.start_establish(&mut inner, Establish::Initial), true)
                }
            } else {
                if let Some(link) = inner.link.take() {
                    info!(
                        connection_id = link.id.0,
                        user_id = %identity.user_id,
                        "push: identity changed, closing previous link"
                    );
                    link.close();
                }
                inner.joined.clear();
                inner.generation += 1;
                inner.identity = Some(identity);
                inner.state = ConnectionState::Connecting;
                (self.start_establish(&mut inner, Establish::Initial), true)
            }
        };
        if announce {
            self.bus
                .publish(PushEvent::ConnectionState(ConnectionState::Connecting));
        }
        pending.await
    }

    fn start_establish(self: &Arc<Self>, inner: &mut ConnectionInner, mode: Establish) -> SharedConnect {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let generation = inner.generation;
        let identity = inner.identity.clone();
        let manager = Arc::clone(self);

        let establish = async move {
            let result = match identity {
                None => Err(ChatError::AuthRequired),
                Some(identity) => match mode {
                    Establish::Initial => manager.open_link(&identity, generation).await,
                    Establish::Reconnect { immediate } => {
                        manager.reconnect(&identity, generation, immediate).await
                    }
                },
            };
            manager.finish_establish(token, generation, &result);
            result
        }
        .boxed()
        .shared();

        inner.pending = Some((token, establish.clone()));
        tokio::spawn(establish.clone().map(|_| ()));
        establish
    }

    async fn open_link(self: &Arc<Self>, identity: &Identity, generation: u64) -> ChatResult<ConnectionId> {
        let request = LinkRequest {
            server_url: self.server_url.clone(),
            identity: identity.clone(),
        };
        let PushLink {
            outbound,
            inbound,
            shutdown,
        } = self.connector.open(&request).await?;

        outbound
            .send(ClientFrame::Identify {
                user_id: identity.user_id.clone(),
                name: identity.name.clone(),
                role: identity.role,
            })
            .map_err(|_| ChatError::Transport("push link closed during identify".into()))?;

        let id = ConnectionId(self.next_link.fetch_add(1, Ordering::Relaxed));
        let rejoined = {
            let mut inner = self.lock();
            if inner.generation != generation {
                drop(inner);
                let _ = shutdown.send(());
                debug!(connection_id = id.0, "push: discarding superseded link");
                return Err(ChatError::Transport("connection attempt superseded".into()));
            }
            for session_id in &inner.joined {
                let _ = outbound.send(ClientFrame::JoinSession {
                    session_id: session_id.clone(),
                });
            }
            let pump = tokio::spawn(pump_link(Arc::downgrade(self), id, inbound));
            if let Some(previous) = inner.link.replace(ActiveLink {
                id,
                outbound,
                shutdown: Some(shutdown),
                pump,
            }) {
                previous.close();
            }
            inner.state = ConnectionState::Connected;
            inner.joined.len()
        };

        info!(
            connection_id = id.0,
            user_id = %identity.user_id,
            rejoined,
            "push: connected"
        );
        self.bus
            .publish(PushEvent::ConnectionState(ConnectionState::Connected));
        Ok(id)
    }

    async fn reconnect(
        self: &Arc<Self>,
        identity: &Identity,
        generation: u64,
        immediate: bool,
    ) -> ChatResult<ConnectionId> {
        for attempt in 1..=self.policy.max_attempts {
            if let Some(delay) = self.policy.delay_before(attempt, immediate) {
                tokio::time::sleep(delay).await;
            }
            if !self.transition(Some(generation), ConnectionState::Reconnecting { attempt }) {
                return Err(ChatError::Transport("reconnect superseded".into()));
            }
            match self.open_link(identity, generation).await {
                Ok(id) => {
                    info!(attempt, connection_id = id.0, "push: reconnected");
                    return Ok(id);
                }
                Err(err) => warn!(attempt, error = %err, "push: reconnect attempt failed"),
            }
        }
        Err(ChatError::ConnectionExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    fn finish_establish(&self, token: u64, generation: u64, result: &ChatResult<ConnectionId>) {
        let state = {
            let mut inner = self.lock();
            if matches!(&inner.pending, Some((pending, _)) if *pending == token) {
                inner.pending = None;
            }
            let Err(err) = result else { return };
            if inner.generation != generation || inner.link.is_some() {
                return;
            }
            let exhausted = matches!(err, ChatError::ConnectionExhausted { .. });
            if exhausted {
                error!(error = %err, "push: giving up on reconnect");
            } else {
                warn!(error = %err, "push: connect failed");
            }
            let state = ConnectionState::Disconnected { exhausted };
            inner.state = state;
            state
        };
        self.bus.publish(PushEvent::ConnectionState(state));
    }

    /// Sets the state and publishes it when it changed. Returns `false` when
    /// `generation` no longer matches.
    fn transition(&self, generation: Option<u64>, state: ConnectionState) -> bool {
        {
            let mut inner = self.lock();
            if generation.is_some_and(|generation| generation != inner.generation) {
                return false;
            }
            if inner.state == state {
                return true;
            }
            inner.state = state;
        }
        self.bus.publish(PushEvent::ConnectionState(state));
        true
    }

    fn handle_drop(self: &Arc<Self>, id: ConnectionId, initiator: CloseInitiator, reason: Option<String>) {
        let state = {
            let mut inner = self.lock();
            if inner.link.as_ref().map(|link| link.id) != Some(id) {
                return;
            }
            inner.link = None;
            if initiator == CloseInitiator::Local || inner.identity.is_none() {
                info!(connection_id = id.0, "push: link closed");
                let state = ConnectionState::Disconnected { exhausted: false };
                inner.state = state;
                state
            } else {
                warn!(
                    connection_id = id.0,
                    ?initiator,
                    reason = reason.as_deref().unwrap_or_default(),
                    "push: link dropped, reconnecting"
                );
                let state = ConnectionState::Reconnecting { attempt: 1 };
                inner.state = state;
                let immediate = initiator == CloseInitiator::Remote;
                let _ = self.start_establish(&mut inner, Establish::Reconnect { immediate });
                state
            }
        };
        self.bus.publish(PushEvent::ConnectionState(state));
    }

    fn dispatch(&self, event: ServerEvent) {
        let event = match event {
            ServerEvent::NewMessage { message } => match normalize_message(message) {
                Ok(message) => PushEvent::NewMessage(message),
                Err(err) => {
                    warn!(error = %err, "push: dropping undecodable message");
                    return;
                }
            },
            ServerEvent::Typing {
                session_id,
                user_id,
            } => PushEvent::Typing(TypingSignal {
                session_id,
                user_id,
            }),
            ServerEvent::StopTyping {
                session_id,
                user_id,
            } => PushEvent::StopTyping(TypingSignal {
                session_id,
                user_id,
            }),
            ServerEvent::MessageRead {
                session_id,
                message_ids,
            } => PushEvent::MessageRead {
                session_id,
                message_ids,
            },
            ServerEvent::MessageDelivered {
                session_id,
                message_ids,
            } => PushEvent::MessageDelivered {
                session_id,
                message_ids,
            },
            ServerEvent::Error(err) => {
                warn!(code = ?err.code, "push: server reported error: {}", err.message);
                return;
            }
        };
        self.bus.publish(event);
    }

    /// Sends `frame` over the live link.
    pub fn emit(&self, frame: ClientFrame) -> ChatResult<()> {
        let inner = self.lock();
        match &inner.link {
            Some(link) => link
                .outbound
                .send(frame)
                .map_err(|_| ChatError::Transport("push link closed".into())),
            None => match inner.state {
                ConnectionState::Disconnected { exhausted: true } => Err(ChatError::ConnectionExhausted {
                    attempts: self.policy.max_attempts,
                }),
                _ => Err(ChatError::Transport("not connected".into())),
            },
        }
    }

    /// Joins `session_id`. Returns `false` when it was already joined.
    ///
    /// A join recorded while no link is up, or while the live link can no
    /// longer send, is announced once the next link opens.
    pub fn join_session(&self, session_id: &SessionId) -> ChatResult<bool> {
        let mut inner = self.lock();
        if !inner.joined.insert(session_id.clone()) {
            return Ok(false);
        }
        if let Some(link) = &inner.link {
            let frame = ClientFrame::JoinSession {
                session_id: session_id.clone(),
            };
            if link.outbound.send(frame).is_err() {
                warn!(
                    connection_id = link.id.0,
                    session_id = %session_id,
                    "push: link going down, join deferred to reconnect"
                );
                return Ok(true);
            }
        }
        info!(session_id = %session_id, "push: joined session");
        Ok(true)
    }

    pub fn leave_session(&self, session_id: &SessionId) -> ChatResult<bool> {
        let mut inner = self.lock();
        if !inner.joined.remove(session_id) {
            return Ok(false);
        }
        if let Some(link) = &inner.link {
            let frame = ClientFrame::LeaveSession {
                session_id: session_id.clone(),
            };
            if link.outbound.send(frame).is_err() {
                debug!(connection_id = link.id.0, session_id = %session_id, "push: leave not sent, link going down");
            }
        }
        info!(session_id = %session_id, "push: left session");
        Ok(true)
    }

    /// Leaves `from` (when given) strictly before joining `to`.
    pub fn switch_session(&self, from: Option<&SessionId>, to: &SessionId) -> ChatResult<()> {
        if let Some(from) = from.filter(|from| *from != to) {
            self.leave_session(from)?;
        }
        self.join_session(to)?;
        Ok(())
    }

    /// Locally closes the link. A local close never triggers a reconnect.
    pub fn disconnect(&self) {
        let link = {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.pending = None;
            inner.link.take()
        };
        if let Some(link) = link {
            info!(connection_id = link.id.0, "push: disconnecting");
            link.close();
        }
        self.transition(None, ConnectionState::Disconnected { exhausted: false });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = inner.link.take() {
            link.close();
        }
    }
}

async fn pump_link(
    manager: Weak<ConnectionManager>,
    id: ConnectionId,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) {
    let (initiator, reason) = loop {
        match inbound.recv().await {
            Some(LinkEvent::Event(event)) => {
                let Some(manager) = manager.upgrade() else { return };
                manager.dispatch(event);
            }
            Some(LinkEvent::Closed { initiator, reason }) => break (initiator, reason),
            None => break (CloseInitiator::Error, Some("push link dropped".to_string())),
        }
    };
    if let Some(manager) = manager.upgrade() {
        manager.handle_drop(id, initiator, reason);
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
