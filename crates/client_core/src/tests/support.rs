//! In-memory doubles shared by the module tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{Identity, MessageId, Participant, Role, SessionId, UserId},
    protocol::{ClientFrame, ServerEvent},
};
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::{
    config::ReconnectPolicy,
    error::{ChatError, ChatResult},
    gateway::{validate_outgoing, ChatGateway},
    transport::{CloseInitiator, LinkEvent, LinkRequest, PushConnector, PushLink},
    types::{Attachment, ChatSession, ConnectionState, FileUpload, Message, MessageStatus},
};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

/// Server end of one in-memory link.
pub(crate) struct ServerSide {
    pub identity: Identity,
    pub frames: mpsc::UnboundedReceiver<ClientFrame>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub shutdown: oneshot::Receiver<()>,
}

impl ServerSide {
    pub async fn next_frame(&mut self) -> ClientFrame {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("frame within timeout")
            .expect("link open")
    }

    /// Frames already sent and nothing more within a short grace period.
    pub async fn drain_frames(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(50), self.frames.recv()).await
        {
            frames.push(frame);
        }
        frames
    }

    pub fn push(&self, event: ServerEvent) {
        self.events
            .send(LinkEvent::Event(event))
            .expect("client side alive");
    }

    pub fn close(&self, initiator: CloseInitiator) {
        let _ = self.events.send(LinkEvent::Closed {
            initiator,
            reason: Some("test close".into()),
        });
    }

    pub async fn wait_closed_locally(&mut self) {
        tokio::time::timeout(WAIT, &mut self.shutdown)
            .await
            .expect("local close within timeout")
            .expect("shutdown signalled");
    }
}

pub(crate) struct MemoryConnector {
    opens: AtomicUsize,
    failures: Mutex<VecDeque<ChatError>>,
    open_delay: Duration,
    links: mpsc::UnboundedSender<ServerSide>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(open_delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (links, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            opens: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            open_delay,
            links,
        });
        (connector, rx)
    }

    pub fn fail_next(&self, count: usize, err: ChatError) {
        let mut failures = self.failures.lock().expect("failures");
        failures.extend(std::iter::repeat(err).take(count));
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushConnector for MemoryConnector {
    async fn open(&self, request: &LinkRequest) -> ChatResult<PushLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if let Some(err) = self.failures.lock().expect("failures").pop_front() {
            return Err(err);
        }
        let (outbound, frames) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let _ = self.links.send(ServerSide {
            identity: request.identity.clone(),
            frames,
            events,
            shutdown: shutdown_rx,
        });
        Ok(PushLink {
            outbound,
            inbound,
            shutdown,
        })
    }
}

pub(crate) async fn next_link(links: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    tokio::time::timeout(WAIT, links.recv())
        .await
        .expect("link within timeout")
        .expect("connector alive")
}

pub(crate) fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    }
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub(crate) async fn wait_for_state(
    state: impl Fn() -> ConnectionState,
    expected: ConnectionState,
) {
    wait_until(|| state() == expected).await;
}

pub(crate) fn patient() -> Identity {
    Identity::new("patient-1", "Ana", Role::Patient).with_token("patient-token")
}

pub(crate) fn doctor() -> Identity {
    Identity::new("doctor-1", "Dr. Ruiz", Role::Doctor).with_token("doctor-token")
}

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_772_359_200 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn confirmed(id: &str, session: &str, sender: &UserId, content: &str, seconds: i64) -> Message {
    Message {
        id: MessageId::new(id),
        session_id: SessionId::new(session),
        sender: Participant {
            id: sender.clone(),
            name: String::new(),
            role: Role::default(),
        },
        content: content.to_string(),
        attachments: Vec::new(),
        timestamp: at(seconds),
        status: MessageStatus::Sent,
    }
}

/// Scriptable `ChatGateway` double that counts every call.
pub(crate) struct FakeGateway {
    pub resolve_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub send_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    resolve_delay: Duration,
    resolve_failure: Mutex<Option<ChatError>>,
    known_sessions: Mutex<HashSet<SessionId>>,
    history: Mutex<HashMap<SessionId, Vec<Message>>>,
    send_gate: Option<Semaphore>,
    send_failures: Mutex<VecDeque<ChatError>>,
    upload_failure: Mutex<Option<ChatError>>,
    sender: Participant,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            resolve_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            resolve_delay: Duration::ZERO,
            resolve_failure: Mutex::new(None),
            known_sessions: Mutex::new(HashSet::new()),
            history: Mutex::new(HashMap::new()),
            send_gate: None,
            send_failures: Mutex::new(VecDeque::new()),
            upload_failure: Mutex::new(None),
            sender: patient().participant(),
        }
    }

    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = delay;
        self
    }

    /// Sends block until `release_sends` hands out permits.
    pub fn gated(mut self) -> Self {
        self.send_gate = Some(Semaphore::new(0));
        self
    }

    pub fn release_sends(&self, count: usize) {
        if let Some(gate) = &self.send_gate {
            gate.add_permits(count);
        }
    }

    pub fn fail_resolve(&self, err: ChatError) {
        *self.resolve_failure.lock().expect("resolve failure") = Some(err);
    }

    pub fn fail_next_send(&self, err: ChatError) {
        self.send_failures.lock().expect("send failures").push_back(err);
    }

    pub fn fail_uploads(&self, err: ChatError) {
        *self.upload_failure.lock().expect("upload failure") = Some(err);
    }

    pub fn know_session(&self, session: &SessionId) {
        self.known_sessions
            .lock()
            .expect("known sessions")
            .insert(session.clone());
    }

    pub fn forget_session(&self, session: &SessionId) {
        self.known_sessions.lock().expect("known sessions").remove(session);
    }

    pub fn set_history(&self, session: &SessionId, messages: Vec<Message>) {
        self.know_session(session);
        self.history
            .lock()
            .expect("history")
            .insert(session.clone(), messages);
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatGateway for FakeGateway {
    async fn resolve_session(&self, user: &UserId, counterpart: &UserId) -> ChatResult<ChatSession> {
        let call = self.resolve_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.resolve_delay.is_zero() {
            tokio::time::sleep(self.resolve_delay).await;
        }
        if let Some(err) = self.resolve_failure.lock().expect("resolve failure").clone() {
            return Err(err);
        }
        let id = SessionId::new(format!("session-{call}"));
        self.know_session(&id);
        Ok(ChatSession {
            id,
            participant_a: user.clone(),
            participant_b: counterpart.clone(),
            created_at: Some(at(0)),
        })
    }

    async fn fetch_history(&self, session: &SessionId, _limit: u32) -> ChatResult<Vec<Message>> {
        Ok(self
            .history
            .lock()
            .expect("history")
            .get(session)
            .cloned()
            .unwrap_or_default())
    }

    async fn probe_session(&self, session: &SessionId, _limit: u32) -> ChatResult<()> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.known_sessions.lock().expect("known sessions").contains(session) {
            Ok(())
        } else {
            Err(ChatError::SessionNotFound)
        }
    }

    async fn send(
        &self,
        session: &SessionId,
        content: &str,
        attachments: &[Attachment],
    ) -> ChatResult<Message> {
        validate_outgoing(content, !attachments.is_empty())?;
        let call = self.send_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.send_gate {
            gate.acquire().await.expect("gate open").forget();
        }
        if let Some(err) = self.send_failures.lock().expect("send failures").pop_front() {
            return Err(err);
        }
        Ok(Message {
            id: MessageId::new(format!("m{call}")),
            session_id: session.clone(),
            sender: self.sender.clone(),
            content: content.to_string(),
            attachments: attachments.to_vec(),
            timestamp: Utc::now(),
            status: MessageStatus::Sent,
        })
    }

    async fn upload_attachments(
        &self,
        files: Vec<FileUpload>,
        _session: &SessionId,
    ) -> ChatResult<Vec<Attachment>> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.upload_failure.lock().expect("upload failure").clone() {
            return Err(err);
        }
        Ok(files
            .into_iter()
            .map(|file| Attachment {
                url: format!("/files/{}", file.name),
                mime_type: file.mime_type.unwrap_or_default(),
                size: file.bytes.len() as u64,
                name: file.name,
            })
            .collect())
    }
}
