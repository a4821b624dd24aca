//! Per-session timeline with optimistic sends.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use chrono::{FixedOffset, Offset, Utc};
use shared::domain::{MessageId, Participant, SessionId, TempId};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::{ChatError, ChatResult},
    events::{EventBus, EventKind, PushEvent, Subscription},
    gateway::{validate_outgoing, ChatGateway},
    timeline::{group_entries, DayGroup, LocalMessage, TimelineEntry, TimelineState, Transition},
    types::{Attachment, FileUpload, Message, MessageStatus},
};

/// Terminal result of one background send.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent(MessageId),
    Failed(ChatError),
    /// The store was disposed before the send completed.
    Discarded,
}

/// Handle to an optimistic send that is already visible as a pending entry.
pub struct PendingSend {
    pub temp_id: TempId,
    pub task: JoinHandle<SendOutcome>,
}

struct StoreShared {
    session_id: SessionId,
    me: Participant,
    gateway: Arc<dyn ChatGateway>,
    state: Mutex<TimelineState>,
    disposed: AtomicBool,
    revision: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct MessageStore {
    shared: Arc<StoreShared>,
}

impl MessageStore {
    pub fn new(session_id: SessionId, me: Participant, gateway: Arc<dyn ChatGateway>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(StoreShared {
                session_id,
                me,
                gateway,
                state: Mutex::new(TimelineState::default()),
                disposed: AtomicBool::new(false),
                revision,
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.shared.session_id
    }

    fn state(&self) -> MutexGuard<'_, TimelineState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, transition: Transition) -> bool {
        if self.is_disposed() {
            return false;
        }
        let changed = self.state().reconcile(transition);
        if changed {
            self.shared.revision.send_modify(|revision| *revision += 1);
        }
        changed
    }

    /// Inserts a pending entry for `content` and sends it in the background.
    pub fn send_local(
        &self,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> ChatResult<PendingSend> {
        let content = content.into();
        validate_outgoing(&content, !attachments.is_empty())?;
        self.dispatch(content, attachments, Vec::new())
    }

    /// Like `send_local`, uploading `files` before the message is sent.
    pub fn send_local_with_files(
        &self,
        content: impl Into<String>,
        files: Vec<FileUpload>,
    ) -> ChatResult<PendingSend> {
        let content = content.into();
        validate_outgoing(&content, !files.is_empty())?;
        self.dispatch(content, Vec::new(), files)
    }

    /// Sends the content of a failed entry again as a new pending entry.
    /// The failed entry stays in the timeline.
    pub fn retry(&self, temp_id: TempId) -> ChatResult<PendingSend> {
        let failed = self.state().entries.iter().find_map(|entry| match entry {
            TimelineEntry::Failed(local) if local.temp_id == temp_id => Some(local.clone()),
            _ => None,
        });
        let Some(failed) = failed else {
            return Err(ChatError::Validation(format!("no failed message {temp_id}")));
        };
        debug!(session_id = %self.shared.session_id, %temp_id, "store: retrying failed send");
        self.dispatch(failed.content, failed.attachments, failed.files)
    }

    fn dispatch(
        &self,
        content: String,
        attachments: Vec<Attachment>,
        files: Vec<FileUpload>,
    ) -> ChatResult<PendingSend> {
        if self.is_disposed() {
            return Err(ChatError::Validation("conversation is closed".into()));
        }
        let local = LocalMessage {
            temp_id: TempId::generate(),
            session_id: self.shared.session_id.clone(),
            sender: self.shared.me.clone(),
            content,
            attachments,
            files,
            inserted_at: Utc::now(),
            failure: None,
        };
        let temp_id = local.temp_id;
        self.apply(Transition::Insert(local.clone()));

        let store = self.clone();
        let task = tokio::spawn(async move { store.deliver(local).await });
        Ok(PendingSend { temp_id, task })
    }

    async fn deliver(self, local: LocalMessage) -> SendOutcome {
        let temp_id = local.temp_id;
        let result = self.upload_and_send(&local).await;
        if self.is_disposed() {
            debug!(%temp_id, "store: send completed after dispose, ignoring");
            return SendOutcome::Discarded;
        }
        match result {
            Ok(message) => {
                let id = message.id.clone();
                info!(session_id = %self.shared.session_id, message_id = %id, "store: message sent");
                self.apply(Transition::Confirm { temp_id, message });
                SendOutcome::Sent(id)
            }
            Err(err) => {
                warn!(session_id = %self.shared.session_id, %temp_id, error = %err, "store: send failed");
                self.apply(Transition::Fail {
                    temp_id,
                    reason: err.to_string(),
                });
                SendOutcome::Failed(err)
            }
        }
    }

    async fn upload_and_send(&self, local: &LocalMessage) -> ChatResult<Message> {
        let mut attachments = local.attachments.clone();
        if !local.files.is_empty() {
            let uploaded = self
                .shared
                .gateway
                .upload_attachments(local.files.clone(), &local.session_id)
                .await?;
            attachments.extend(uploaded);
        }
        self.shared
            .gateway
            .send(&local.session_id, &local.content, &attachments)
            .await
    }

    /// Merges a pushed message. Messages for other sessions are ignored.
    pub fn apply_pushed_message(&self, message: &Message) -> bool {
        if message.session_id != self.shared.session_id {
            debug!(
                session_id = %self.shared.session_id,
                other = %message.session_id,
                "store: ignoring message for another session"
            );
            return false;
        }
        self.apply(Transition::Pushed(message.clone()))
    }

    pub fn apply_read_receipt(&self, session_id: &SessionId, ids: &[MessageId]) -> bool {
        self.advance(session_id, ids, MessageStatus::Read)
    }

    pub fn apply_delivered(&self, session_id: &SessionId, ids: &[MessageId]) -> bool {
        self.advance(session_id, ids, MessageStatus::Delivered)
    }

    fn advance(&self, session_id: &SessionId, ids: &[MessageId], status: MessageStatus) -> bool {
        if *session_id != self.shared.session_id || ids.is_empty() {
            return false;
        }
        self.apply(Transition::StatusAdvance {
            ids: ids.to_vec(),
            status,
        })
    }

    /// Fetches up to `limit` messages of history and merges them.
    pub async fn load_history(&self, limit: u32) -> ChatResult<usize> {
        let messages = self
            .shared
            .gateway
            .fetch_history(&self.shared.session_id, limit)
            .await?;
        let fetched = messages.len();
        self.apply(Transition::History(messages));
        debug!(session_id = %self.shared.session_id, fetched, "store: history merged");
        Ok(fetched)
    }

    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.state().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Day groups in UTC.
    pub fn derived_view(&self) -> Vec<DayGroup> {
        self.derived_view_in(Utc.fix())
    }

    pub fn derived_view_in(&self, offset: FixedOffset) -> Vec<DayGroup> {
        group_entries(&self.state().entries, offset)
    }

    /// Confirmed messages from other participants not yet marked read.
    pub fn unread_from_others(&self) -> Vec<MessageId> {
        self.state()
            .entries
            .iter()
            .filter_map(|entry| match entry {
                TimelineEntry::Confirmed(message)
                    if message.sender.id != self.shared.me.id && message.status != MessageStatus::Read =>
                {
                    Some(message.id.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Receiver that observes a new revision after every change.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Routes pushed messages and receipts from `bus` into this store, in
    /// the order they were pushed.
    pub fn attach(&self, bus: &EventBus) -> Subscription {
        let store = self.clone();
        bus.subscribe_kinds(
            &[
                EventKind::NewMessage,
                EventKind::MessageRead,
                EventKind::MessageDelivered,
            ],
            move |event| match event {
                PushEvent::NewMessage(message) => {
                    store.apply_pushed_message(message);
                }
                PushEvent::MessageRead {
                    session_id,
                    message_ids,
                } => {
                    store.apply_read_receipt(session_id, message_ids);
                }
                PushEvent::MessageDelivered {
                    session_id,
                    message_ids,
                } => {
                    store.apply_delivered(session_id, message_ids);
                }
                _ => {}
            },
        )
    }

    /// Stops all further mutation. Sends still in flight complete as no-ops.
    pub fn dispose(&self) {
        if !self.shared.disposed.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.shared.session_id, "store: disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
