//! The owning view of one active session.

use std::sync::Arc;

use chrono::FixedOffset;
use shared::{
    domain::{SessionId, TempId, UserId},
    protocol::ClientFrame,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    connection::ConnectionManager,
    error::ChatResult,
    events::Subscription,
    presence::PresenceSignaler,
    store::{MessageStore, PendingSend},
    timeline::{DayGroup, TimelineEntry},
    types::{Attachment, FileUpload},
    ChatClient,
};

/// Joins exactly one session and routes its pushed events into a
/// `MessageStore`. Dropping it disposes the store and its subscription;
/// `close` additionally leaves the session.
pub struct Conversation {
    session_id: SessionId,
    counterpart: UserId,
    history_limit: u32,
    store: MessageStore,
    connection: Arc<ConnectionManager>,
    presence: Arc<PresenceSignaler>,
    _subscription: Subscription,
}

impl Conversation {
    pub(crate) async fn open(
        client: &ChatClient,
        session_id: SessionId,
        counterpart: UserId,
        previous: Option<&SessionId>,
    ) -> ChatResult<Self> {
        let connection = client.connection().clone();
        let store = MessageStore::new(
            session_id.clone(),
            client.identity().participant(),
            client.gateway().clone(),
        );
        let subscription = store.attach(connection.bus());
        if let Err(err) = connection.switch_session(previous, &session_id) {
            warn!(session_id = %session_id, error = %err, "conversation: join not announced");
        }

        let history_limit = client.settings().history_limit;
        if let Err(err) = store.load_history(history_limit).await {
            warn!(session_id = %session_id, error = %err, "conversation: history load failed");
            store.dispose();
            if let Err(leave_err) = connection.leave_session(&session_id) {
                debug!(error = %leave_err, "conversation: leave after failed open");
            }
            return Err(err);
        }
        info!(
            session_id = %session_id,
            counterpart = %counterpart,
            messages = store.len(),
            "conversation: opened"
        );

        Ok(Self {
            session_id,
            counterpart,
            history_limit,
            store,
            connection,
            presence: client.presence().clone(),
            _subscription: subscription,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn counterpart(&self) -> &UserId {
        &self.counterpart
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn send(&self, content: impl Into<String>) -> ChatResult<PendingSend> {
        let pending = self.store.send_local(content, Vec::new())?;
        self.settle_typing();
        Ok(pending)
    }

    pub fn send_with_attachments(
        &self,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> ChatResult<PendingSend> {
        let pending = self.store.send_local(content, attachments)?;
        self.settle_typing();
        Ok(pending)
    }

    pub fn send_with_files(
        &self,
        content: impl Into<String>,
        files: Vec<FileUpload>,
    ) -> ChatResult<PendingSend> {
        let pending = self.store.send_local_with_files(content, files)?;
        self.settle_typing();
        Ok(pending)
    }

    pub fn retry(&self, temp_id: TempId) -> ChatResult<PendingSend> {
        self.store.retry(temp_id)
    }

    fn settle_typing(&self) {
        if let Err(err) = self.presence.notify_stop_typing(&self.session_id) {
            debug!(error = %err, "conversation: stop-typing not delivered");
        }
    }

    pub fn typing(&self) -> ChatResult<bool> {
        self.presence.notify_typing(&self.session_id)
    }

    pub fn stop_typing(&self) -> ChatResult<bool> {
        self.presence.notify_stop_typing(&self.session_id)
    }

    pub fn typing_users(&self) -> Vec<UserId> {
        self.presence.typing_users(&self.session_id)
    }

    /// Reports every unread message from the other side as read.
    /// Statuses change only once the server echoes the receipt.
    pub fn mark_read(&self) -> ChatResult<usize> {
        let message_ids = self.store.unread_from_others();
        if message_ids.is_empty() {
            return Ok(0);
        }
        let count = message_ids.len();
        self.connection.emit(ClientFrame::MarkRead {
            session_id: self.session_id.clone(),
            message_ids,
        })?;
        Ok(count)
    }

    pub async fn reload_history(&self) -> ChatResult<usize> {
        self.store.load_history(self.history_limit).await
    }

    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.store.entries()
    }

    pub fn view(&self) -> Vec<DayGroup> {
        self.store.derived_view()
    }

    pub fn view_in(&self, offset: FixedOffset) -> Vec<DayGroup> {
        self.store.derived_view_in(offset)
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.store.subscribe_changes()
    }

    /// Disposes the store, drops the subscription and leaves the session.
    pub fn close(self) {
        self.store.dispose();
        if let Err(err) = self.connection.leave_session(&self.session_id) {
            debug!(session_id = %self.session_id, error = %err, "conversation: leave not delivered");
        }
        info!(session_id = %self.session_id, "conversation: closed");
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.store.dispose();
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
