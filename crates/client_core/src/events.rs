//! Typed push-event fan-out over a broadcast channel.
//!
//! Each subscription owns a receiver task that filters the stream by kind and
//! runs its handler in publish order. Dropping the `Subscription` aborts that
//! task, so exactly that handler stops.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use shared::domain::{MessageId, SessionId};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::types::{ConnectionState, Message, TypingSignal};

const EVENT_CAPACITY: usize = 256;
const KIND_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    Typing,
    StopTyping,
    MessageRead,
    MessageDelivered,
    ConnectionState,
}

impl EventKind {
    fn index(self) -> usize {
        match self {
            EventKind::NewMessage => 0,
            EventKind::Typing => 1,
            EventKind::StopTyping => 2,
            EventKind::MessageRead => 3,
            EventKind::MessageDelivered => 4,
            EventKind::ConnectionState => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    NewMessage(Message),
    Typing(TypingSignal),
    StopTyping(TypingSignal),
    MessageRead {
        session_id: SessionId,
        message_ids: Vec<MessageId>,
    },
    MessageDelivered {
        session_id: SessionId,
        message_ids: Vec<MessageId>,
    },
    ConnectionState(ConnectionState),
}

impl PushEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PushEvent::NewMessage(_) => EventKind::NewMessage,
            PushEvent::Typing(_) => EventKind::Typing,
            PushEvent::StopTyping(_) => EventKind::StopTyping,
            PushEvent::MessageRead { .. } => EventKind::MessageRead,
            PushEvent::MessageDelivered { .. } => EventKind::MessageDelivered,
            PushEvent::ConnectionState(_) => EventKind::ConnectionState,
        }
    }
}

type ActiveCounts = [AtomicUsize; KIND_COUNT];

#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<PushEvent>,
    active: Arc<ActiveCounts>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            active: Arc::new(Default::default()),
        }
    }

    /// Registers `handler` for one kind. Must be called inside a tokio runtime.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: FnMut(&PushEvent) + Send + 'static,
    {
        self.subscribe_kinds(&[kind], handler)
    }

    /// Registers one handler for several kinds. Events reach it in the order
    /// they were published, across all of its kinds.
    pub fn subscribe_kinds<F>(&self, kinds: &[EventKind], mut handler: F) -> Subscription
    where
        F: FnMut(&PushEvent) + Send + 'static,
    {
        let mut kinds = kinds.to_vec();
        kinds.sort_by_key(|kind| kind.index());
        kinds.dedup();
        for kind in &kinds {
            self.active[kind.index()].fetch_add(1, Ordering::SeqCst);
        }

        let mut receiver = self.events.subscribe();
        let filter = kinds.clone();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if filter.contains(&event.kind()) {
                            handler(&event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, kinds = ?filter, "events: subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => {
                        debug!(kinds = ?filter, "events: bus closed");
                        break;
                    }
                }
            }
        });

        Subscription {
            kinds,
            task,
            active: Arc::downgrade(&self.active),
            released: false,
        }
    }

    /// Queues `event` for every subscriber. Returns how many receivers were listening.
    pub fn publish(&self, event: PushEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    /// Number of live subscriptions covering `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.active[kind.index()].load(Ordering::SeqCst)
    }
}

/// Registration handle. Dropping it unsubscribes.
#[must_use = "dropping a Subscription removes its handler"]
pub struct Subscription {
    kinds: Vec<EventKind>,
    task: JoinHandle<()>,
    active: Weak<ActiveCounts>,
    released: bool,
}

impl Subscription {
    pub fn kinds(&self) -> &[EventKind] {
        &self.kinds
    }

    /// False once unsubscribed or once the bus is gone.
    pub fn is_active(&self) -> bool {
        !self.released && !self.task.is_finished()
    }

    /// Removes exactly this handler. Returns false when it was no longer running.
    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        let was_running = !self.task.is_finished();
        self.task.abort();
        if let Some(active) = self.active.upgrade() {
            for kind in &self.kinds {
                active[kind.index()].fetch_sub(1, Ordering::SeqCst);
            }
        }
        was_running
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kinds", &self.kinds)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/events_tests.rs"]
mod tests;
