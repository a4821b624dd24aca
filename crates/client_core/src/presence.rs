//! Ephemeral typing indicators.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{SessionId, UserId},
    protocol::ClientFrame,
};
use tracing::debug;

use crate::{
    connection::ConnectionManager,
    error::ChatResult,
    events::{EventKind, PushEvent, Subscription},
};

#[derive(Default)]
struct PresenceState {
    remote: HashMap<SessionId, BTreeSet<UserId>>,
    announced: HashSet<SessionId>,
}

impl PresenceState {
    fn clear_user(&mut self, session_id: &SessionId, user_id: &UserId) {
        if let Some(users) = self.remote.get_mut(session_id) {
            users.remove(user_id);
            if users.is_empty() {
                self.remote.remove(session_id);
            }
        }
    }
}

fn lock(state: &Mutex<PresenceState>) -> MutexGuard<'_, PresenceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PresenceSignaler {
    connection: Arc<ConnectionManager>,
    me: UserId,
    state: Arc<Mutex<PresenceState>>,
    _subscription: Subscription,
}

impl PresenceSignaler {
    /// Starts tracking typing signals pushed through `connection`.
    /// Signals from `me` are ignored. Must be called inside a tokio runtime.
    pub fn attach(connection: Arc<ConnectionManager>, me: UserId) -> Self {
        let state = Arc::new(Mutex::new(PresenceState::default()));

        let tracker = {
            let (state, me) = (state.clone(), me.clone());
            connection.bus().subscribe_kinds(
                &[
                    EventKind::Typing,
                    EventKind::StopTyping,
                    EventKind::NewMessage,
                    EventKind::ConnectionState,
                ],
                move |event| {
                    let mut state = lock(&state);
                    match event {
                        PushEvent::Typing(signal) if signal.user_id != me => {
                            state
                                .remote
                                .entry(signal.session_id.clone())
                                .or_default()
                                .insert(signal.user_id.clone());
                        }
                        PushEvent::StopTyping(signal) => {
                            state.clear_user(&signal.session_id, &signal.user_id);
                        }
                        PushEvent::NewMessage(message) => {
                            state.clear_user(&message.session_id, &message.sender.id);
                        }
                        PushEvent::ConnectionState(connection_state) if !connection_state.is_connected() => {
                            state.remote.clear();
                            state.announced.clear();
                            debug!(?connection_state, "presence: reset on connection change");
                        }
                        _ => {}
                    }
                },
            )
        };

        Self {
            connection,
            me,
            state,
            _subscription: tracker,
        }
    }

    /// Announces that the local user is typing in `session_id`.
    /// Returns `false` when already announced.
    pub fn notify_typing(&self, session_id: &SessionId) -> ChatResult<bool> {
        if lock(&self.state).announced.contains(session_id) {
            return Ok(false);
        }
        self.connection.emit(ClientFrame::Typing {
            session_id: session_id.clone(),
            user_id: self.me.clone(),
        })?;
        lock(&self.state).announced.insert(session_id.clone());
        Ok(true)
    }

    /// Withdraws a previous typing announcement. Returns `false` when none was made.
    pub fn notify_stop_typing(&self, session_id: &SessionId) -> ChatResult<bool> {
        if !lock(&self.state).announced.remove(session_id) {
            return Ok(false);
        }
        self.connection.emit(ClientFrame::StopTyping {
            session_id: session_id.clone(),
            user_id: self.me.clone(),
        })?;
        Ok(true)
    }

    pub fn typing_users(&self, session_id: &SessionId) -> Vec<UserId> {
        lock(&self.state)
            .remote
            .get(session_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_typing(&self, session_id: &SessionId, user_id: &UserId) -> bool {
        lock(&self.state)
            .remote
            .get(session_id)
            .is_some_and(|users| users.contains(user_id))
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
