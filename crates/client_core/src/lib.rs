//! Real-time messaging core of the care portal client.
//!
//! `ChatClient` wires the components together for one signed-in identity:
//! a `ConnectionManager` for the push link, a `SessionResolver` backed by the
//! SQLite session cache, the HTTP `ChatGateway`, and a `PresenceSignaler`.
//! Conversations opened through it own a `MessageStore` each.

use std::sync::Arc;

use shared::domain::{Identity, UserId};
use storage::Storage;
use tracing::{info, warn};

pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod events;
pub mod gateway;
pub mod presence;
pub mod resolver;
pub mod store;
pub mod timeline;
pub mod transport;
pub mod types;

pub use config::{load_settings, ClientSettings, ReconnectPolicy};
pub use connection::ConnectionManager;
pub use conversation::Conversation;
pub use error::{ChatError, ChatResult};
pub use events::{EventBus, EventKind, PushEvent, Subscription};
pub use gateway::{ChatGateway, HttpGateway};
pub use presence::PresenceSignaler;
pub use resolver::{NoPersistentCache, PairKey, SessionCacheStore, SessionResolver};
pub use store::{MessageStore, PendingSend, SendOutcome};
pub use timeline::{DayGroup, LocalMessage, SenderRun, TimelineEntry};
pub use transport::{PushConnector, WsConnector};
pub use types::{
    Attachment, ChatSession, ConnectionId, ConnectionState, FileUpload, Message, MessageStatus,
    TypingSignal,
};

pub struct ChatClient {
    settings: ClientSettings,
    identity: Identity,
    gateway: Arc<dyn ChatGateway>,
    connection: Arc<ConnectionManager>,
    resolver: Arc<SessionResolver>,
    presence: Arc<PresenceSignaler>,
}

impl ChatClient {
    /// Builds a client with the HTTP gateway, the WebSocket transport and the
    /// SQLite session cache at `settings.cache_database_url`. An unusable cache
    /// database degrades to memory-only caching.
    pub async fn initialize(settings: ClientSettings, identity: Identity) -> Arc<Self> {
        let gateway = Arc::new(HttpGateway::new(&settings, &identity));
        let connector = Arc::new(WsConnector::new(settings.request_timeout()));
        let persistent: Arc<dyn SessionCacheStore> =
            match Storage::new(&settings.cache_database_url).await {
                Ok(storage) => Arc::new(storage),
                Err(err) => {
                    warn!(
                        database_url = %settings.cache_database_url,
                        "chat: session cache unavailable, caching in memory only: {err:#}"
                    );
                    Arc::new(NoPersistentCache)
                }
            };
        Self::with_dependencies(settings, identity, gateway, connector, persistent)
    }

    pub fn with_dependencies(
        settings: ClientSettings,
        identity: Identity,
        gateway: Arc<dyn ChatGateway>,
        connector: Arc<dyn PushConnector>,
        persistent: Arc<dyn SessionCacheStore>,
    ) -> Arc<Self> {
        let connection = ConnectionManager::from_settings(&settings, connector);
        let resolver = SessionResolver::new(gateway.clone(), persistent, settings.probe_limit);
        let presence = Arc::new(PresenceSignaler::attach(
            connection.clone(),
            identity.user_id.clone(),
        ));
        Arc::new(Self {
            settings,
            identity,
            gateway,
            connection,
            resolver,
            presence,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn resolver(&self) -> &Arc<SessionResolver> {
        &self.resolver
    }

    pub fn presence(&self) -> &Arc<PresenceSignaler> {
        &self.presence
    }

    pub(crate) fn gateway(&self) -> &Arc<dyn ChatGateway> {
        &self.gateway
    }

    pub async fn connect(&self) -> ChatResult<ConnectionId> {
        self.connection.connect(self.identity.clone()).await
    }

    /// Opens the conversation with `counterpart`, creating the session on
    /// first contact. The push link is best effort: without it the
    /// conversation still sends and loads history.
    pub async fn open_conversation(&self, counterpart: &UserId) -> ChatResult<Conversation> {
        if let Err(err) = self.connect().await {
            warn!(error = %err, "chat: push link unavailable, live updates paused");
        }
        let session_id = self.resolver.resolve(&self.identity.user_id, counterpart).await?;
        Conversation::open(self, session_id, counterpart.clone(), None).await
    }

    /// Replaces `current` with the conversation with `counterpart`. The old
    /// session is left before the new one is joined.
    pub async fn switch_conversation(
        &self,
        current: &mut Conversation,
        counterpart: &UserId,
    ) -> ChatResult<()> {
        let session_id = self.resolver.resolve(&self.identity.user_id, counterpart).await?;
        if &session_id == current.session_id() {
            return Ok(());
        }
        let previous = current.session_id().clone();
        match Conversation::open(self, session_id, counterpart.clone(), Some(&previous)).await {
            Ok(next) => {
                *current = next;
                Ok(())
            }
            Err(err) => {
                self.connection.join_session(&previous)?;
                Err(err)
            }
        }
    }

    /// Forgets every cached session and closes the push link.
    pub async fn logout(&self) -> ChatResult<()> {
        self.resolver.clear().await?;
        self.connection.disconnect();
        info!(user_id = %self.identity.user_id, "chat: logged out");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
