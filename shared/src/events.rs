use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::ConnectionState;
use crate::queue::MutationId;

pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// State changes the presentation layer may react to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    ConnectionChanged(ConnectionState),
    /// The server rejected the credential; the session was cleared.
    AuthInvalidated,
    SignedIn { user_id: Option<String> },
    SignedOut,
    MutationQueued {
        mutation_id: MutationId,
        endpoint: String,
    },
    SyncCompleted { replayed: usize },
    SyncFailed {
        mutation_id: MutationId,
        endpoint: String,
        attempts: u32,
    },
}

/// Fan-out of [`CoreEvent`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CoreEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            trace!(?event, "no event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
