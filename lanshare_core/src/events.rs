use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::registry::Peer;
use crate::transfer::session::{Role, TransferId, TransferOutcome, TransferProgress, TransferRequest};

/// Capacity of the event channel; slow subscribers lag past this
pub const EVENT_CAPACITY: usize = 1024;

/// Commands from the UI to the core
#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Announce now instead of waiting for the next interval
    Rescan,
    SendFile {
        peer_id: String,
        path: PathBuf,
    },
    /// Answer an `IncomingRequest`
    RespondIncoming {
        session_id: TransferId,
        accept: bool,
    },
    Cancel {
        session_id: TransferId,
    },
}

/// Reports from the core to the UI and notification collaborators
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),
    Error(String),

    PeerListChanged(Vec<Peer>),

    /// A peer offers a file; answer with `RespondIncoming`
    IncomingRequest {
        session_id: TransferId,
        request: Arc<TransferRequest>,
    },

    TransferStateChanged(TransferProgress),

    /// Terminal event of a session; drives the completion notification
    TransferFinished {
        session_id: TransferId,
        file_name: String,
        role: Role,
        outcome: TransferOutcome,
    },
}

/// Fan-out of `AppEvent`s. Publishing never waits on subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: AppEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.publish(AppEvent::Status(message.into()));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(AppEvent::Error(message.into()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
