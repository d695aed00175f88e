//! Connection lifecycle states and change notification.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Lifecycle of the client's single connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket. The initial state, and the terminal state after `close`.
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Socket open, handshake in progress.
    Authenticating,
    /// Session lost or re-established; subscriptions being replayed.
    Restoring,
    /// Session ready for commands.
    Connected,
}

/// Current state plus a broadcast channel announcing every change.
///
/// Writes and notification happen under one lock so observers see changes
/// in the order they occurred. Repeated writes of the same state are
/// swallowed.
pub(crate) struct StateTracker {
    current: RwLock<ConnectionState>,
    tx: broadcast::Sender<ConnectionState>,
}

impl StateTracker {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            current: RwLock::new(ConnectionState::Disconnected),
            tx,
        }
    }

    pub(crate) fn current(&self) -> ConnectionState {
        *self.current.read()
    }

    pub(crate) fn set(&self, next: ConnectionState) {
        let mut current = self.current.write();
        if *current == next {
            return;
        }
        debug!(from = ?*current, to = ?next, "connection state changed");
        *current = next;
        // Receivers may not exist yet; that is fine.
        let _ = self.tx.send(next);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}
