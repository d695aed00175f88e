//! Correlation-id allocation and pending command waiters.

use std::collections::HashMap;

use hass_wire::ServerMessage;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::ClientError;

type WaiterTx = oneshot::Sender<Result<ServerMessage, ClientError>>;
pub(crate) type WaiterRx = oneshot::Receiver<Result<ServerMessage, ClientError>>;

#[derive(Default)]
struct PendingInner {
    last_sent_id: u64,
    waiters: HashMap<u64, WaiterTx>,
}

/// In-flight commands keyed by correlation id.
///
/// Id allocation and waiter registration happen under one lock, so an
/// answer arriving right after the send always finds its waiter. Each
/// waiter resolves exactly once: with the server's answer, or with an
/// error when the socket goes away first.
#[derive(Default)]
pub(crate) struct PendingCommands {
    inner: Mutex<PendingInner>,
}

impl PendingCommands {
    /// Allocate the next correlation id and register a waiter for it.
    pub(crate) fn register(&self) -> (u64, WaiterRx) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        inner.last_sent_id += 1;
        let id = inner.last_sent_id;
        let _ = inner.waiters.insert(id, tx);
        (id, rx)
    }

    /// Resolve the waiter for `id` with a server answer.
    ///
    /// Returns whether a waiter was registered for that id. A waiter whose
    /// caller already gave up counts as registered; the answer is dropped.
    pub(crate) fn complete(&self, id: u64, message: ServerMessage) -> bool {
        let Some(tx) = self.inner.lock().waiters.remove(&id) else {
            return false;
        };
        let _ = tx.send(Ok(message));
        true
    }

    /// Forget the waiter for `id`, if any. Used when a send fails or the
    /// caller cancels.
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.inner.lock().waiters.remove(&id).is_some()
    }

    /// Resolve every outstanding waiter with an error and return how many
    /// there were.
    pub(crate) fn abort_all(&self, error: impl Fn() -> ClientError) -> usize {
        let drained: Vec<WaiterTx> = {
            let mut inner = self.inner.lock();
            inner.waiters.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }

    /// Restart the id sequence for a fresh socket. Ids start at 1 again.
    pub(crate) fn reset(&self) {
        self.inner.lock().last_sent_id = 0;
    }

    /// Number of commands still waiting for an answer.
    pub(crate) fn count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn ids_start_at_one_and_increase() {
        let pending = PendingCommands::default();
        let (first, _rx1) = pending.register();
        let (second, _rx2) = pending.register();
        let (third, _rx3) = pending.register();
        assert_eq!((first, second, third), (1, 2, 3));
    }

    #[test]
    fn complete_delivers_exactly_once() {
        let pending = PendingCommands::default();
        let (id, mut rx) = pending.register();
        assert!(pending.complete(id, ServerMessage::Pong { id }));
        assert_matches!(rx.try_recv(), Ok(Ok(ServerMessage::Pong { id: 1 })));
        assert!(!pending.complete(id, ServerMessage::Pong { id }));
    }

    #[test]
    fn complete_unknown_id_reports_none() {
        let pending = PendingCommands::default();
        assert!(!pending.complete(42, ServerMessage::Pong { id: 42 }));
    }

    #[test]
    fn remove_forgets_the_waiter() {
        let pending = PendingCommands::default();
        let (id, mut rx) = pending.register();
        assert!(pending.remove(id));
        assert!(!pending.remove(id));
        assert!(!pending.complete(id, ServerMessage::Pong { id }));
        assert_matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed));
    }

    #[test]
    fn abort_all_resolves_every_waiter_with_the_error() {
        let pending = PendingCommands::default();
        let (_, mut rx1) = pending.register();
        let (_, mut rx2) = pending.register();
        assert_eq!(pending.abort_all(|| ClientError::ConnectionClosed), 2);
        assert_eq!(pending.count(), 0);
        assert_matches!(rx1.try_recv(), Ok(Err(ClientError::ConnectionClosed)));
        assert_matches!(rx2.try_recv(), Ok(Err(ClientError::ConnectionClosed)));
    }

    #[test]
    fn reset_restarts_the_id_sequence() {
        let pending = PendingCommands::default();
        let (first, rx) = pending.register();
        assert_eq!(first, 1);
        drop(rx);
        let _ = pending.remove(first);
        pending.reset();
        let (next, _rx) = pending.register();
        assert_eq!(next, 1);
    }

    #[test]
    fn count_tracks_outstanding_waiters() {
        let pending = PendingCommands::default();
        assert_eq!(pending.count(), 0);
        let (id, _rx) = pending.register();
        assert_eq!(pending.count(), 1);
        let _ = pending.complete(id, ServerMessage::Pong { id });
        assert_eq!(pending.count(), 0);
    }
}
