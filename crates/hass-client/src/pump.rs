//! Per-generation receive pump.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use hass_wire::{Codec, EventMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::correlation::PendingCommands;

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpEnd {
    /// The generation was cancelled locally.
    Cancelled,
    /// The peer closed the socket.
    Closed,
    /// The socket failed mid-read.
    TransportError,
}

/// Read frames until the socket ends or the generation is cancelled.
///
/// Results and pongs resolve their pending waiters inline. Events are
/// queued for the dispatch task, so a slow listener cannot stall this
/// loop. Frames that fail to decode are logged and skipped; the session
/// stays up.
pub(crate) async fn run_pump<S>(
    mut reader: S,
    codec: Codec,
    pending: Arc<PendingCommands>,
    events_tx: mpsc::UnboundedSender<EventMessage>,
    cancel: CancellationToken,
) -> PumpEnd
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return PumpEnd::Cancelled,
            frame = reader.next() => frame,
        };
        let message = match frame {
            None => return PumpEnd::Closed,
            Some(Err(err)) => {
                debug!(error = %err, "socket read failed");
                return PumpEnd::TransportError;
            }
            Some(Ok(Message::Text(text))) => match codec.decode(text.as_str()) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "discarding undecodable frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) => return PumpEnd::Closed,
            // Binary and control frames carry nothing for us.
            Some(Ok(_)) => continue,
        };
        match message {
            ServerMessage::Event(event) => {
                if events_tx.send(event).is_err() {
                    warn!("event dispatch queue is gone");
                }
            }
            ServerMessage::Result(result) => {
                let id = result.id;
                if !pending.complete(id, ServerMessage::Result(result)) {
                    warn!(id, "no pending command for result");
                }
            }
            ServerMessage::Pong { id } => {
                if !pending.complete(id, ServerMessage::Pong { id }) {
                    warn!(id, "no pending command for pong");
                }
            }
            other => {
                warn!(
                    message_type = other.message_type(),
                    "ignoring unexpected message"
                );
            }
        }
    }
}
