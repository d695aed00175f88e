//! Client error type and result-error classification.

use hass_wire::{ResultMessage, WireError};
use tracing::warn;

/// Server result error-code constants.
pub use hass_wire::errors as codes;

/// Errors surfaced by [`crate::HassClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// `connect` was called while a session is already open or opening.
    #[error("client is not disconnected")]
    AlreadyConnected,

    /// A caller-supplied argument is invalid.
    #[error("{message}")]
    InvalidArgument {
        /// Description of what is wrong.
        message: String,
    },

    /// The operation requires an established session.
    #[error("client is not connected")]
    NotConnected,

    /// The server rejected the handshake or the access token.
    #[error("authentication failed: {message}")]
    Authentication {
        /// Server-provided or local description.
        message: String,
    },

    /// The underlying socket failed.
    #[error("transport error: {source}")]
    Transport {
        /// Socket-level cause.
        #[from]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection closed before the server answered.
    #[error("connection closed before the server answered")]
    ConnectionClosed,

    /// The client was disposed and accepts no further work.
    #[error("client has been disposed")]
    Disposed,

    /// The server answered with something a well-behaved peer never sends.
    #[error("protocol violation: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// The server reported a fatal command error.
    #[error("command failed ({code}): {message}")]
    Command {
        /// Wire error code, e.g. `id_reuse`.
        code: String,
        /// Server-provided message.
        message: String,
    },

    /// The server reported the session is not authorized for the command.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Server-provided message.
        message: String,
    },

    /// The server reported the command timed out on its side.
    #[error("command timed out: {message}")]
    CommandTimeout {
        /// Server-provided message.
        message: String,
    },

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl ClientError {
    /// Whether a fresh connection attempt could clear this error.
    ///
    /// Only socket-level failures qualify; everything else (bad token,
    /// protocol violation, caller mistake) fails the same way again on a
    /// fresh socket.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::ConnectionClosed)
    }
}

/// Classify the error carried by a command result.
///
/// Fatal codes become errors. Unknown codes are logged and passed through,
/// leaving the caller to inspect `success`.
pub(crate) fn check_result_error(result: &ResultMessage) -> Result<(), ClientError> {
    let Some(error) = &result.error else {
        return Ok(());
    };
    match error.code.as_str() {
        codes::UNKNOWN_ERROR
        | codes::INVALID_FORMAT
        | codes::ID_REUSE
        | codes::HOME_ASSISTANT_ERROR
        | codes::NOT_SUPPORTED => Err(ClientError::Command {
            code: error.code.clone(),
            message: error.message.clone(),
        }),
        codes::UNAUTHORIZED => Err(ClientError::Unauthorized {
            message: error.message.clone(),
        }),
        codes::TIMEOUT => Err(ClientError::CommandTimeout {
            message: error.message.clone(),
        }),
        other => {
            warn!(
                id = result.id,
                code = other,
                message = %error.message,
                "unrecognized result error code"
            );
            Ok(())
        }
    }
}
