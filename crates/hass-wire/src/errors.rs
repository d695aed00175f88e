//! Wire-level failures and the server's result error codes.

// ── Result error-code constants ─────────────────────────────────────

/// Unclassified server failure.
pub const UNKNOWN_ERROR: &str = "unknown_error";
/// Command payload was malformed.
pub const INVALID_FORMAT: &str = "invalid_format";
/// Correlation id did not increase; the server rejected the command.
pub const ID_REUSE: &str = "id_reuse";
/// The server failed while executing the command.
pub const HOME_ASSISTANT_ERROR: &str = "home_assistant_error";
/// Command recognized but not supported by this server.
pub const NOT_SUPPORTED: &str = "not_supported";
/// The access token does not permit this command.
pub const UNAUTHORIZED: &str = "unauthorized";
/// The command timed out inside the server.
pub const TIMEOUT: &str = "timeout";

/// Failure to translate between a text frame and a typed envelope.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Frame is not valid JSON, or a field has the wrong shape.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame carries no `type` discriminator.
    #[error("frame is missing the `type` discriminator")]
    MissingType,

    /// A known envelope kind is missing a required field.
    #[error("envelope is missing required field `{field}`")]
    MissingField {
        /// Name of the missing field.
        field: String,
    },

    /// Outbound payload cannot be represented on the wire.
    #[error("{message}")]
    InvalidPayload {
        /// What is wrong with the payload.
        message: String,
    },
}
