//! # hass-wire
//!
//! Envelope types and codec for the Home Assistant WebSocket API.
//!
//! - Typed envelopes: auth handshake, commands, results, events, keepalive
//! - `Codec`: text frame encode/decode keyed on the `type` discriminator
//! - Unknown inbound types are preserved as raw pass-through envelopes
//! - Server error-code constants for failed command results

#![deny(unsafe_code)]

mod codec;
pub mod errors;
mod messages;

pub use codec::Codec;
pub use errors::WireError;
pub use messages::{
    CommandMessage, Context, ErrorInfo, EventMessage, EventResultInfo, RawCommand, RawEnvelope,
    ResultMessage, ServerMessage,
};
