//! # hass-client
//!
//! Persistent Home Assistant WebSocket client.
//!
//! - One duplex connection with the token handshake driven for you
//! - Correlated command round trips over the shared socket
//! - Reference-counted event subscriptions, replayed after reconnects
//! - Automatic background reconnection for socket-level failures
//!
//! The wire format lives in `hass-wire`; its message types are re-exported
//! here so most users only need this crate.

#![deny(unsafe_code)]

mod client;
pub mod config;
mod correlation;
mod dispatch;
pub mod errors;
mod pump;
mod session;
mod state;
mod subscriptions;

pub use client::HassClient;
pub use config::{ClientConfig, ConnectionParameters};
pub use errors::ClientError;
pub use state::ConnectionState;
pub use subscriptions::{ListenerId, Topic};

pub use hass_wire::{
    CommandMessage, Context, ErrorInfo, EventMessage, EventResultInfo, RawCommand, RawEnvelope,
    ResultMessage, ServerMessage, WireError,
};
