//! Typed envelopes exchanged over the WebSocket API.
//!
//! Outbound traffic is either the pre-session `auth` message (built directly
//! by the codec) or an identifiable [`CommandMessage`] that the codec stamps
//! with a correlation id. Inbound frames decode to a [`ServerMessage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::WireError;

/// Client-to-server command, serialized as `{"id": ..., "type": ..., ...}`.
///
/// The correlation id is not part of the value; it is assigned at send time
/// and injected by [`Codec::encode_command`](crate::Codec::encode_command).
#[derive(Debug, Clone, PartialEq)]
pub enum CommandMessage {
    /// Subscribe to an event topic. `None` subscribes to every event.
    SubscribeEvents {
        /// Event type to subscribe to; absent on the wire for the wildcard.
        event_type: Option<String>,
    },
    /// Drop a server-side event subscription.
    UnsubscribeEvents {
        /// The server-assigned subscription id to cancel.
        subscription: u64,
    },
    /// Application-level keepalive; the server answers with `pong`.
    Ping,
    /// Escape hatch for commands without a dedicated variant.
    Raw(RawCommand),
}

impl CommandMessage {
    /// Build a pass-through command from a type string and a payload object.
    pub fn raw(msg_type: impl Into<String>, payload: Value) -> Self {
        Self::Raw(RawCommand {
            msg_type: msg_type.into(),
            payload,
        })
    }

    /// The `type` discriminator this command carries on the wire.
    pub fn command_type(&self) -> &str {
        match self {
            Self::SubscribeEvents { .. } => "subscribe_events",
            Self::UnsubscribeEvents { .. } => "unsubscribe_events",
            Self::Ping => "ping",
            Self::Raw(raw) => &raw.msg_type,
        }
    }
}

/// Arbitrary command forwarded verbatim under the protocol envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCommand {
    /// The `type` discriminator to send.
    pub msg_type: String,
    /// Extra fields merged into the frame; must be a JSON object (or null).
    pub payload: Value,
}

/// Inbound frame, classified by its `type` discriminator.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Handshake opener; the server expects `auth` next.
    AuthRequired {
        /// Server version string.
        ha_version: String,
    },
    /// Handshake success.
    AuthOk {
        /// Server version string.
        ha_version: String,
    },
    /// Handshake rejection.
    AuthInvalid {
        /// Human-readable reason.
        message: String,
    },
    /// Correlated answer to a command.
    Result(ResultMessage),
    /// Out-of-band event notification.
    Event(EventMessage),
    /// Keepalive answer, correlated like a result.
    Pong {
        /// Correlation id of the `ping` this answers.
        id: u64,
    },
    /// Server-initiated keepalive (not part of the normal exchange).
    Ping {
        /// Correlation id, when the server includes one.
        id: Option<u64>,
    },
    /// Frame with an unrecognized `type`, kept verbatim.
    Raw(RawEnvelope),
}

impl ServerMessage {
    /// The `type` discriminator this frame carried.
    pub fn message_type(&self) -> &str {
        match self {
            Self::AuthRequired { .. } => "auth_required",
            Self::AuthOk { .. } => "auth_ok",
            Self::AuthInvalid { .. } => "auth_invalid",
            Self::Result(_) => "result",
            Self::Event(_) => "event",
            Self::Pong { .. } => "pong",
            Self::Ping { .. } => "ping",
            Self::Raw(raw) => &raw.msg_type,
        }
    }
}

/// Answer to an identifiable command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Correlation id echoed from the command.
    pub id: u64,
    /// Whether the server executed the command.
    pub success: bool,
    /// Command-specific payload; shape is opaque to the session layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure detail, present when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ResultMessage {
    /// Deserialize the `result` payload into a concrete type.
    ///
    /// An absent payload deserializes as JSON null, so optional targets
    /// resolve to `None` rather than failing.
    pub fn deserialize_result<T: serde::de::DeserializeOwned>(&self) -> Result<T, WireError> {
        let value = self.result.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

/// Error detail attached to a failed result.
///
/// `code` stays a string so unrecognized server codes survive intact; the
/// known values live in [`crate::errors`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Event notification frame.
///
/// `id` is the subscription id the event was delivered under, not a fresh
/// correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Server subscription id this event belongs to.
    pub id: u64,
    /// Raw event body; parses as [`EventResultInfo`] for fired events.
    pub event: Value,
}

impl EventMessage {
    /// Deserialize the event body into a concrete type.
    pub fn deserialize_event<T: serde::de::DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_value(self.event.clone())?)
    }
}

/// Parsed body of a fired event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResultInfo {
    /// Event type, e.g. `state_changed`.
    pub event_type: String,
    /// When the server fired the event.
    pub time_fired: DateTime<Utc>,
    /// Where the event originated (`LOCAL` or `REMOTE`).
    pub origin: String,
    /// Event-specific payload; shape is opaque to the session layer.
    pub data: Value,
    /// Context the event was fired under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

/// Context attached to a fired event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique context id.
    pub id: String,
    /// Parent context id, if this event was caused by another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// User that triggered the event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Inbound frame with a `type` the codec does not recognize.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEnvelope {
    /// The unrecognized `type` discriminator.
    pub msg_type: String,
    /// Correlation id, when the frame carried one.
    pub id: Option<u64>,
    /// The complete frame as received, including `type` and `id`.
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Commands ────────────────────────────────────────────────────────

    #[test]
    fn command_type_matches_variant() {
        let subscribe = CommandMessage::SubscribeEvents { event_type: None };
        assert_eq!(subscribe.command_type(), "subscribe_events");

        let unsubscribe = CommandMessage::UnsubscribeEvents { subscription: 7 };
        assert_eq!(unsubscribe.command_type(), "unsubscribe_events");

        assert_eq!(CommandMessage::Ping.command_type(), "ping");

        let raw = CommandMessage::raw("call_service", json!({"domain": "light"}));
        assert_eq!(raw.command_type(), "call_service");
    }

    // ── Results ─────────────────────────────────────────────────────────

    #[test]
    fn result_message_parses_error_detail() {
        let frame = r#"{"id":5,"type":"result","success":false,"error":{"code":"id_reuse","message":"Identifier values have to increase."}}"#;
        let result: ResultMessage = serde_json::from_str(frame).unwrap();
        assert_eq!(result.id, 5);
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, "id_reuse");
        assert_eq!(error.message, "Identifier values have to increase.");
    }

    #[test]
    fn deserialize_result_reads_payload() {
        #[derive(Debug, PartialEq, serde::Deserialize)]
        struct Version {
            version: String,
        }

        let result = ResultMessage {
            id: 1,
            success: true,
            result: Some(json!({"version": "2024.1.0"})),
            error: None,
        };
        let version: Version = result.deserialize_result().unwrap();
        assert_eq!(version.version, "2024.1.0");
    }

    #[test]
    fn deserialize_result_treats_missing_payload_as_null() {
        let result = ResultMessage {
            id: 1,
            success: true,
            result: None,
            error: None,
        };
        let value: Option<String> = result.deserialize_result().unwrap();
        assert_eq!(value, None);
    }

    // ── Events ──────────────────────────────────────────────────────────

    #[test]
    fn event_body_parses_fired_event() {
        let frame = r#"{
            "id": 18,
            "type": "event",
            "event": {
                "event_type": "state_changed",
                "time_fired": "2024-02-09T12:07:13.313288+00:00",
                "origin": "LOCAL",
                "data": {"entity_id": "light.bed_light"},
                "context": {"id": "326ef27d19415c60c492fe330945f954", "parent_id": null, "user_id": null}
            }
        }"#;
        let event: EventMessage = serde_json::from_str(frame).unwrap();
        assert_eq!(event.id, 18);

        let info: EventResultInfo = event.deserialize_event().unwrap();
        assert_eq!(info.event_type, "state_changed");
        assert_eq!(info.origin, "LOCAL");
        assert_eq!(info.data["entity_id"], "light.bed_light");
        let context = info.context.unwrap();
        assert_eq!(context.id, "326ef27d19415c60c492fe330945f954");
        assert_eq!(context.parent_id, None);
    }

    #[test]
    fn event_body_without_context_still_parses() {
        let event = EventMessage {
            id: 2,
            event: json!({
                "event_type": "ping",
                "time_fired": "2024-02-09T12:07:13+00:00",
                "origin": "REMOTE",
                "data": {}
            }),
        };
        let info: EventResultInfo = event.deserialize_event().unwrap();
        assert_eq!(info.context, None);
    }
}
