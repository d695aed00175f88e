//! Text frame encode/decode keyed on the `type` discriminator.

use serde_json::{Map, Value, json};

use crate::errors::WireError;
use crate::messages::{CommandMessage, RawEnvelope, ServerMessage};

/// Stateless translator between wire frames and typed envelopes.
///
/// Decoding dispatches through a fixed table of known `type` values; frames
/// with any other discriminator come back as [`ServerMessage::Raw`] so
/// callers can log or inspect them without losing data.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec;

impl Codec {
    /// Create a codec. One instance is shared by a whole session.
    pub fn new() -> Self {
        Self
    }

    /// Serialize the pre-session authentication message.
    pub fn encode_auth(self, access_token: &str) -> String {
        json!({"type": "auth", "access_token": access_token}).to_string()
    }

    /// Serialize a command under the given correlation id.
    ///
    /// For [`CommandMessage::Raw`] the payload object is merged into the
    /// frame first and the `type`/`id` envelope fields are written last, so
    /// a payload can never shadow them.
    pub fn encode_command(self, command: &CommandMessage, id: u64) -> Result<String, WireError> {
        let frame = match command {
            CommandMessage::SubscribeEvents { event_type } => {
                let mut frame = json!({"id": id, "type": "subscribe_events"});
                if let Some(event_type) = event_type {
                    frame["event_type"] = Value::String(event_type.clone());
                }
                frame
            }
            CommandMessage::UnsubscribeEvents { subscription } => {
                json!({"id": id, "type": "unsubscribe_events", "subscription": subscription})
            }
            CommandMessage::Ping => json!({"id": id, "type": "ping"}),
            CommandMessage::Raw(raw) => {
                let mut frame = match &raw.payload {
                    Value::Object(fields) => fields.clone(),
                    Value::Null => Map::new(),
                    other => {
                        return Err(WireError::InvalidPayload {
                            message: format!(
                                "raw command payload must be a JSON object, got {other}"
                            ),
                        });
                    }
                };
                let _ = frame.insert("type".into(), Value::String(raw.msg_type.clone()));
                let _ = frame.insert("id".into(), Value::from(id));
                Value::Object(frame)
            }
        };
        Ok(frame.to_string())
    }

    /// Decode one inbound text frame.
    pub fn decode(self, text: &str) -> Result<ServerMessage, WireError> {
        let value: Value = serde_json::from_str(text)?;
        let Some(msg_type) = value.get("type").and_then(Value::as_str) else {
            return Err(WireError::MissingType);
        };

        let message = match msg_type {
            "auth_required" => ServerMessage::AuthRequired {
                ha_version: required_str(&value, "ha_version")?,
            },
            "auth_ok" => ServerMessage::AuthOk {
                ha_version: required_str(&value, "ha_version")?,
            },
            "auth_invalid" => ServerMessage::AuthInvalid {
                message: required_str(&value, "message")?,
            },
            "result" => ServerMessage::Result(serde_json::from_value(value)?),
            "event" => ServerMessage::Event(serde_json::from_value(value)?),
            "pong" => ServerMessage::Pong {
                id: required_id(&value)?,
            },
            "ping" => ServerMessage::Ping {
                id: value.get("id").and_then(Value::as_u64),
            },
            other => ServerMessage::Raw(RawEnvelope {
                msg_type: other.to_owned(),
                id: value.get("id").and_then(Value::as_u64),
                payload: value,
            }),
        };
        Ok(message)
    }
}

fn required_str(value: &Value, field: &str) -> Result<String, WireError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| WireError::MissingField {
            field: field.to_owned(),
        })
}

fn required_id(value: &Value) -> Result<u64, WireError> {
    value
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| WireError::MissingField { field: "id".into() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn decode(frame: &str) -> ServerMessage {
        Codec::new().decode(frame).unwrap()
    }

    // ── Decoding ────────────────────────────────────────────────────────

    #[test]
    fn decodes_handshake_frames() {
        assert_matches!(
            decode(r#"{"type":"auth_required","ha_version":"2024.1.0"}"#),
            ServerMessage::AuthRequired { ha_version } if ha_version == "2024.1.0"
        );
        assert_matches!(
            decode(r#"{"type":"auth_ok","ha_version":"2024.1.0"}"#),
            ServerMessage::AuthOk { .. }
        );
        assert_matches!(
            decode(r#"{"type":"auth_invalid","message":"Invalid password"}"#),
            ServerMessage::AuthInvalid { message } if message == "Invalid password"
        );
    }

    #[test]
    fn decodes_result_frame() {
        let message = decode(r#"{"id":3,"type":"result","success":true,"result":{"ok":1}}"#);
        assert_matches!(message, ServerMessage::Result(result) => {
            assert_eq!(result.id, 3);
            assert!(result.success);
            assert_eq!(result.result, Some(json!({"ok": 1})));
            assert_eq!(result.error, None);
        });
    }

    #[test]
    fn decodes_event_and_pong_frames() {
        let message = decode(r#"{"id":11,"type":"event","event":{"event_type":"x"}}"#);
        assert_matches!(message, ServerMessage::Event(event) => {
            assert_eq!(event.id, 11);
        });

        assert_matches!(
            decode(r#"{"id":4,"type":"pong"}"#),
            ServerMessage::Pong { id: 4 }
        );
    }

    #[test]
    fn unknown_type_becomes_raw_envelope() {
        let message = decode(r#"{"id":9,"type":"zone/list","extra":true}"#);
        assert_matches!(message, ServerMessage::Raw(raw) => {
            assert_eq!(raw.msg_type, "zone/list");
            assert_eq!(raw.id, Some(9));
            assert_eq!(raw.payload["extra"], json!(true));
        });
    }

    #[test]
    fn rejects_frames_without_type() {
        assert_matches!(
            Codec::new().decode(r#"{"id":1}"#),
            Err(WireError::MissingType)
        );
        assert_matches!(Codec::new().decode("not json"), Err(WireError::Json(_)));
    }

    #[test]
    fn rejects_handshake_frames_missing_fields() {
        assert_matches!(
            Codec::new().decode(r#"{"type":"auth_required"}"#),
            Err(WireError::MissingField { field }) if field == "ha_version"
        );
        assert_matches!(
            Codec::new().decode(r#"{"type":"pong"}"#),
            Err(WireError::MissingField { field }) if field == "id"
        );
    }

    // ── Encoding ────────────────────────────────────────────────────────

    fn encoded(command: &CommandMessage, id: u64) -> Value {
        let text = Codec::new().encode_command(command, id).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn encodes_auth_message() {
        let text = Codec::new().encode_auth("abc123");
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "auth", "access_token": "abc123"}));
    }

    #[test]
    fn encodes_subscribe_with_and_without_topic() {
        let named = CommandMessage::SubscribeEvents {
            event_type: Some("state_changed".into()),
        };
        assert_eq!(
            encoded(&named, 1),
            json!({"id": 1, "type": "subscribe_events", "event_type": "state_changed"})
        );

        let wildcard = CommandMessage::SubscribeEvents { event_type: None };
        assert_eq!(
            encoded(&wildcard, 2),
            json!({"id": 2, "type": "subscribe_events"})
        );
    }

    #[test]
    fn encodes_unsubscribe_and_ping() {
        let unsubscribe = CommandMessage::UnsubscribeEvents { subscription: 18 };
        assert_eq!(
            encoded(&unsubscribe, 19),
            json!({"id": 19, "type": "unsubscribe_events", "subscription": 18})
        );
        assert_eq!(
            encoded(&CommandMessage::Ping, 20),
            json!({"id": 20, "type": "ping"})
        );
    }

    #[test]
    fn raw_command_merges_payload_under_envelope_fields() {
        let raw = CommandMessage::raw(
            "call_service",
            json!({"domain": "light", "service": "turn_on", "id": 999, "type": "spoofed"}),
        );
        let frame = encoded(&raw, 5);
        assert_eq!(frame["id"], json!(5));
        assert_eq!(frame["type"], json!("call_service"));
        assert_eq!(frame["domain"], json!("light"));
        assert_eq!(frame["service"], json!("turn_on"));
    }

    #[test]
    fn raw_command_accepts_null_payload_and_rejects_scalars() {
        let empty = CommandMessage::raw("get_config", Value::Null);
        assert_eq!(encoded(&empty, 6), json!({"id": 6, "type": "get_config"}));

        let bad = CommandMessage::raw("get_config", json!(42));
        assert_matches!(
            Codec::new().encode_command(&bad, 7),
            Err(WireError::InvalidPayload { .. })
        );
    }
}
