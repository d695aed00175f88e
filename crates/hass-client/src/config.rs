//! Connection parameters and client tuning knobs.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ClientError;

/// Where to connect and how to authenticate.
///
/// The `Debug` impl redacts the access token so parameters can be logged
/// without leaking credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// WebSocket endpoint, e.g. `ws://localhost:8123/api/websocket`.
    pub endpoint: String,
    /// Long-lived access token presented during authentication.
    pub access_token: String,
}

impl ConnectionParameters {
    /// Build parameters from an explicit WebSocket endpoint.
    pub fn new(endpoint: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_token: access_token.into(),
        }
    }

    /// Derive the WebSocket endpoint from an instance base URL.
    ///
    /// `http`/`https` schemes are mapped to `ws`/`wss` and the API path is
    /// appended, so `https://host:8123` becomes
    /// `wss://host:8123/api/websocket`.
    pub fn from_base_url(
        base_url: &str,
        access_token: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let (scheme, rest) = if let Some(rest) = base_url.strip_prefix("https://") {
            ("wss", rest)
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            ("ws", rest)
        } else if let Some(rest) = base_url.strip_prefix("wss://") {
            ("wss", rest)
        } else if let Some(rest) = base_url.strip_prefix("ws://") {
            ("ws", rest)
        } else {
            return Err(ClientError::InvalidArgument {
                message: format!("unsupported scheme in base URL `{base_url}`"),
            });
        };
        let host = rest.trim_end_matches('/');
        if host.is_empty() {
            return Err(ClientError::InvalidArgument {
                message: format!("no host in base URL `{base_url}`"),
            });
        }
        Ok(Self::new(
            format!("{scheme}://{host}/api/websocket"),
            access_token,
        ))
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("endpoint", &self.endpoint)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Tunable client behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Reconnect automatically after an unexpected connection loss
    /// (default `true`).
    pub automatic_reconnection: bool,
    /// Delay between reconnection attempts (default 5 seconds).
    pub retry_interval: Duration,
    /// Capacity of the connection-state broadcast channel (default `32`).
    pub state_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            automatic_reconnection: true,
            retry_interval: Duration::from_secs(5),
            state_channel_capacity: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_automatic_reconnection() {
        let cfg = ClientConfig::default();
        assert!(cfg.automatic_reconnection);
    }

    #[test]
    fn default_retry_interval() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.retry_interval, Duration::from_secs(5));
    }

    #[test]
    fn default_state_channel_capacity() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.state_channel_capacity, 32);
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ClientConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.automatic_reconnection, cfg.automatic_reconnection);
        assert_eq!(back.retry_interval, cfg.retry_interval);
        assert_eq!(back.state_channel_capacity, cfg.state_channel_capacity);
    }

    #[test]
    fn from_https_base_url() {
        let params = ConnectionParameters::from_base_url("https://ha.local:8123", "tok").unwrap();
        assert_eq!(params.endpoint, "wss://ha.local:8123/api/websocket");
    }

    #[test]
    fn from_http_base_url_with_trailing_slash() {
        let params = ConnectionParameters::from_base_url("http://ha.local/", "tok").unwrap();
        assert_eq!(params.endpoint, "ws://ha.local/api/websocket");
    }

    #[test]
    fn from_ws_base_url_keeps_scheme() {
        let params = ConnectionParameters::from_base_url("ws://ha.local", "tok").unwrap();
        assert_eq!(params.endpoint, "ws://ha.local/api/websocket");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert_matches!(
            ConnectionParameters::from_base_url("ftp://ha.local", "tok"),
            Err(ClientError::InvalidArgument { .. })
        );
    }

    #[test]
    fn rejects_empty_host() {
        assert_matches!(
            ConnectionParameters::from_base_url("https://", "tok"),
            Err(ClientError::InvalidArgument { .. })
        );
    }

    #[test]
    fn debug_redacts_access_token() {
        let params = ConnectionParameters::new("ws://ha.local/api/websocket", "super-secret");
        let debug = format!("{params:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("super-secret"));
    }
}
