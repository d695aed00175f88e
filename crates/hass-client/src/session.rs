//! Socket establishment and the authentication handshake.

use futures::{SinkExt, StreamExt};
use hass_wire::{Codec, ServerMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::config::ConnectionParameters;
use crate::errors::ClientError;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the WebSocket to the configured endpoint.
pub(crate) async fn open_socket(params: &ConnectionParameters) -> Result<WsStream, ClientError> {
    let (stream, _response) = connect_async(params.endpoint.as_str()).await?;
    Ok(stream)
}

/// Drive the pre-session handshake to completion.
///
/// The server speaks first with `auth_required`; we answer with the access
/// token and wait for the verdict. Returns the server version announced in
/// `auth_ok`.
pub(crate) async fn authenticate(
    stream: &mut WsStream,
    access_token: &str,
    codec: Codec,
) -> Result<String, ClientError> {
    match read_handshake_message(stream, codec).await? {
        ServerMessage::AuthRequired { ha_version } => {
            debug!(%ha_version, "authentication requested");
        }
        other => return Err(unexpected(&other)),
    }

    stream
        .send(Message::text(codec.encode_auth(access_token)))
        .await?;

    match read_handshake_message(stream, codec).await? {
        ServerMessage::AuthOk { ha_version } => {
            debug!(%ha_version, "authentication accepted");
            Ok(ha_version)
        }
        ServerMessage::AuthInvalid { message } => Err(ClientError::Authentication { message }),
        other => Err(unexpected(&other)),
    }
}

/// Next text frame during the handshake, decoded.
///
/// A socket that closes mid-handshake surfaces as a transport error so the
/// retry policy treats it like any other connection failure. A frame that
/// does not decode is an authentication failure: this server is not
/// speaking the protocol we expect.
async fn read_handshake_message(
    stream: &mut WsStream,
    codec: Codec,
) -> Result<ServerMessage, ClientError> {
    loop {
        let Some(frame) = stream.next().await else {
            return Err(ClientError::Transport {
                source: WsError::ConnectionClosed,
            });
        };
        match frame? {
            Message::Text(text) => {
                return codec
                    .decode(text.as_str())
                    .map_err(|err| ClientError::Authentication {
                        message: format!("malformed handshake message: {err}"),
                    });
            }
            Message::Close(_) => {
                return Err(ClientError::Transport {
                    source: WsError::ConnectionClosed,
                });
            }
            // Control frames may precede the handshake text.
            _ => {}
        }
    }
}

fn unexpected(message: &ServerMessage) -> ClientError {
    ClientError::Authentication {
        message: format!(
            "unexpected `{}` message during authentication",
            message.message_type()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn unexpected_names_the_message_type() {
        let err = unexpected(&ServerMessage::Pong { id: 1 });
        assert_matches!(
            err,
            ClientError::Authentication { message } if message.contains("`pong`")
        );
    }
}
