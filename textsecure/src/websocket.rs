//! Websocket client for pushed messages.
//!
//! Connects to `wss://<server>/v1/websocket?login=<tel>&password=<pass>`
//! through the same pinned TLS config as the HTTP transport. Frames carry
//! a MessagePack [`WsMessage`]; every handled REQUEST is answered with a
//! `RESPONSE { id, 200, "OK" }`, and a dedicated task sends a keepalive
//! request every fifteen seconds.

use std::sync::Arc;

use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;

use crate::error::{Error, Result};
use crate::transport::{map_tls_error, parse_https_url, url_encode};

/// Keepalive cadence.
pub const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// Frame type constants.
pub mod ws_type {
    /// Server-to-client (or keepalive) request
    pub const REQUEST: u32 = 1;
    /// Acknowledgement of a request
    pub const RESPONSE: u32 = 2;
}

/// A websocket request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    /// HTTP-style verb
    pub verb: String,
    /// HTTP-style path
    pub path: String,
    /// Payload; envelope bytes on message pushes
    pub body: Option<Vec<u8>>,
    /// Monotonic request id; echoed back in the acknowledgement
    pub id: Option<u64>,
}

/// A websocket response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    /// Id of the request being answered
    pub id: u64,
    /// Status code, 200 for handled
    pub status: u32,
    /// Status message
    pub message: String,
}

/// The frame envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct WsMessage {
    /// One of [`ws_type`]
    pub message_type: u32,
    /// Present on REQUEST frames
    pub request: Option<WsRequest>,
    /// Present on RESPONSE frames
    pub response: Option<WsResponse>,
}

/// An open websocket connection with its write and keepalive tasks.
pub struct WsConn {
    write_tx: mpsc::Sender<Message>,
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    write_task: JoinHandle<()>,
    keepalive_task: JoinHandle<()>,
}

impl WsConn {
    /// Dial the service websocket with the pinned TLS config.
    pub async fn connect(
        server: &str,
        tel: &str,
        password: &str,
        tls: Arc<rustls::ClientConfig>,
    ) -> Result<Self> {
        let endpoint = parse_https_url(server)?;
        let url = format!(
            "wss://{}:{}/v1/websocket?login={}&password={}",
            endpoint.host,
            endpoint.port,
            url_encode(tel),
            url_encode(password),
        );

        let (stream, _response) =
            connect_async_tls_with_config(url.as_str(), None, false, Some(Connector::Rustls(tls)))
                .await
                .map_err(|e| match e {
                    tokio_tungstenite::tungstenite::Error::Io(io) => map_tls_error(io),
                    other => Error::Network(other.to_string()),
                })?;
        debug!("websocket connected");

        let (mut write, read) = stream.split();
        let (write_tx, mut write_rx) = mpsc::channel::<Message>(32);

        let write_task = tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if let Err(e) = write.send(frame).await {
                    warn!("websocket send failed: {e}");
                    break;
                }
            }
        });

        let keepalive_tx = write_tx.clone();
        let keepalive_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                let frame = match encode_request("GET", "/v1/keepalive", None, None) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("keepalive encode failed: {e}");
                        continue;
                    }
                };
                if keepalive_tx.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        });

        Ok(WsConn {
            write_tx,
            read,
            write_task,
            keepalive_task,
        })
    }

    /// Wait for the next REQUEST frame. Other frame types are skipped;
    /// a closed or failed stream yields [`Error::Closed`].
    pub async fn next_request(&mut self) -> Result<WsRequest> {
        loop {
            let frame = match self.read.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(Error::Network(e.to_string())),
                None => return Err(Error::Closed),
            };
            match frame {
                Message::Binary(data) => {
                    let parsed: WsMessage = match rmp_serde::from_slice(&data) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!("undecodable websocket frame: {e}");
                            continue;
                        }
                    };
                    if parsed.message_type == ws_type::REQUEST {
                        if let Some(request) = parsed.request {
                            return Ok(request);
                        }
                    }
                    // RESPONSE frames (keepalive acks) need no handling.
                }
                Message::Close(_) => return Err(Error::Closed),
                _ => {}
            }
        }
    }

    /// Acknowledge a handled request by id.
    pub async fn send_ack(&self, id: u64) -> Result<()> {
        let message = WsMessage {
            message_type: ws_type::RESPONSE,
            request: None,
            response: Some(WsResponse {
                id,
                status: 200,
                message: "OK".into(),
            }),
        };
        let frame = rmp_serde::to_vec(&message)?;
        self.write_tx
            .send(Message::Binary(frame))
            .await
            .map_err(|_| Error::Closed)
    }
}

impl Drop for WsConn {
    fn drop(&mut self) {
        self.keepalive_task.abort();
        self.write_task.abort();
    }
}

fn encode_request(
    verb: &str,
    path: &str,
    body: Option<Vec<u8>>,
    id: Option<u64>,
) -> Result<Vec<u8>> {
    let message = WsMessage {
        message_type: ws_type::REQUEST,
        request: Some(WsRequest {
            verb: verb.into(),
            path: path.into(),
            body,
            id,
        }),
        response: None,
    };
    rmp_serde::to_vec(&message).map_err(Into::into)
}

/// Some deployments base64-wrap the envelope inside the websocket body.
/// Accept both framings: a body that decodes as base64 to a plausible
/// envelope is decoded, anything else is taken as raw bytes.
pub fn unwrap_body(body: &[u8]) -> Vec<u8> {
    if let Ok(text) = std::str::from_utf8(body) {
        let trimmed = text.trim_end_matches('=');
        if let Ok(decoded) = STANDARD_NO_PAD.decode(trimmed) {
            // smaller than the minimum envelope cannot be a wrapped frame
            if decoded.len() >= 43 {
                return decoded;
            }
        }
    }
    body.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn frames_roundtrip() {
        let frame = encode_request("PUT", "/v1/messages", Some(vec![1, 2, 3]), Some(9)).unwrap();
        let parsed: WsMessage = rmp_serde::from_slice(&frame).unwrap();
        assert_eq!(parsed.message_type, ws_type::REQUEST);
        let request = parsed.request.unwrap();
        assert_eq!(request.verb, "PUT");
        assert_eq!(request.path, "/v1/messages");
        assert_eq!(request.body, Some(vec![1, 2, 3]));
        assert_eq!(request.id, Some(9));
    }

    #[test]
    fn keepalive_has_no_id() {
        let frame = encode_request("GET", "/v1/keepalive", None, None).unwrap();
        let parsed: WsMessage = rmp_serde::from_slice(&frame).unwrap();
        let request = parsed.request.unwrap();
        assert_eq!(request.path, "/v1/keepalive");
        assert_eq!(request.id, None);
        assert_eq!(request.body, None);
    }

    #[test]
    fn base64_bodies_are_unwrapped() {
        let envelope = vec![7u8; 64];
        let wrapped = STANDARD.encode(&envelope).into_bytes();
        assert_eq!(unwrap_body(&wrapped), envelope);

        let wrapped_nopad = STANDARD_NO_PAD.encode(&envelope).into_bytes();
        assert_eq!(unwrap_body(&wrapped_nopad), envelope);
    }

    #[test]
    fn raw_bodies_pass_through() {
        // Not valid UTF-8, so certainly not base64.
        let raw = vec![0xFFu8; 64];
        assert_eq!(unwrap_body(&raw), raw);

        // Valid base64 but too short to be an envelope.
        let tiny = STANDARD.encode([1u8, 2]).into_bytes();
        assert_eq!(unwrap_body(&tiny), tiny);
    }
}
