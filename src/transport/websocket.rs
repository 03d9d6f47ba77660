//! WebSocket transport over tokio-tungstenite.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{ReadyState, TransportEvent, MAX_TEXT_FRAME_BYTES};
use crate::error::{Result, TsdbLinkError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live WebSocket connection. Construction performs the handshake, so an
/// instance is `Open` from birth and never emits [`TransportEvent::Opened`].
pub struct WsTransport {
    stream: WsStream,
    state: ReadyState,
    /// Set once a terminal event has been reported; later polls yield `None`.
    terminated: bool,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("state", &self.state)
            .finish()
    }
}

impl WsTransport {
    /// Connect and complete the WebSocket handshake within `timeout`
    /// (a zero timeout means wait indefinitely).
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let endpoint = resolve_ws_url(url)?;
        log::debug!("connecting to {}", endpoint);

        let handshake = connect_async(endpoint.as_str());
        let (stream, response) = if timeout.is_zero() {
            handshake.await
        } else {
            tokio::time::timeout(timeout, handshake)
                .await
                .map_err(|_| {
                    TsdbLinkError::TransportError(format!(
                        "connection to {} timed out after {:?}",
                        endpoint, timeout
                    ))
                })?
        }
        .map_err(|e| TsdbLinkError::TransportError(format!("connect failed: {}", e)))?;

        log::debug!(
            "connected to {} (http status {})",
            endpoint,
            response.status()
        );
        Ok(Self {
            stream,
            state: ReadyState::Open,
            terminated: false,
        })
    }

    pub(crate) async fn send(&mut self, text: &str) -> Result<()> {
        if self.state != ReadyState::Open {
            return Err(TsdbLinkError::TransportError(
                "websocket is not open".to_string(),
            ));
        }
        self.stream
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| {
                self.state = ReadyState::Closed;
                TsdbLinkError::TransportError(format!("send failed: {}", e))
            })
    }

    pub(crate) async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.terminated {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_TEXT_FRAME_BYTES {
                        log::warn!("dropping oversized frame ({} bytes)", text.len());
                        continue;
                    }
                    return Some(TransportEvent::Frame(text.to_string()));
                },
                Some(Ok(Message::Binary(data))) => {
                    log::warn!("dropping unexpected binary frame ({} bytes)", data.len());
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = self.stream.send(Message::Pong(payload)).await {
                        log::debug!("pong failed: {}", e);
                    }
                },
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {},
                Some(Ok(Message::Close(frame))) => {
                    self.state = ReadyState::Closed;
                    self.terminated = true;
                    let reason = frame
                        .map(|f| format!("close frame: {} {}", f.code, f.reason))
                        .unwrap_or_else(|| "close frame".to_string());
                    return Some(TransportEvent::Closed(reason));
                },
                Some(Err(e)) => {
                    self.state = ReadyState::Closed;
                    self.terminated = true;
                    return Some(TransportEvent::Failed(e.to_string()));
                },
                None => {
                    self.state = ReadyState::Closed;
                    self.terminated = true;
                    return Some(TransportEvent::Closed("stream ended".to_string()));
                },
            }
        }
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        self.state
    }

    pub(crate) async fn close(&mut self) {
        if matches!(self.state, ReadyState::Closed) {
            return;
        }
        self.state = ReadyState::Closing;
        if let Err(e) = self.stream.close(None).await {
            log::debug!("close handshake failed: {}", e);
        }
        self.state = ReadyState::Closed;
        self.terminated = true;
    }
}

/// Normalize an endpoint to a ws/wss URL. `http(s)` schemes are rewritten;
/// anything else is rejected up front rather than at handshake time.
pub(crate) fn resolve_ws_url(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url)
        .map_err(|e| TsdbLinkError::ConfigurationError(format!("invalid url '{}': {}", url, e)))?;
    match parsed.scheme() {
        "ws" | "wss" => {},
        "http" => {
            parsed
                .set_scheme("ws")
                .map_err(|_| TsdbLinkError::ConfigurationError("cannot rewrite scheme".into()))?;
        },
        "https" => {
            parsed
                .set_scheme("wss")
                .map_err(|_| TsdbLinkError::ConfigurationError("cannot rewrite scheme".into()))?;
        },
        other => {
            return Err(TsdbLinkError::ConfigurationError(format!(
                "unsupported scheme '{}' in '{}'",
                other, url
            )))
        },
    }
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_accepts_ws_schemes() {
        assert_eq!(
            resolve_ws_url("ws://localhost:4242/ws").unwrap(),
            "ws://localhost:4242/ws"
        );
        assert_eq!(
            resolve_ws_url("wss://tsdb.example.com/ws").unwrap(),
            "wss://tsdb.example.com/ws"
        );
    }

    #[test]
    fn test_resolve_rewrites_http_schemes() {
        assert_eq!(
            resolve_ws_url("http://localhost:4242/ws").unwrap(),
            "ws://localhost:4242/ws"
        );
        assert_eq!(
            resolve_ws_url("https://tsdb.example.com/ws").unwrap(),
            "wss://tsdb.example.com/ws"
        );
    }

    #[test]
    fn test_resolve_rejects_other_schemes() {
        assert!(matches!(
            resolve_ws_url("ftp://host/ws"),
            Err(TsdbLinkError::ConfigurationError(_))
        ));
        assert!(matches!(
            resolve_ws_url("not a url"),
            Err(TsdbLinkError::ConfigurationError(_))
        ));
    }
}
