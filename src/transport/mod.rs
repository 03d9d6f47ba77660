//! Message channel abstraction under the dispatcher.
//!
//! Two tagged variants satisfy the same capability set: a direct WebSocket
//! transport ([`websocket`]) and an in-process message-port transport
//! ([`port`]) framing the same envelopes over channel primitives. The
//! dispatcher composes whichever it is given; nothing else in the crate
//! depends on the variant.

pub mod port;
pub mod websocket;

pub use port::{PortPeer, PortTransport};
pub use websocket::WsTransport;

use crate::error::Result;

/// Maximum accepted text frame size (64 MiB). Oversized frames are logged
/// and dropped.
pub(crate) const MAX_TEXT_FRAME_BYTES: usize = 64 << 20;

/// Connection lifecycle state of a transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events reported by a transport, in arrival order.
///
/// `Frame` fires exactly once per inbound frame and never after `Closed` or
/// `Failed`; `Closed`/`Failed` fire at most once per instance.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The channel transitioned to `Open` (port variant; the WebSocket
    /// variant is already open when construction succeeds).
    Opened,
    /// One inbound text frame.
    Frame(String),
    /// The channel closed, with a human-readable reason.
    Closed(String),
    /// The channel failed, with the underlying error text.
    Failed(String),
}

/// A bidirectional message channel delivering opaque text frames.
#[derive(Debug)]
pub enum Transport {
    WebSocket(WsTransport),
    Port(PortTransport),
}

impl Transport {
    /// Send one text frame. Errors report underlying channel failure; the
    /// dispatcher never calls this unless [`ready_state`](Self::ready_state)
    /// is `Open` (deferral of early sends is the dispatcher's job).
    pub async fn send(&mut self, text: &str) -> Result<()> {
        match self {
            Transport::WebSocket(ws) => ws.send(text).await,
            Transport::Port(port) => port.send(text),
        }
    }

    /// Wait for the next transport event. Returns `None` once the instance
    /// has terminated and reported it.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        match self {
            Transport::WebSocket(ws) => ws.next_event().await,
            Transport::Port(port) => port.next_event().await,
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        match self {
            Transport::WebSocket(ws) => ws.ready_state(),
            Transport::Port(port) => port.ready_state(),
        }
    }

    /// Close gracefully. Safe to call on an already-closed instance.
    pub async fn close(&mut self) {
        match self {
            Transport::WebSocket(ws) => ws.close().await,
            Transport::Port(port) => port.close(),
        }
    }
}

impl From<WsTransport> for Transport {
    fn from(ws: WsTransport) -> Self {
        Transport::WebSocket(ws)
    }
}

impl From<PortTransport> for Transport {
    fn from(port: PortTransport) -> Self {
        Transport::Port(port)
    }
}
