//! In-process message-port transport.
//!
//! Frames the same text envelopes over a pair of unbounded channels. The
//! peer half drives the far end, which makes this the transport of choice
//! for embedding the client behind another component and for exercising the
//! dispatcher in tests without a network.

use tokio::sync::mpsc;

use super::{ReadyState, TransportEvent};
use crate::error::{Result, TsdbLinkError};

/// Control signals the peer can inject, delivered in order with frames.
#[derive(Debug, Clone)]
enum PortSignal {
    Opened,
    Frame(String),
    Closed(String),
}

/// The client-side half of a message port.
#[derive(Debug)]
pub struct PortTransport {
    out_tx: mpsc::UnboundedSender<String>,
    in_rx: mpsc::UnboundedReceiver<PortSignal>,
    state: ReadyState,
    terminated: bool,
}

/// The far end of a message port, held by whoever plays the server.
#[derive(Debug)]
pub struct PortPeer {
    in_tx: mpsc::UnboundedSender<PortSignal>,
    out_rx: mpsc::UnboundedReceiver<String>,
}

fn channel_pair(initial: ReadyState) -> (PortTransport, PortPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        PortTransport {
            out_tx,
            in_rx,
            state: initial,
            terminated: false,
        },
        PortPeer { in_tx, out_rx },
    )
}

impl PortTransport {
    /// Create a port that is open immediately.
    pub fn pair() -> (Self, PortPeer) {
        channel_pair(ReadyState::Open)
    }

    /// Create a port that starts `Connecting`; the peer must call
    /// [`PortPeer::open`] before frames flow. Sends issued in the meantime
    /// are the dispatcher's to defer.
    pub fn pair_connecting() -> (Self, PortPeer) {
        channel_pair(ReadyState::Connecting)
    }

    pub(crate) fn send(&mut self, text: &str) -> Result<()> {
        if self.state != ReadyState::Open {
            return Err(TsdbLinkError::TransportError(
                "port is not open".to_string(),
            ));
        }
        self.out_tx.send(text.to_string()).map_err(|_| {
            self.state = ReadyState::Closed;
            TsdbLinkError::TransportError("port peer is gone".to_string())
        })
    }

    pub(crate) async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.terminated {
            return None;
        }
        match self.in_rx.recv().await {
            Some(PortSignal::Opened) => {
                self.state = ReadyState::Open;
                Some(TransportEvent::Opened)
            },
            Some(PortSignal::Frame(text)) => Some(TransportEvent::Frame(text)),
            Some(PortSignal::Closed(reason)) => {
                self.state = ReadyState::Closed;
                self.terminated = true;
                Some(TransportEvent::Closed(reason))
            },
            None => {
                self.state = ReadyState::Closed;
                self.terminated = true;
                Some(TransportEvent::Closed("port disconnected".to_string()))
            },
        }
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        self.state
    }

    pub(crate) fn close(&mut self) {
        self.state = ReadyState::Closed;
        self.terminated = true;
        self.in_rx.close();
    }
}

impl PortPeer {
    /// Transition the client half to `Open`.
    pub fn open(&self) {
        let _ = self.in_tx.send(PortSignal::Opened);
    }

    /// Deliver one inbound frame to the client half.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.in_tx.send(PortSignal::Frame(text.into()));
    }

    /// Close the client half with a reason. Signals queued before this are
    /// still delivered first.
    pub fn close(&self, reason: &str) {
        let _ = self.in_tx.send(PortSignal::Closed(reason.to_string()));
    }

    /// Receive the next frame sent by the client half. `None` once the
    /// client half is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.out_rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<String> {
        self.out_rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways_in_order() {
        let (mut transport, mut peer) = PortTransport::pair();
        transport.send("a").unwrap();
        transport.send("b").unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("a"));
        assert_eq!(peer.recv().await.as_deref(), Some("b"));

        peer.send("x");
        peer.send("y");
        assert!(matches!(transport.next_event().await, Some(TransportEvent::Frame(f)) if f == "x"));
        assert!(matches!(transport.next_event().await, Some(TransportEvent::Frame(f)) if f == "y"));
    }

    #[tokio::test]
    async fn test_connecting_port_rejects_sends_until_opened() {
        let (mut transport, peer) = PortTransport::pair_connecting();
        assert_eq!(transport.ready_state(), ReadyState::Connecting);
        assert!(transport.send("early").is_err());

        peer.open();
        assert!(matches!(
            transport.next_event().await,
            Some(TransportEvent::Opened)
        ));
        assert_eq!(transport.ready_state(), ReadyState::Open);
        assert!(transport.send("now").is_ok());
    }

    #[tokio::test]
    async fn test_close_reports_once_then_none() {
        let (mut transport, peer) = PortTransport::pair();
        peer.send("last");
        peer.close("done");

        assert!(matches!(
            transport.next_event().await,
            Some(TransportEvent::Frame(_))
        ));
        assert!(matches!(
            transport.next_event().await,
            Some(TransportEvent::Closed(reason)) if reason == "done"
        ));
        assert!(transport.next_event().await.is_none());
        assert_eq!(transport.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_peer_reads_as_close() {
        let (mut transport, peer) = PortTransport::pair();
        drop(peer);
        assert!(matches!(
            transport.next_event().await,
            Some(TransportEvent::Closed(_))
        ));
        assert!(transport.send("late").is_err());
    }
}
