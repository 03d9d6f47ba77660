//! Connection lifecycle event handlers.
//!
//! Provides callback-based hooks for monitoring connection events:
//!
//! - [`on_connect`](EventHandlers::on_connect): Fired when the transport opens
//! - [`on_disconnect`](EventHandlers::on_disconnect): Fired when the transport closes
//! - [`on_error`](EventHandlers::on_error): Fired on connection or protocol errors
//! - [`on_session`](EventHandlers::on_session): Fired when the server announces a session id
//! - [`on_receive`](EventHandlers::on_receive): Optional debug hook for all inbound frames
//! - [`on_send`](EventHandlers::on_send): Optional debug hook for all outbound frames
//!
//! # Example
//!
//! ```rust
//! use tsdb_link::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_connect(|| {
//!         println!("Connected!");
//!     })
//!     .on_disconnect(|reason| {
//!         println!("Disconnected: {}", reason);
//!     })
//!     .on_error(|error| {
//!         eprintln!("Connection error: {}", error);
//!     });
//! ```

use std::fmt;
use std::sync::Arc;

/// Reason for a disconnect event.
#[derive(Debug, Clone)]
pub struct DisconnectReason {
    /// Human-readable description of why the connection closed.
    pub message: String,
    /// WebSocket close code, if available (e.g. 1000 = normal, 1006 = abnormal).
    pub code: Option<u16>,
}

impl DisconnectReason {
    /// Create a new disconnect reason with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Create a new disconnect reason with a message and close code.
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code: {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Error information passed to the `on_error` handler.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    /// Human-readable error message.
    pub message: String,
    /// Whether this error is recoverable (i.e. auto-reconnect may succeed).
    pub recoverable: bool,
}

impl ConnectionError {
    /// Create a new connection error.
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Type alias for the on_connect callback.
pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Type alias for the on_disconnect callback.
pub type OnDisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Type alias for the on_error callback.
pub type OnErrorCallback = Arc<dyn Fn(ConnectionError) + Send + Sync>;

/// Type alias for the on_session callback.
pub type OnSessionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Type alias for the on_receive callback (debug hook for all inbound frames).
pub type OnReceiveCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Type alias for the on_send callback (debug hook for all outbound frames).
pub type OnSendCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection lifecycle event handlers.
///
/// All handlers are optional. The builder pattern makes it easy to register
/// only the handlers you need. Handlers are `Send + Sync` so they work with
/// the async tokio runtime.
#[derive(Clone, Default)]
pub struct EventHandlers {
    /// Called when the transport opens (including after a reconnect).
    pub(crate) on_connect: Option<OnConnectCallback>,

    /// Called when the transport closes (intentionally or not).
    pub(crate) on_disconnect: Option<OnDisconnectCallback>,

    /// Called when a connection or protocol error occurs.
    pub(crate) on_error: Option<OnErrorCallback>,

    /// Called when the server announces its session id.
    pub(crate) on_session: Option<OnSessionCallback>,

    /// Called for every raw frame received from the server (debug/tracing).
    pub(crate) on_receive: Option<OnReceiveCallback>,

    /// Called for every raw frame sent to the server (debug/tracing).
    pub(crate) on_send: Option<OnSendCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_session", &self.on_session.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_send", &self.on_send.is_some())
            .finish()
    }
}

impl EventHandlers {
    /// Create a new empty `EventHandlers` (no callbacks registered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked when the transport opens.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the transport closes.
    ///
    /// The callback receives a [`DisconnectReason`] with details about why
    /// the connection was closed.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when a connection error occurs.
    ///
    /// The callback receives a [`ConnectionError`] indicating whether the
    /// error is recoverable (auto-reconnect may help) or fatal.
    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the server announces a session id.
    pub fn on_session(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_session = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked for every raw frame received from the
    /// server. Debug/tracing hook; not needed for normal operation.
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked for every raw frame sent to the server.
    /// Debug/tracing hook; not needed for normal operation.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    /// Returns `true` if any handler is registered.
    pub fn has_any(&self) -> bool {
        self.on_connect.is_some()
            || self.on_disconnect.is_some()
            || self.on_error.is_some()
            || self.on_session.is_some()
            || self.on_receive.is_some()
            || self.on_send.is_some()
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    pub(crate) fn emit_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    pub(crate) fn emit_session(&self, session: &str) {
        if let Some(cb) = &self.on_session {
            cb(session);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(cb) = &self.on_receive {
            cb(raw);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(cb) = &self.on_send {
            cb(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_handlers_emit_nothing() {
        let handlers = EventHandlers::new();
        assert!(!handlers.has_any());
        // no panics on empty dispatch
        handlers.emit_connect();
        handlers.emit_disconnect(DisconnectReason::new("bye"));
        handlers.emit_error(ConnectionError::new("oops", true));
        handlers.emit_session("s1");
    }

    #[test]
    fn test_registered_handlers_fire() {
        let connects = Arc::new(AtomicUsize::new(0));
        let sessions = Arc::new(AtomicUsize::new(0));
        let c = connects.clone();
        let s = sessions.clone();
        let handlers = EventHandlers::new()
            .on_connect(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_session(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            });
        assert!(handlers.has_any());

        handlers.emit_connect();
        handlers.emit_connect();
        handlers.emit_session("abc");
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(sessions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::new("bye").to_string(), "bye");
        assert_eq!(
            DisconnectReason::with_code("gone", 1006).to_string(),
            "gone (code: 1006)"
        );
    }
}
