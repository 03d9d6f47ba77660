//! Error types for tsdb-link.

use thiserror::Error;

/// Errors surfaced by the client, the correlation table, and the transports.
#[derive(Error, Debug, Clone)]
pub enum TsdbLinkError {
    /// Underlying socket or port failure. Broadcast to every in-flight
    /// request when the transport dies.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The transport closed while requests were still pending, or before a
    /// deferred call could be sent.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A specific pending request's timer fired before a matching reply
    /// arrived. Scoped to that request's caller only.
    #[error("Request {rid} timed out after {elapsed_ms}ms")]
    Timeout { rid: u64, elapsed_ms: u64 },

    /// Caller-initiated abort of a pending request.
    #[error("Request {0} cancelled")]
    Cancelled(u64),

    /// Malformed or unparseable inbound frame. Logged and dropped by the
    /// dispatcher; propagates only when parsing is invoked directly.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A request id was registered twice. Indicates a bug in id generation;
    /// never swallowed.
    #[error("Duplicate request id {0}")]
    DuplicateRequestId(u64),

    /// The server answered with a non-ok status.
    #[error("Server error ({status}): {message}")]
    ServerError { status: String, message: String },

    /// Invalid client configuration (URL, options).
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Failed to serialize an outbound envelope.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for tsdb-link operations.
pub type Result<T> = std::result::Result<T, TsdbLinkError>;
