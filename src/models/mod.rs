//! Wire envelope definitions for the TSDB remoting protocol.
//!
//! JSON over WebSocket text frames (or the equivalent over a message-port
//! transport). Outbound frames are [`ClientMessage`], inbound frames are
//! [`ServerMessage`] plus the out-of-band session announcement.

mod client_message;
mod server_message;

pub use client_message::ClientMessage;
pub use server_message::{parse_frame, Inbound, ResponseBody, ServerMessage, SubAckBody};

/// Status string carried in the `op` field of a successful response.
pub const STATUS_OK: &str = "ok";
