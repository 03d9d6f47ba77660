use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::context::ContextUpdate;
use crate::error::{Result, TsdbLinkError};

/// Server-to-client frames, tagged by the `t` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum ServerMessage {
    /// Reply to a correlated request. `op` is the status string (`"ok"` on
    /// success, an error code otherwise).
    #[serde(rename = "resp")]
    Resp {
        /// The `rid` of the request this frame answers.
        rerid: u64,
        op: String,
        #[serde(default)]
        msg: ResponseBody,
    },

    /// Acknowledgement of a subscription request; binds the server-side
    /// subscription id to the subscribe call's `rid`.
    #[serde(rename = "suback")]
    SubAck { rerid: u64, msg: SubAckBody },

    /// Server-push event for an active subscription.
    #[serde(rename = "subev")]
    SubEvent {
        subid: u64,
        #[serde(default)]
        msg: JsonValue,
    },
}

/// Body of a correlated reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseBody {
    /// Result items for this page.
    #[serde(default)]
    pub results: Vec<JsonValue>,
    /// Updated continuation state, when the request carried a context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<ContextUpdate>,
    /// Human-readable detail for non-ok statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of a subscription acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAckBody {
    /// Server-assigned subscription id; tags all subsequent events.
    pub subid: u64,
}

/// A parsed inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Out-of-band session announcement, the first frame on a connection.
    Session(String),
    /// A regular tagged server message.
    Message(ServerMessage),
}

/// Parse one inbound text frame.
///
/// The session announcement carries no `t` tag, so it is probed before the
/// tagged envelope. Anything else that fails to parse is a
/// [`TsdbLinkError::ProtocolError`]; the dispatcher logs and drops those.
pub fn parse_frame(text: &str) -> Result<Inbound> {
    let value: JsonValue = serde_json::from_str(text)
        .map_err(|e| TsdbLinkError::ProtocolError(format!("unparseable frame: {}", e)))?;

    if value.get("t").is_none() {
        if let Some(session) = value.get("sessionid").and_then(JsonValue::as_str) {
            return Ok(Inbound::Session(session.to_string()));
        }
        return Err(TsdbLinkError::ProtocolError(
            "frame has neither a 't' tag nor a sessionid".to_string(),
        ));
    }

    serde_json::from_value::<ServerMessage>(value)
        .map(Inbound::Message)
        .map_err(|e| TsdbLinkError::ProtocolError(format!("malformed envelope: {}", e)))
}
