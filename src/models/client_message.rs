use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::context::QueryContext;

/// Client-to-server request frames, tagged by the `t` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum ClientMessage {
    /// A correlated service request:
    /// `{"t":"req","rid":1,"svc":"meta","op":"metricnames","q":{...},"keys":[...]}`
    #[serde(rename = "req")]
    Req {
        /// Correlation id, unique and monotonic per client instance.
        rid: u64,
        /// Target service name.
        svc: String,
        /// Operation within the service.
        op: String,
        /// Pagination/timeout context, omitted for context-free calls.
        #[serde(skip_serializing_if = "Option::is_none")]
        q: Option<QueryContext>,
        /// Per-operation arguments, flattened into the envelope.
        #[serde(flatten)]
        args: Map<String, JsonValue>,
    },

    /// A subscription request:
    /// `{"t":"sub","rid":2,"svc":"pubsub","op":"sub","x":"sys.cpu.*"}`
    #[serde(rename = "sub")]
    Sub {
        /// Correlation id for the acknowledgement.
        rid: u64,
        svc: String,
        op: String,
        /// Topic/filter expression.
        x: String,
    },
}

impl ClientMessage {
    /// Build a subscribe frame for `expression`.
    pub fn subscribe(rid: u64, expression: &str) -> Self {
        ClientMessage::Sub {
            rid,
            svc: "pubsub".to_string(),
            op: "sub".to_string(),
            x: expression.to_string(),
        }
    }

    /// The correlation id this frame expects a reply for.
    pub fn rid(&self) -> u64 {
        match self {
            ClientMessage::Req { rid, .. } | ClientMessage::Sub { rid, .. } => *rid,
        }
    }
}
