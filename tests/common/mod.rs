//! Shared harness for driving a client over an in-process message port.
#![allow(dead_code)]

use serde_json::{json, Value as JsonValue};
use tsdb_link::{PortPeer, PortTransport, TsdbLinkClient, Transport};

/// A client over an already-open port.
pub fn connected_client() -> (TsdbLinkClient, PortPeer) {
    let (transport, peer) = PortTransport::pair();
    let client = TsdbLinkClient::with_transport(Transport::from(transport));
    (client, peer)
}

/// A client over a port that has not opened yet.
pub fn connecting_client() -> (TsdbLinkClient, PortPeer) {
    let (transport, peer) = PortTransport::pair_connecting();
    let client = TsdbLinkClient::with_transport(Transport::from(transport));
    (client, peer)
}

/// A successful reply page with continuation state.
pub fn ok_page(rerid: u64, results: JsonValue, q: JsonValue) -> String {
    json!({"t": "resp", "rerid": rerid, "op": "ok", "msg": {"results": results, "q": q}})
        .to_string()
}

/// A successful terminal reply without continuation state.
pub fn ok_final(rerid: u64, results: JsonValue) -> String {
    json!({"t": "resp", "rerid": rerid, "op": "ok", "msg": {"results": results}}).to_string()
}

/// A non-ok reply.
pub fn error_reply(rerid: u64, status: &str, message: &str) -> String {
    json!({"t": "resp", "rerid": rerid, "op": status, "msg": {"message": message}}).to_string()
}

/// A subscription acknowledgement binding `rerid` to `subid`.
pub fn suback(rerid: u64, subid: u64) -> String {
    json!({"t": "suback", "rerid": rerid, "msg": {"subid": subid}}).to_string()
}

/// A server-push subscription event.
pub fn subev(subid: u64, msg: JsonValue) -> String {
    json!({"t": "subev", "subid": subid, "msg": msg}).to_string()
}

/// The out-of-band session announcement.
pub fn session_frame(id: &str) -> String {
    json!({"sessionid": id}).to_string()
}

/// Receive and parse the next outbound frame from the client.
pub async fn recv_json(peer: &mut PortPeer) -> JsonValue {
    let text = peer.recv().await.expect("client hung up");
    serde_json::from_str(&text).expect("client sent invalid json")
}

/// Yield a few times so the dispatcher task catches up with queued work.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
