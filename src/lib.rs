//! Asynchronous Rust client for the metric catalog WebSocket API.
//!
//! The server speaks a JSON envelope protocol over a single WebSocket:
//! correlated request/reply pairs (matched by a client-assigned `rid`),
//! paginated continuation queries driven by a [`QueryContext`], and
//! server-push subscriptions identified by a server-assigned `subid`.
//! This crate multiplexes all of it over one connection owned by a
//! background dispatcher task.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tsdb_link::{QueryContext, TsdbLinkClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TsdbLinkClient::connect("ws://localhost:4242/ws").await?;
//!
//! // one page of metric names
//! let page = client
//!     .metric_names_by_keys(None, &["host", "type", "cpu"])
//!     .result()
//!     .await?;
//! println!("{} names", page.results.len());
//!
//! // a continuous query streams pages until the cursor runs dry
//! let ctx = QueryContext::new().with_continuous(true).with_page_size(500);
//! let pages = client.resolve_ts_metas(Some(ctx), "sys.cpu:host=*").collect().await?;
//!
//! // server-push subscription
//! let mut sub = client.subscribe("sys.cpu.*").await?;
//! while let Some(event) = sub.next().await {
//!     println!("event: {:?}", event?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! Every [`TsdbLinkClient`] clone is a thin handle over a command channel
//! to the dispatcher task. The task owns the transport (WebSocket or
//! in-process message port), the correlation table of in-flight requests
//! with their deadlines, and the subscription router. Requests issued
//! before the transport opens are queued and delivered exactly once on
//! open; unexpected disconnects fail all in-flight requests and, for
//! WebSocket endpoints, trigger auto-reconnect with resubscription.

pub mod client;
pub mod context;
pub mod error;
pub mod event_handlers;
pub mod handle;
pub mod models;
pub mod options;
pub mod subscription;
pub mod timeouts;
pub mod transport;

mod correlation;

pub use client::{TsdbLinkClient, TsdbLinkClientBuilder, UidType};
pub use context::{ContextUpdate, OutputFormat, QueryContext};
pub use error::{Result, TsdbLinkError};
pub use event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
pub use handle::{CallEvent, CallHandle, ResultPage};
pub use options::ConnectionOptions;
pub use subscription::Subscription;
pub use timeouts::{TsdbLinkTimeouts, TsdbLinkTimeoutsBuilder};
pub use transport::{PortPeer, PortTransport, ReadyState, Transport, WsTransport};
