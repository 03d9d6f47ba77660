//! Caller-visible result handles.
//!
//! One explicit handle type with three well-defined transitions:
//! `progress* -> (resolve | reject)`, exactly once terminal. The sending
//! half lives inside the correlation table; terminal methods consume it so
//! a double resolve cannot compile.

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::client::ClientCmd;
use crate::context::QueryContext;
use crate::error::{Result, TsdbLinkError};

/// One page of results delivered for a correlated request.
#[derive(Debug, Clone)]
pub struct ResultPage {
    /// Correlation id of the request that produced this page.
    pub rid: u64,
    /// Wire status string (`"ok"` on success).
    pub status: String,
    /// Result items for this page.
    pub results: Vec<JsonValue>,
    /// Snapshot of the refreshed continuation state at delivery time.
    pub context: Option<QueryContext>,
}

/// Events observable on a [`CallHandle`].
#[derive(Debug)]
pub enum CallEvent {
    /// An intermediate page of a continuing request.
    Page(ResultPage),
    /// Terminal success, carrying the final page.
    Done(ResultPage),
    /// Terminal failure.
    Failed(TsdbLinkError),
}

/// Sending half of a result handle, owned by the correlation table entry.
#[derive(Debug)]
pub(crate) struct ResultSender {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl ResultSender {
    /// Deliver an intermediate page without terminating the handle.
    pub fn progress(&self, page: ResultPage) {
        let _ = self.tx.send(CallEvent::Page(page));
    }

    /// Resolve the handle. Consumes the sender.
    pub fn resolve(self, page: ResultPage) {
        let _ = self.tx.send(CallEvent::Done(page));
    }

    /// Reject the handle. Consumes the sender.
    pub fn reject(self, err: TsdbLinkError) {
        let _ = self.tx.send(CallEvent::Failed(err));
    }
}

/// Caller-visible future for one logical request.
///
/// Returned immediately by every client call; completion arrives later via
/// the dispatcher. Pages queued before a failure remain observable through
/// [`next`](CallHandle::next), so a continuing query that dies mid-stream
/// still yields everything received so far.
#[derive(Debug)]
pub struct CallHandle {
    rid: u64,
    rx: mpsc::UnboundedReceiver<CallEvent>,
    cmd_tx: mpsc::UnboundedSender<ClientCmd>,
    finished: bool,
}

impl CallHandle {
    /// The correlation id assigned to this call.
    pub fn rid(&self) -> u64 {
        self.rid
    }

    /// Receive the next event. Returns `None` after the terminal event has
    /// been observed (or if the client shut down without one).
    pub async fn next(&mut self) -> Option<CallEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        match event {
            Some(CallEvent::Done(_)) | Some(CallEvent::Failed(_)) => self.finished = true,
            Some(CallEvent::Page(_)) => {},
            None => self.finished = true,
        }
        event
    }

    /// Await the terminal event and return the final page, discarding
    /// intermediate pages. Use [`next`](CallHandle::next) or
    /// [`collect`](CallHandle::collect) to observe per-page progress.
    pub async fn result(mut self) -> Result<ResultPage> {
        loop {
            match self.next().await {
                Some(CallEvent::Page(_)) => continue,
                Some(CallEvent::Done(page)) => return Ok(page),
                Some(CallEvent::Failed(err)) => return Err(err),
                None => {
                    return Err(TsdbLinkError::ConnectionClosed(
                        "client dispatcher is not running".to_string(),
                    ))
                },
            }
        }
    }

    /// Await the terminal event and return every page, the final one last.
    pub async fn collect(mut self) -> Result<Vec<ResultPage>> {
        let mut pages = Vec::new();
        loop {
            match self.next().await {
                Some(CallEvent::Page(page)) => pages.push(page),
                Some(CallEvent::Done(page)) => {
                    pages.push(page);
                    return Ok(pages);
                },
                Some(CallEvent::Failed(err)) => return Err(err),
                None => {
                    return Err(TsdbLinkError::ConnectionClosed(
                        "client dispatcher is not running".to_string(),
                    ))
                },
            }
        }
    }

    /// Cancel the pending request. Idempotent; the handle rejects with
    /// [`TsdbLinkError::Cancelled`] once the dispatcher processes it.
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(ClientCmd::Cancel { rid: self.rid });
    }
}

/// Create a connected sender/handle pair for request `rid`.
pub(crate) fn result_channel(
    rid: u64,
    cmd_tx: mpsc::UnboundedSender<ClientCmd>,
) -> (ResultSender, CallHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ResultSender { tx },
        CallHandle {
            rid,
            rx,
            cmd_tx,
            finished: false,
        },
    )
}
