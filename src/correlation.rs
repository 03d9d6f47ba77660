//! In-flight request tracking.
//!
//! The [`CorrelationTable`] maps request ids to pending entries and owns
//! every per-request timer. It is confined to the dispatcher task, which
//! makes entry removal the single serialization point: when a reply and a
//! timeout race, whichever removes the entry first wins and the loser
//! observes a no-op.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::context::QueryContext;
use crate::error::{Result, TsdbLinkError};
use crate::handle::ResultSender;

/// What a completed entry resolves. Subscribe/unsubscribe acknowledgements
/// ride through the same table as caller requests so the "every registered
/// id terminates exactly once" invariant covers them too.
#[derive(Debug)]
pub(crate) enum ResultTarget {
    /// A caller-visible request handle.
    Caller(ResultSender),
    /// The pending acknowledgement of a subscribe frame.
    SubscribeAck { expression: String },
    /// The pending acknowledgement of an unsubscribe request.
    UnsubscribeAck { subid: u64 },
}

/// One in-flight request.
#[derive(Debug)]
pub(crate) struct PendingEntry {
    pub target: ResultTarget,
    /// Continuation state for this request, refreshed from every reply.
    pub context: Option<QueryContext>,
    /// The request exactly as sent, retained for diagnostics (logged when
    /// the entry times out).
    pub envelope: String,
    deadline: Instant,
    registered_at: Instant,
}

impl PendingEntry {
    fn timeout(&self, default: Duration) -> Duration {
        self.context
            .as_ref()
            .map(|c| Duration::from_millis(c.timeout_ms))
            .unwrap_or(default)
    }

    /// Milliseconds since this entry was registered.
    pub fn elapsed_ms(&self) -> u64 {
        self.registered_at.elapsed().as_millis() as u64
    }
}

/// Tracks pending requests keyed by request id.
#[derive(Debug)]
pub(crate) struct CorrelationTable {
    entries: HashMap<u64, PendingEntry>,
    default_timeout: Duration,
}

impl CorrelationTable {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_timeout,
        }
    }

    /// Add a pending entry and start its timer (`context.timeout_ms`, or the
    /// default for context-free calls).
    ///
    /// A duplicate id indicates a broken id source and is loud, never a
    /// silent overwrite.
    pub fn register(
        &mut self,
        rid: u64,
        context: Option<QueryContext>,
        target: ResultTarget,
        envelope: String,
    ) -> Result<()> {
        let timeout = context
            .as_ref()
            .map(|c| Duration::from_millis(c.timeout_ms))
            .unwrap_or(self.default_timeout);
        self.register_with_timeout(rid, context, timeout, target, envelope)
    }

    /// Like [`register`](Self::register) with an explicit deadline duration,
    /// used for subscribe/unsubscribe acknowledgements which have their own
    /// configured timeout.
    pub fn register_with_timeout(
        &mut self,
        rid: u64,
        context: Option<QueryContext>,
        timeout: Duration,
        target: ResultTarget,
        envelope: String,
    ) -> Result<()> {
        if self.entries.contains_key(&rid) {
            return Err(TsdbLinkError::DuplicateRequestId(rid));
        }
        let now = Instant::now();
        self.entries.insert(
            rid,
            PendingEntry {
                target,
                context,
                envelope,
                deadline: now + timeout,
                registered_at: now,
            },
        );
        Ok(())
    }

    /// Remove the entry for a terminal reply, clearing its timer. Returns
    /// `None` for unknown/late ids (the caller logs and drops those frames).
    pub fn complete(&mut self, rid: u64) -> Option<PendingEntry> {
        self.entries.remove(&rid)
    }

    /// Re-arm the timer for a continuing request without removing it.
    pub fn progress(&mut self, rid: u64) -> Option<&mut PendingEntry> {
        let default = self.default_timeout;
        let entry = self.entries.get_mut(&rid)?;
        entry.deadline = Instant::now() + entry.timeout(default);
        Some(entry)
    }

    /// Caller-initiated removal. Idempotent via the `None` return.
    pub fn cancel(&mut self, rid: u64) -> Option<PendingEntry> {
        self.entries.remove(&rid)
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn expire_due(&mut self, now: Instant) -> Vec<(u64, PendingEntry)> {
        let due: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(rid, _)| *rid)
            .collect();
        due.into_iter()
            .filter_map(|rid| self.entries.remove(&rid).map(|e| (rid, e)))
            .collect()
    }

    /// Remove and return every entry; used when the transport closes so no
    /// entry is ever silently dropped.
    pub fn drain_all(&mut self) -> Vec<(u64, PendingEntry)> {
        self.entries.drain().collect()
    }

    /// The earliest pending deadline, feeding the dispatcher's timer arm.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    pub fn contains(&self, rid: u64) -> bool {
        self.entries.contains_key(&rid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// An entry's continuation context, if it has one.
    pub fn context(&self, rid: u64) -> Option<&QueryContext> {
        self.entries.get(&rid).and_then(|e| e.context.as_ref())
    }

    /// Mutable access to an entry's continuation context.
    pub fn context_mut(&mut self, rid: u64) -> Option<&mut QueryContext> {
        self.entries.get_mut(&rid).and_then(|e| e.context.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::result_channel;
    use tokio::sync::mpsc;
    use tokio::time::{self, Duration};

    fn caller_target(rid: u64) -> ResultTarget {
        let (cmd_tx, _rx) = mpsc::unbounded_channel();
        let (sender, handle) = result_channel(rid, cmd_tx);
        // the handle is dropped; sends become no-ops, which is fine here
        drop(handle);
        ResultTarget::Caller(sender)
    }

    fn table() -> CorrelationTable {
        CorrelationTable::new(Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_complete_round_trip() {
        let mut t = table();
        t.register(1, None, caller_target(1), "{}".into()).unwrap();
        assert!(t.contains(1));
        assert!(t.complete(1).is_some());
        assert!(!t.contains(1));
        assert!(t.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_rid_is_loud() {
        let mut t = table();
        t.register(7, None, caller_target(7), "{}".into()).unwrap();
        let err = t
            .register(7, None, caller_target(7), "{}".into())
            .unwrap_err();
        assert!(matches!(err, TsdbLinkError::DuplicateRequestId(7)));
        // the original entry survives untouched
        assert_eq!(t.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_unknown_rid_is_noop() {
        let mut t = table();
        assert!(t.complete(99).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_context_timeout() {
        let mut t = table();
        let ctx = QueryContext::new().with_timeout_ms(50);
        t.register(1, Some(ctx), caller_target(1), "{}".into())
            .unwrap();

        time::advance(Duration::from_millis(40)).await;
        assert!(t.expire_due(Instant::now()).is_empty());

        time::advance(Duration::from_millis(20)).await;
        let due = t.expire_due(Instant::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 1);
        assert!(!t.contains(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_rearms_timer() {
        let mut t = table();
        let ctx = QueryContext::new().with_timeout_ms(50);
        t.register(2, Some(ctx), caller_target(2), "{}".into())
            .unwrap();

        time::advance(Duration::from_millis(40)).await;
        assert!(t.progress(2).is_some());

        // without the re-arm this would have expired at t=50
        time::advance(Duration::from_millis(40)).await;
        assert!(t.expire_due(Instant::now()).is_empty());

        time::advance(Duration::from_millis(20)).await;
        assert_eq!(t.expire_due(Instant::now()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_wins_race_with_timeout() {
        let mut t = table();
        let ctx = QueryContext::new().with_timeout_ms(50);
        t.register(3, Some(ctx), caller_target(3), "{}".into())
            .unwrap();

        // both the reply and the timer are "queued": the reply runs first
        time::advance(Duration::from_millis(60)).await;
        assert!(t.complete(3).is_some());
        assert!(t.expire_due(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wins_race_with_complete() {
        let mut t = table();
        let ctx = QueryContext::new().with_timeout_ms(50);
        t.register(4, Some(ctx), caller_target(4), "{}".into())
            .unwrap();

        time::advance(Duration::from_millis(60)).await;
        assert_eq!(t.expire_due(Instant::now()).len(), 1);
        assert!(t.complete(4).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_all_empties_table() {
        let mut t = table();
        t.register(5, None, caller_target(5), "{}".into()).unwrap();
        t.register(6, None, caller_target(6), "{}".into()).unwrap();
        let drained = t.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(t.is_empty());
        assert!(t.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_deadline_tracks_earliest_entry() {
        let mut t = table();
        t.register(
            1,
            Some(QueryContext::new().with_timeout_ms(500)),
            caller_target(1),
            "{}".into(),
        )
        .unwrap();
        t.register(
            2,
            Some(QueryContext::new().with_timeout_ms(100)),
            caller_target(2),
            "{}".into(),
        )
        .unwrap();

        let deadline = t.next_deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_millis(100));
    }
}
