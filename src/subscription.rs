//! Subscription lifecycle and event routing.
//!
//! The [`SubscriptionRouter`] lives inside the dispatcher task and owns
//! every subscription's state machine: pending until the server
//! acknowledges with a subscription id, active while events flow,
//! cancelling once an unsubscribe is in flight. Subscriptions are keyed by
//! topic expression, so concurrent subscribers to the same expression share
//! one server-side subscription and fan out locally.
//!
//! Events that arrive for a subscription id the router has not bound yet
//! (the server can emit before the acknowledgement lands) are buffered and
//! replayed in order on activation.

use std::collections::{HashMap, HashSet};

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};

use crate::client::ClientCmd;
use crate::error::{Result, TsdbLinkError};

/// Events buffered per unbound subscription id before its acknowledgement.
/// Overflow drops the oldest.
const ORPHAN_BUFFER_CAP: usize = 256;

/// What a resolved subscribe call receives.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubscribeGrant {
    pub subid: u64,
    pub listener_id: u64,
}

type Listener = mpsc::UnboundedSender<Result<JsonValue>>;
type Waiter = oneshot::Sender<Result<SubscribeGrant>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubState {
    /// Subscribe frame issued (or queued); no acknowledgement yet.
    Pending,
    /// Acknowledged and bound to a server-side subscription id.
    Active { subid: u64 },
}

struct SubEntry {
    state: SubState,
    listeners: Vec<(u64, Listener)>,
    /// Subscribe calls awaiting the acknowledgement, by listener id.
    waiters: Vec<(u64, Waiter)>,
}

/// Outcome of attaching a listener to an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttachOutcome {
    /// First listener; the caller must issue a subscribe frame.
    Created { listener_id: u64 },
    /// Joined an existing pending subscription; the ack will resolve it.
    Joined { listener_id: u64 },
    /// Joined an active subscription; the ack was resolved immediately.
    Active { listener_id: u64 },
}

/// Outcome of removing a listener from an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveOutcome {
    NotFound,
    /// Other listeners remain; nothing to do.
    Remaining,
    /// Last listener left before the acknowledgement; entry dropped. If the
    /// ack still arrives, the caller unsubscribes the orphaned id.
    LastPending,
    /// Last listener left an active subscription; the caller must issue an
    /// unsubscribe for `subid`.
    LastActive { subid: u64 },
}

/// Routes server-push events to local subscribers. Dispatcher-confined.
pub(crate) struct SubscriptionRouter {
    entries: HashMap<String, SubEntry>,
    by_subid: HashMap<u64, String>,
    /// Ids with an unsubscribe in flight; their events are dropped.
    cancelling: HashSet<u64>,
    /// Pre-acknowledgement events keyed by the unbound subscription id.
    orphans: HashMap<u64, Vec<JsonValue>>,
    next_listener_id: u64,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_subid: HashMap::new(),
            cancelling: HashSet::new(),
            orphans: HashMap::new(),
            next_listener_id: 0,
        }
    }

    /// Attach a listener to `expression`, creating the entry when absent.
    /// For an already-active expression the waiter resolves immediately.
    pub fn attach(&mut self, expression: &str, listener: Listener, waiter: Waiter) -> AttachOutcome {
        self.next_listener_id += 1;
        let listener_id = self.next_listener_id;

        match self.entries.get_mut(expression) {
            Some(entry) => {
                entry.listeners.push((listener_id, listener));
                match entry.state {
                    SubState::Active { subid } => {
                        let _ = waiter.send(Ok(SubscribeGrant { subid, listener_id }));
                        AttachOutcome::Active { listener_id }
                    },
                    SubState::Pending => {
                        entry.waiters.push((listener_id, waiter));
                        AttachOutcome::Joined { listener_id }
                    },
                }
            },
            None => {
                self.entries.insert(
                    expression.to_string(),
                    SubEntry {
                        state: SubState::Pending,
                        listeners: vec![(listener_id, listener)],
                        waiters: vec![(listener_id, waiter)],
                    },
                );
                AttachOutcome::Created { listener_id }
            },
        }
    }

    /// Bind a pending expression to its server-assigned id, resolve its
    /// waiters, and replay any events buffered for that id.
    ///
    /// Returns `false` if every listener detached before the ack arrived;
    /// the caller should unsubscribe the now-orphaned id.
    pub fn activate(&mut self, expression: &str, subid: u64) -> bool {
        let Some(entry) = self.entries.get_mut(expression) else {
            return false;
        };
        entry.state = SubState::Active { subid };
        self.by_subid.insert(subid, expression.to_string());

        for (listener_id, waiter) in entry.waiters.drain(..) {
            let _ = waiter.send(Ok(SubscribeGrant { subid, listener_id }));
        }
        if let Some(buffered) = self.orphans.remove(&subid) {
            log::debug!(
                "replaying {} buffered event(s) for subid {}",
                buffered.len(),
                subid
            );
            for event in buffered {
                entry.listeners.retain(|(id, tx)| {
                    let alive = tx.send(Ok(event.clone())).is_ok();
                    if !alive {
                        log::debug!("listener {} dropped during replay", id);
                    }
                    alive
                });
            }
        }
        self.prune_orphans();
        true
    }

    /// Fail a pending expression: waiters and listeners get the error, the
    /// entry is dropped.
    pub fn fail_pending(&mut self, expression: &str, err: TsdbLinkError) {
        let Some(mut entry) = self.entries.remove(expression) else {
            return;
        };
        if let SubState::Active { subid } = entry.state {
            self.by_subid.remove(&subid);
        }
        for (_, waiter) in entry.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        for (_, listener) in entry.listeners.drain(..) {
            let _ = listener.send(Err(err.clone()));
        }
        self.prune_orphans();
    }

    /// Detach one listener from an expression.
    pub fn remove_listener(&mut self, expression: &str, listener_id: u64) -> RemoveOutcome {
        let Some(entry) = self.entries.get_mut(expression) else {
            return RemoveOutcome::NotFound;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|(id, _)| *id != listener_id);
        entry.waiters.retain(|(id, _)| *id != listener_id);
        if entry.listeners.len() == before {
            return RemoveOutcome::NotFound;
        }
        if !entry.listeners.is_empty() {
            return RemoveOutcome::Remaining;
        }
        let state = entry.state;
        self.entries.remove(expression);
        match state {
            SubState::Pending => {
                self.prune_orphans();
                RemoveOutcome::LastPending
            },
            SubState::Active { subid } => {
                self.by_subid.remove(&subid);
                RemoveOutcome::LastActive { subid }
            },
        }
    }

    /// Drop buffered pre-ack events once no pending subscription remains to
    /// claim them. Subscription ids are reusable after an unsubscribe, so a
    /// stale buffer would replay a previous epoch's events into a later
    /// subscription acked with the same id.
    fn prune_orphans(&mut self) {
        if !self.orphans.is_empty() && !self.has_pending() {
            log::debug!(
                "dropping {} unclaimed pre-ack buffer(s)",
                self.orphans.len()
            );
            self.orphans.clear();
        }
    }

    /// Record that an unsubscribe for `subid` is in flight. Events for the
    /// id are dropped from here on.
    pub fn mark_cancelled(&mut self, subid: u64) {
        self.cancelling.insert(subid);
        self.orphans.remove(&subid);
    }

    /// The unsubscribe for `subid` terminated (acknowledged or given up on).
    pub fn finish_cancel(&mut self, subid: u64) {
        self.cancelling.remove(&subid);
    }

    /// Route one server-push event. Returns the subscription id to
    /// unsubscribe when the delivery discovers every listener has hung up.
    pub fn deliver(&mut self, subid: u64, event: JsonValue) -> Option<u64> {
        if self.cancelling.contains(&subid) {
            return None;
        }
        let Some(expression) = self.by_subid.get(&subid) else {
            if self.has_pending() {
                let buffer = self.orphans.entry(subid).or_default();
                if buffer.len() >= ORPHAN_BUFFER_CAP {
                    log::warn!("orphan buffer full for subid {}, dropping oldest", subid);
                    buffer.remove(0);
                }
                buffer.push(event);
            } else {
                log::debug!("dropping event for unknown subid {}", subid);
            }
            return None;
        };
        let expression = expression.clone();
        let entry = self.entries.get_mut(&expression)?;
        entry.listeners.retain(|(id, tx)| {
            let alive = tx.send(Ok(event.clone())).is_ok();
            if !alive {
                log::debug!("listener {} hung up on '{}'", id, expression);
            }
            alive
        });
        if entry.listeners.is_empty() {
            self.entries.remove(&expression);
            self.by_subid.remove(&subid);
            return Some(subid);
        }
        None
    }

    /// Demote every subscription to pending for a reconnect, keeping
    /// listeners attached. Returns the expressions to resubscribe.
    pub fn reset_to_pending(&mut self) -> Vec<String> {
        self.by_subid.clear();
        self.orphans.clear();
        let mut expressions = Vec::with_capacity(self.entries.len());
        for (expression, entry) in self.entries.iter_mut() {
            entry.state = SubState::Pending;
            expressions.push(expression.clone());
        }
        expressions
    }

    /// Terminal teardown: every waiter and listener gets the error, the
    /// router empties.
    pub fn cancel_all(&mut self, err: TsdbLinkError) {
        for (_, mut entry) in self.entries.drain() {
            for (_, waiter) in entry.waiters.drain(..) {
                let _ = waiter.send(Err(err.clone()));
            }
            for (_, listener) in entry.listeners.drain(..) {
                let _ = listener.send(Err(err.clone()));
            }
        }
        self.by_subid.clear();
        self.cancelling.clear();
        self.orphans.clear();
    }

    pub fn has_pending(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.state == SubState::Pending)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A live subscription to a topic expression.
///
/// Events arrive through [`next`](Subscription::next) in server order.
/// Dropping the handle (or calling [`close`](Subscription::close)) detaches
/// this listener; the server-side subscription is torn down when its last
/// local listener detaches.
#[derive(Debug)]
pub struct Subscription {
    expression: String,
    subid: u64,
    listener_id: u64,
    rx: mpsc::UnboundedReceiver<Result<JsonValue>>,
    cmd_tx: mpsc::UnboundedSender<ClientCmd>,
    closed: bool,
}

impl Subscription {
    pub(crate) fn new(
        expression: String,
        subid: u64,
        listener_id: u64,
        rx: mpsc::UnboundedReceiver<Result<JsonValue>>,
        cmd_tx: mpsc::UnboundedSender<ClientCmd>,
    ) -> Self {
        Self {
            expression,
            subid,
            listener_id,
            rx,
            cmd_tx,
            closed: false,
        }
    }

    /// The topic expression this subscription was created with.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The server-assigned subscription id.
    pub fn subscription_id(&self) -> u64 {
        self.subid
    }

    /// Receive the next event. `None` once the subscription has terminated
    /// (closed locally, cancelled, or the connection ended without
    /// reconnect). An `Err` item reports the terminal failure; `None`
    /// follows it.
    pub async fn next(&mut self) -> Option<Result<JsonValue>> {
        if self.closed {
            return None;
        }
        let item = self.rx.recv().await;
        if item.is_none() {
            self.closed = true;
        }
        item
    }

    /// Detach this listener. Idempotent; the server-side subscription is
    /// unsubscribed once no local listeners remain.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.cmd_tx.send(ClientCmd::CloseSubscription {
            expression: self.expression.clone(),
            listener_id: self.listener_id,
        });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listener() -> (Listener, mpsc::UnboundedReceiver<Result<JsonValue>>) {
        mpsc::unbounded_channel()
    }

    fn waiter() -> (Waiter, oneshot::Receiver<Result<SubscribeGrant>>) {
        oneshot::channel()
    }

    #[tokio::test]
    async fn test_first_attach_creates_then_ack_resolves() {
        let mut router = SubscriptionRouter::new();
        let (tx, mut rx) = listener();
        let (w, ack) = waiter();

        let outcome = router.attach("sys.cpu.*", tx, w);
        assert!(matches!(outcome, AttachOutcome::Created { .. }));
        assert!(router.has_pending());

        assert!(router.activate("sys.cpu.*", 42));
        let grant = ack.await.unwrap().unwrap();
        assert_eq!(grant.subid, 42);

        router.deliver(42, json!({"v": 1}));
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_second_attach_on_active_resolves_immediately() {
        let mut router = SubscriptionRouter::new();
        let (tx1, mut rx1) = listener();
        let (w1, _ack1) = waiter();
        router.attach("topic", tx1, w1);
        router.activate("topic", 7);

        let (tx2, mut rx2) = listener();
        let (w2, ack2) = waiter();
        let outcome = router.attach("topic", tx2, w2);
        assert!(matches!(outcome, AttachOutcome::Active { .. }));
        assert_eq!(ack2.await.unwrap().unwrap().subid, 7);

        // fan-out reaches both listeners
        router.deliver(7, json!("e"));
        assert_eq!(rx1.recv().await.unwrap().unwrap(), json!("e"));
        assert_eq!(rx2.recv().await.unwrap().unwrap(), json!("e"));
    }

    #[tokio::test]
    async fn test_pre_ack_events_buffer_and_replay_in_order() {
        let mut router = SubscriptionRouter::new();
        let (tx, mut rx) = listener();
        let (w, _ack) = waiter();
        router.attach("topic", tx, w);

        // ack has not arrived, but the server already emits for subid 9
        router.deliver(9, json!(1));
        router.deliver(9, json!(2));
        assert!(rx.try_recv().is_err());

        router.activate("topic", 9);
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(1));
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_events_without_any_pending_sub_are_dropped() {
        let mut router = SubscriptionRouter::new();
        router.deliver(5, json!("noise"));
        assert!(router.orphans.is_empty());
    }

    #[tokio::test]
    async fn test_failed_pending_drops_buffered_orphans() {
        let mut router = SubscriptionRouter::new();
        let (tx, _rx) = listener();
        let (w, _ack) = waiter();
        router.attach("topic", tx, w);

        router.deliver(99, json!("ghost"));
        assert!(!router.orphans.is_empty());

        router.fail_pending("topic", TsdbLinkError::ConnectionClosed("gone".into()));
        assert!(router.orphans.is_empty());

        // a later subscription acked with the recycled id sees nothing stale
        let (tx2, mut rx2) = listener();
        let (w2, _ack2) = waiter();
        router.attach("other", tx2, w2);
        assert!(router.activate("other", 99));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_pending_detach_drops_buffered_orphans() {
        let mut router = SubscriptionRouter::new();
        let (tx, _rx) = listener();
        let (w, _ack) = waiter();
        let AttachOutcome::Created { listener_id } = router.attach("topic", tx, w) else {
            panic!("expected Created");
        };
        router.deliver(5, json!("early"));
        assert!(!router.orphans.is_empty());

        assert_eq!(
            router.remove_listener("topic", listener_id),
            RemoveOutcome::LastPending
        );
        assert!(router.orphans.is_empty());
    }

    #[tokio::test]
    async fn test_activation_drops_orphans_buffered_for_other_ids() {
        let mut router = SubscriptionRouter::new();
        let (tx, mut rx) = listener();
        let (w, _ack) = waiter();
        router.attach("topic", tx, w);

        // events for two candidate ids arrive before the ack picks one
        router.deliver(7, json!("claimed"));
        router.deliver(8, json!("unclaimed"));

        router.activate("topic", 7);
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!("claimed"));
        // nothing pending can claim the other buffer anymore
        assert!(router.orphans.is_empty());
    }

    #[tokio::test]
    async fn test_last_listener_detach_requests_unsubscribe() {
        let mut router = SubscriptionRouter::new();
        let (tx, _rx) = listener();
        let (w, _ack) = waiter();
        let AttachOutcome::Created { listener_id } = router.attach("topic", tx, w) else {
            panic!("expected Created");
        };
        router.activate("topic", 3);

        let outcome = router.remove_listener("topic", listener_id);
        assert_eq!(outcome, RemoveOutcome::LastActive { subid: 3 });
        assert!(router.is_empty());
        // detach is idempotent
        assert_eq!(
            router.remove_listener("topic", listener_id),
            RemoveOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_non_last_detach_keeps_subscription() {
        let mut router = SubscriptionRouter::new();
        let (tx1, _rx1) = listener();
        let (w1, _a1) = waiter();
        let AttachOutcome::Created { listener_id: id1 } = router.attach("topic", tx1, w1) else {
            panic!("expected Created");
        };
        router.activate("topic", 4);
        let (tx2, mut rx2) = listener();
        let (w2, _a2) = waiter();
        router.attach("topic", tx2, w2);

        assert_eq!(
            router.remove_listener("topic", id1),
            RemoveOutcome::Remaining
        );
        router.deliver(4, json!("still on"));
        assert_eq!(rx2.recv().await.unwrap().unwrap(), json!("still on"));
    }

    #[tokio::test]
    async fn test_cancelled_subid_events_are_dropped() {
        let mut router = SubscriptionRouter::new();
        router.mark_cancelled(8);
        assert!(router.deliver(8, json!("late")).is_none());
        router.finish_cancel(8);
        assert!(router.cancelling.is_empty());
    }

    #[tokio::test]
    async fn test_fail_pending_errors_waiters_and_listeners() {
        let mut router = SubscriptionRouter::new();
        let (tx, mut rx) = listener();
        let (w, ack) = waiter();
        router.attach("topic", tx, w);

        router.fail_pending("topic", TsdbLinkError::Timeout { rid: 2, elapsed_ms: 50 });
        assert!(matches!(
            ack.await.unwrap(),
            Err(TsdbLinkError::Timeout { .. })
        ));
        assert!(matches!(rx.recv().await, Some(Err(_))));
        assert!(rx.recv().await.is_none());
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn test_reset_to_pending_keeps_listeners() {
        let mut router = SubscriptionRouter::new();
        let (tx, mut rx) = listener();
        let (w, _ack) = waiter();
        router.attach("topic", tx, w);
        router.activate("topic", 11);

        let expressions = router.reset_to_pending();
        assert_eq!(expressions, vec!["topic".to_string()]);
        assert!(router.has_pending());

        // the old subid is unbound now; a fresh ack rebinds
        router.activate("topic", 12);
        router.deliver(12, json!("after reconnect"));
        assert_eq!(
            rx.recv().await.unwrap().unwrap(),
            json!("after reconnect")
        );
    }

    #[tokio::test]
    async fn test_cancel_all_terminates_everything() {
        let mut router = SubscriptionRouter::new();
        let (tx, mut rx) = listener();
        let (w, _ack) = waiter();
        router.attach("a", tx, w);
        let (tx2, mut rx2) = listener();
        let (w2, _ack2) = waiter();
        router.attach("b", tx2, w2);
        router.activate("b", 2);

        router.cancel_all(TsdbLinkError::ConnectionClosed("gone".into()));
        assert!(matches!(rx.recv().await, Some(Err(_))));
        assert!(matches!(rx2.recv().await, Some(Err(_))));
        assert!(router.is_empty());
    }
}
