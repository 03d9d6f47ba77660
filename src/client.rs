//! The client handle and its dispatcher task.
//!
//! [`TsdbLinkClient`] is a cheap clonable handle; all protocol state lives
//! in a background dispatcher task that owns the transport, the
//! [`CorrelationTable`], and the [`SubscriptionRouter`]. The handle talks
//! to the task over an unbounded command channel, so no public method ever
//! blocks on the network.
//!
//! Request ids are allocated from an atomic sequence on the handle itself,
//! which keeps ids unique and monotonic across clones without a round trip
//! to the task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};

use crate::context::QueryContext;
use crate::correlation::{CorrelationTable, ResultTarget};
use crate::error::{Result, TsdbLinkError};
use crate::event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
use crate::handle::{result_channel, CallHandle, ResultPage, ResultSender};
use crate::models::{parse_frame, ClientMessage, Inbound, ResponseBody, ServerMessage, STATUS_OK};
use crate::options::ConnectionOptions;
use crate::subscription::{
    AttachOutcome, RemoveOutcome, SubscribeGrant, Subscription, SubscriptionRouter,
};
use crate::timeouts::TsdbLinkTimeouts;
use crate::transport::{ReadyState, Transport, TransportEvent, WsTransport};

/// Effectively "never" for the dispatcher's deadline timer when the
/// correlation table is empty.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

/// UID categories understood by the `finduid` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidType {
    Metric,
    TagKey,
    TagValue,
}

impl UidType {
    fn as_str(&self) -> &'static str {
        match self {
            UidType::Metric => "metric",
            UidType::TagKey => "tagk",
            UidType::TagValue => "tagv",
        }
    }
}

/// Commands from client handles to the dispatcher task.
pub(crate) enum ClientCmd {
    Call {
        rid: u64,
        service: String,
        op: String,
        args: Map<String, JsonValue>,
        context: Option<QueryContext>,
        sender: ResultSender,
    },
    Cancel {
        rid: u64,
    },
    Subscribe {
        expression: String,
        listener: mpsc::UnboundedSender<Result<JsonValue>>,
        ack: oneshot::Sender<Result<SubscribeGrant>>,
    },
    CloseSubscription {
        expression: String,
        listener_id: u64,
    },
    Shutdown,
}

/// A send queued while the transport was not yet open.
enum PendingSend {
    Call {
        rid: u64,
        service: String,
        op: String,
        args: Map<String, JsonValue>,
        context: Option<QueryContext>,
        sender: ResultSender,
    },
    Subscribe {
        expression: String,
    },
}

struct DeferredSend {
    attempts: u32,
    work: PendingSend,
}

/// What one dispatcher iteration decided about the transport.
enum Action {
    Continue,
    TransportDown(String),
    Shutdown,
}

enum OfflineOutcome {
    Transport(Transport),
    Continue,
    Shutdown,
}

struct Dispatcher {
    cmd_rx: mpsc::UnboundedReceiver<ClientCmd>,
    table: CorrelationTable,
    router: SubscriptionRouter,
    deferred: VecDeque<DeferredSend>,
    session_tx: watch::Sender<Option<String>>,
    handlers: EventHandlers,
    timeouts: TsdbLinkTimeouts,
    options: ConnectionOptions,
    connected: Arc<AtomicBool>,
    rid_seq: Arc<AtomicU64>,
    /// Resolved WebSocket endpoint; `None` for port transports, which
    /// cannot be redialed.
    endpoint: Option<String>,
    reconnect_attempts: u32,
    reconnect_exhausted: bool,
}

impl Dispatcher {
    async fn run(mut self, mut transport: Option<Transport>) {
        if let Some(t) = transport.as_ref() {
            if t.ready_state() == ReadyState::Open {
                self.connected.store(true, Ordering::SeqCst);
                self.handlers.emit_connect();
            }
        }
        loop {
            let action = match transport.as_mut() {
                Some(t) => self.run_online(t).await,
                None => match self.run_offline().await {
                    OfflineOutcome::Transport(mut t) => {
                        let action = self.after_reconnect(&mut t).await;
                        transport = Some(t);
                        action
                    },
                    OfflineOutcome::Continue => Action::Continue,
                    OfflineOutcome::Shutdown => Action::Shutdown,
                },
            };
            match action {
                Action::Continue => {},
                Action::TransportDown(reason) => {
                    transport = None;
                    self.on_transport_down(&reason);
                },
                Action::Shutdown => break,
            }
        }
        if let Some(mut t) = transport {
            t.close().await;
        }
        self.teardown("client shut down");
        log::debug!("dispatcher stopped");
    }

    /// One iteration with a live transport: a command, a request deadline,
    /// a delivery retry tick, or a transport event.
    async fn run_online(&mut self, t: &mut Transport) -> Action {
        let deadline = self.table.next_deadline();
        let timer = sleep_until(deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE));
        tokio::pin!(timer);
        let retry_due = !self.deferred.is_empty() && t.ready_state() != ReadyState::Open;

        tokio::select! {
            biased;
            cmd = self.cmd_rx.recv() => match cmd {
                None | Some(ClientCmd::Shutdown) => {
                    t.close().await;
                    Action::Shutdown
                },
                Some(cmd) => self.handle_cmd_online(cmd, t).await,
            },
            _ = &mut timer, if deadline.is_some() => {
                self.expire_due();
                Action::Continue
            },
            _ = sleep(self.timeouts.retry_interval), if retry_due => {
                self.bump_send_retries();
                Action::Continue
            },
            event = t.next_event() => match event {
                Some(TransportEvent::Opened) => {
                    self.connected.store(true, Ordering::SeqCst);
                    self.handlers.emit_connect();
                    self.flush_deferred(t).await
                },
                Some(TransportEvent::Frame(text)) => self.route_frame(t, &text).await,
                Some(TransportEvent::Closed(reason)) => Action::TransportDown(reason),
                Some(TransportEvent::Failed(reason)) => {
                    self.handlers.emit_error(ConnectionError::new(
                        reason.clone(),
                        self.can_reconnect(),
                    ));
                    Action::TransportDown(reason)
                },
                None => Action::TransportDown("transport terminated".to_string()),
            },
        }
    }

    async fn handle_cmd_online(&mut self, cmd: ClientCmd, t: &mut Transport) -> Action {
        match cmd {
            ClientCmd::Call {
                rid,
                service,
                op,
                args,
                context,
                sender,
            } => {
                if t.ready_state() == ReadyState::Open {
                    self.send_call(t, rid, service, op, args, context, sender)
                        .await
                } else {
                    log::debug!("transport not open, queueing rid {}", rid);
                    self.deferred.push_back(DeferredSend {
                        attempts: 0,
                        work: PendingSend::Call {
                            rid,
                            service,
                            op,
                            args,
                            context,
                            sender,
                        },
                    });
                    Action::Continue
                }
            },
            ClientCmd::Cancel { rid } => {
                self.cancel_rid(rid);
                Action::Continue
            },
            ClientCmd::Subscribe {
                expression,
                listener,
                ack,
            } => match self.router.attach(&expression, listener, ack) {
                AttachOutcome::Created { .. } => {
                    if t.ready_state() == ReadyState::Open {
                        self.send_subscribe(t, expression).await
                    } else {
                        self.deferred.push_back(DeferredSend {
                            attempts: 0,
                            work: PendingSend::Subscribe { expression },
                        });
                        Action::Continue
                    }
                },
                AttachOutcome::Joined { .. } | AttachOutcome::Active { .. } => Action::Continue,
            },
            ClientCmd::CloseSubscription {
                expression,
                listener_id,
            } => match self.router.remove_listener(&expression, listener_id) {
                RemoveOutcome::LastActive { subid } => {
                    self.router.mark_cancelled(subid);
                    if t.ready_state() == ReadyState::Open {
                        self.send_unsubscribe(t, subid).await
                    } else {
                        self.router.finish_cancel(subid);
                        Action::Continue
                    }
                },
                RemoveOutcome::LastPending => {
                    self.drop_deferred_subscribe(&expression);
                    Action::Continue
                },
                RemoveOutcome::Remaining | RemoveOutcome::NotFound => Action::Continue,
            },
            ClientCmd::Shutdown => Action::Shutdown,
        }
    }

    /// Resolve a cancellation against the table first, then the deferred
    /// queue. Unknown ids are a no-op, which makes cancel idempotent.
    fn cancel_rid(&mut self, rid: u64) {
        if let Some(entry) = self.table.cancel(rid) {
            log::debug!("cancelled in-flight rid {}", rid);
            match entry.target {
                ResultTarget::Caller(sender) => sender.reject(TsdbLinkError::Cancelled(rid)),
                ResultTarget::SubscribeAck { expression } => self
                    .router
                    .fail_pending(&expression, TsdbLinkError::Cancelled(rid)),
                ResultTarget::UnsubscribeAck { subid } => self.router.finish_cancel(subid),
            }
            return;
        }
        if let Some(pos) = self.deferred.iter().position(|d| {
            matches!(&d.work, PendingSend::Call { rid: queued, .. } if *queued == rid)
        }) {
            log::debug!("cancelled queued rid {}", rid);
            if let Some(DeferredSend {
                work: PendingSend::Call { sender, .. },
                ..
            }) = self.deferred.remove(pos)
            {
                sender.reject(TsdbLinkError::Cancelled(rid));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_call(
        &mut self,
        t: &mut Transport,
        rid: u64,
        service: String,
        op: String,
        args: Map<String, JsonValue>,
        context: Option<QueryContext>,
        sender: ResultSender,
    ) -> Action {
        let message = ClientMessage::Req {
            rid,
            svc: service,
            op,
            q: context.clone(),
            args,
        };
        let envelope = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                sender.reject(TsdbLinkError::SerializationError(e.to_string()));
                return Action::Continue;
            },
        };
        if let Err(e) = self.table.register(
            rid,
            context,
            ResultTarget::Caller(sender),
            envelope.clone(),
        ) {
            // register hands the sender back only via the table, so reject
            // through a fresh error on the handle's channel is impossible
            // here; the duplicate id is logged and the frame is not sent
            log::error!("refusing to send rid {}: {}", rid, e);
            return Action::Continue;
        }
        log::debug!("sending rid {}", rid);
        self.send_text(t, &envelope).await
    }

    async fn send_subscribe(&mut self, t: &mut Transport, expression: String) -> Action {
        let rid = self.next_rid();
        let message = ClientMessage::subscribe(rid, &expression);
        let envelope = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                self.router
                    .fail_pending(&expression, TsdbLinkError::SerializationError(e.to_string()));
                return Action::Continue;
            },
        };
        if let Err(e) = self.table.register_with_timeout(
            rid,
            None,
            self.timeouts.subscribe_timeout,
            ResultTarget::SubscribeAck {
                expression: expression.clone(),
            },
            envelope.clone(),
        ) {
            self.router.fail_pending(&expression, e);
            return Action::Continue;
        }
        log::debug!("subscribing to '{}' with rid {}", expression, rid);
        self.send_text(t, &envelope).await
    }

    async fn send_unsubscribe(&mut self, t: &mut Transport, subid: u64) -> Action {
        let rid = self.next_rid();
        let mut args = Map::new();
        args.insert("subid".to_string(), json!(subid));
        let message = ClientMessage::Req {
            rid,
            svc: "pubsub".to_string(),
            op: "unsub".to_string(),
            q: None,
            args,
        };
        let envelope = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("cannot build unsubscribe for subid {}: {}", subid, e);
                self.router.finish_cancel(subid);
                return Action::Continue;
            },
        };
        if let Err(e) = self.table.register_with_timeout(
            rid,
            None,
            self.timeouts.subscribe_timeout,
            ResultTarget::UnsubscribeAck { subid },
            envelope.clone(),
        ) {
            log::warn!("cannot track unsubscribe for subid {}: {}", subid, e);
            self.router.finish_cancel(subid);
            return Action::Continue;
        }
        log::debug!("unsubscribing subid {} with rid {}", subid, rid);
        self.send_text(t, &envelope).await
    }

    async fn send_text(&mut self, t: &mut Transport, envelope: &str) -> Action {
        self.handlers.emit_send(envelope);
        match t.send(envelope).await {
            Ok(()) => Action::Continue,
            Err(e) => Action::TransportDown(e.to_string()),
        }
    }

    /// Deliver everything queued before the transport opened. Each queued
    /// item is sent exactly once; a failure mid-flush keeps the remainder
    /// queued for the next open.
    async fn flush_deferred(&mut self, t: &mut Transport) -> Action {
        let queued = std::mem::take(&mut self.deferred);
        let mut rest = queued.into_iter();
        while let Some(item) = rest.next() {
            let action = match item.work {
                PendingSend::Call {
                    rid,
                    service,
                    op,
                    args,
                    context,
                    sender,
                } => {
                    self.send_call(t, rid, service, op, args, context, sender)
                        .await
                },
                PendingSend::Subscribe { expression } => self.send_subscribe(t, expression).await,
            };
            if let Action::TransportDown(reason) = action {
                self.deferred = rest.collect();
                return Action::TransportDown(reason);
            }
        }
        Action::Continue
    }

    /// Count a delivery retry against every queued send and fail the ones
    /// that exhausted their budget.
    fn bump_send_retries(&mut self) {
        let Some(limit) = self.options.max_send_retries else {
            return;
        };
        let queued = std::mem::take(&mut self.deferred);
        for mut item in queued {
            item.attempts += 1;
            if item.attempts <= limit {
                self.deferred.push_back(item);
                continue;
            }
            match item.work {
                PendingSend::Call { rid, sender, .. } => {
                    log::warn!("rid {} exhausted {} delivery retries", rid, limit);
                    sender.reject(TsdbLinkError::TransportError(format!(
                        "request {} not delivered after {} retries",
                        rid, limit
                    )));
                },
                PendingSend::Subscribe { expression } => {
                    log::warn!("subscribe '{}' exhausted {} delivery retries", expression, limit);
                    self.router.fail_pending(
                        &expression,
                        TsdbLinkError::TransportError(format!(
                            "subscribe not delivered after {} retries",
                            limit
                        )),
                    );
                },
            }
        }
    }

    fn drop_deferred_subscribe(&mut self, expression: &str) {
        self.deferred.retain(|d| {
            !matches!(&d.work, PendingSend::Subscribe { expression: e } if e == expression)
        });
    }

    async fn route_frame(&mut self, t: &mut Transport, text: &str) -> Action {
        self.handlers.emit_receive(text);
        match parse_frame(text) {
            Err(e) => {
                log::warn!("dropping inbound frame: {}", e);
                self.handlers
                    .emit_error(ConnectionError::new(e.to_string(), true));
                Action::Continue
            },
            Ok(Inbound::Session(session)) => {
                log::debug!("session established: {}", session);
                self.session_tx.send_replace(Some(session.clone()));
                self.handlers.emit_session(&session);
                Action::Continue
            },
            Ok(Inbound::Message(ServerMessage::Resp { rerid, op, msg })) => {
                self.on_response(rerid, op, msg);
                Action::Continue
            },
            Ok(Inbound::Message(ServerMessage::SubAck { rerid, msg })) => {
                self.on_suback(t, rerid, msg.subid).await
            },
            Ok(Inbound::Message(ServerMessage::SubEvent { subid, msg })) => {
                if let Some(dead) = self.router.deliver(subid, msg) {
                    self.router.mark_cancelled(dead);
                    self.send_unsubscribe(t, dead).await
                } else {
                    Action::Continue
                }
            },
        }
    }

    fn on_response(&mut self, rerid: u64, op: String, msg: ResponseBody) {
        if !self.table.contains(rerid) {
            log::debug!("dropping reply for unknown rid {}", rerid);
            return;
        }
        if let Some(update) = msg.q.as_ref() {
            if let Some(context) = self.table.context_mut(rerid) {
                context.refresh(update);
            }
        }
        let continuing = op == STATUS_OK
            && self
                .table
                .context(rerid)
                .map(QueryContext::should_continue)
                .unwrap_or(false);

        if continuing {
            if let Some(entry) = self.table.progress(rerid) {
                if let ResultTarget::Caller(sender) = &entry.target {
                    sender.progress(ResultPage {
                        rid: rerid,
                        status: op,
                        results: msg.results,
                        context: entry.context.clone(),
                    });
                }
            }
            return;
        }

        let Some(entry) = self.table.complete(rerid) else {
            return;
        };
        match entry.target {
            ResultTarget::Caller(sender) => {
                if op == STATUS_OK {
                    sender.resolve(ResultPage {
                        rid: rerid,
                        status: op,
                        results: msg.results,
                        context: entry.context,
                    });
                } else {
                    let message = msg
                        .message
                        .unwrap_or_else(|| format!("request {} failed", rerid));
                    log::debug!("rid {} failed with status '{}'", rerid, op);
                    sender.reject(TsdbLinkError::ServerError {
                        status: op,
                        message,
                    });
                }
            },
            ResultTarget::SubscribeAck { expression } => {
                // a subscribe answered with a plain reply is a refusal
                let message = msg
                    .message
                    .unwrap_or_else(|| format!("subscription to '{}' refused", expression));
                log::warn!("subscribe rid {} answered '{}': {}", rerid, op, message);
                self.router.fail_pending(
                    &expression,
                    TsdbLinkError::ServerError {
                        status: op,
                        message,
                    },
                );
            },
            ResultTarget::UnsubscribeAck { subid } => {
                if op != STATUS_OK {
                    log::warn!("unsubscribe for subid {} answered '{}'", subid, op);
                }
                self.router.finish_cancel(subid);
            },
        }
    }

    async fn on_suback(&mut self, t: &mut Transport, rerid: u64, subid: u64) -> Action {
        let Some(entry) = self.table.complete(rerid) else {
            log::debug!("dropping unmatched suback for rid {}", rerid);
            return Action::Continue;
        };
        match entry.target {
            ResultTarget::SubscribeAck { expression } => {
                if self.router.activate(&expression, subid) {
                    log::debug!("subscription '{}' active as subid {}", expression, subid);
                    Action::Continue
                } else {
                    // every listener detached while the ack was in flight
                    log::debug!("acked subid {} has no listeners, unsubscribing", subid);
                    self.router.mark_cancelled(subid);
                    self.send_unsubscribe(t, subid).await
                }
            },
            ResultTarget::Caller(sender) => {
                log::warn!("suback answered non-subscribe rid {}", rerid);
                sender.reject(TsdbLinkError::ProtocolError(format!(
                    "unexpected suback for rid {}",
                    rerid
                )));
                Action::Continue
            },
            ResultTarget::UnsubscribeAck { subid: pending } => {
                log::warn!("suback answered unsubscribe rid {}", rerid);
                self.router.finish_cancel(pending);
                Action::Continue
            },
        }
    }

    fn expire_due(&mut self) {
        for (rid, entry) in self.table.expire_due(Instant::now()) {
            let elapsed_ms = entry.elapsed_ms();
            match entry.target {
                ResultTarget::Caller(sender) => {
                    log::debug!(
                        "rid {} timed out after {}ms: {}",
                        rid,
                        elapsed_ms,
                        entry.envelope
                    );
                    sender.reject(TsdbLinkError::Timeout { rid, elapsed_ms });
                },
                ResultTarget::SubscribeAck { expression } => {
                    log::warn!("subscribe '{}' timed out after {}ms", expression, elapsed_ms);
                    self.router
                        .fail_pending(&expression, TsdbLinkError::Timeout { rid, elapsed_ms });
                },
                ResultTarget::UnsubscribeAck { subid } => {
                    log::warn!("unsubscribe for subid {} timed out", subid);
                    self.router.finish_cancel(subid);
                },
            }
        }
    }

    /// Terminal bookkeeping for a dropped transport: every in-flight
    /// request fails loudly, and subscriptions either demote to pending
    /// (reconnect ahead) or fail (terminal close).
    fn on_transport_down(&mut self, reason: &str) {
        log::warn!("transport down: {}", reason);
        self.connected.store(false, Ordering::SeqCst);
        self.session_tx.send_replace(None);
        self.handlers
            .emit_disconnect(DisconnectReason::new(reason));

        let will_reconnect = self.can_reconnect();
        for (_, entry) in self.table.drain_all() {
            match entry.target {
                ResultTarget::Caller(sender) => {
                    sender.reject(TsdbLinkError::ConnectionClosed(reason.to_string()));
                },
                ResultTarget::SubscribeAck { expression } => {
                    if !will_reconnect {
                        self.router.fail_pending(
                            &expression,
                            TsdbLinkError::ConnectionClosed(reason.to_string()),
                        );
                    }
                    // otherwise the resubscribe after reconnect re-issues it
                },
                ResultTarget::UnsubscribeAck { subid } => {
                    self.router.finish_cancel(subid);
                },
            }
        }

        if will_reconnect {
            for expression in self.router.reset_to_pending() {
                self.drop_deferred_subscribe(&expression);
                self.deferred.push_back(DeferredSend {
                    attempts: 0,
                    work: PendingSend::Subscribe { expression },
                });
            }
        } else {
            self.router
                .cancel_all(TsdbLinkError::ConnectionClosed(reason.to_string()));
            self.fail_deferred(reason);
        }
    }

    fn fail_deferred(&mut self, reason: &str) {
        for item in self.deferred.drain(..) {
            if let PendingSend::Call { sender, .. } = item.work {
                sender.reject(TsdbLinkError::ConnectionClosed(reason.to_string()));
            }
        }
    }

    fn can_reconnect(&self) -> bool {
        self.endpoint.is_some() && self.options.auto_reconnect && !self.reconnect_exhausted
    }

    /// One offline iteration: either wait out the backoff and redial, or
    /// (when reconnecting is off the table) serve commands with immediate
    /// failures.
    async fn run_offline(&mut self) -> OfflineOutcome {
        if !self.can_reconnect() {
            return match self.cmd_rx.recv().await {
                None | Some(ClientCmd::Shutdown) => OfflineOutcome::Shutdown,
                Some(cmd) => {
                    self.handle_cmd_terminal(cmd);
                    OfflineOutcome::Continue
                },
            };
        }

        let attempt = self.reconnect_attempts;
        if let Some(max) = self.options.max_reconnect_attempts {
            if attempt >= max {
                log::warn!("giving up after {} reconnect attempts", attempt);
                self.reconnect_exhausted = true;
                self.handlers.emit_error(ConnectionError::new(
                    format!("reconnect attempts exhausted after {} tries", attempt),
                    false,
                ));
                self.router.cancel_all(TsdbLinkError::ConnectionClosed(
                    "reconnect attempts exhausted".to_string(),
                ));
                self.fail_deferred("reconnect attempts exhausted");
                return OfflineOutcome::Continue;
            }
        }

        let delay = self.options.backoff_delay(attempt);
        log::debug!("reconnect attempt {} in {:?}", attempt + 1, delay);
        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            // the retry budget keeps counting while a reconnect is pending,
            // so max_send_retries bounds the wait here too
            let retry_due =
                !self.deferred.is_empty() && self.options.max_send_retries.is_some();
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(ClientCmd::Shutdown) => return OfflineOutcome::Shutdown,
                    Some(cmd) => self.handle_cmd_queued(cmd),
                },
                _ = sleep(self.timeouts.retry_interval), if retry_due => {
                    self.bump_send_retries();
                },
                _ = &mut timer => break,
            }
        }

        self.reconnect_attempts += 1;
        let endpoint = match self.endpoint.as_deref() {
            Some(endpoint) => endpoint,
            None => return OfflineOutcome::Continue,
        };
        match WsTransport::connect(endpoint, self.timeouts.connection_timeout).await {
            Ok(ws) => {
                log::debug!("reconnected to {}", endpoint);
                self.reconnect_attempts = 0;
                OfflineOutcome::Transport(ws.into())
            },
            Err(e) => {
                log::warn!("reconnect attempt {} failed: {}", attempt + 1, e);
                self.handlers
                    .emit_error(ConnectionError::new(e.to_string(), true));
                OfflineOutcome::Continue
            },
        }
    }

    async fn after_reconnect(&mut self, t: &mut Transport) -> Action {
        self.connected.store(true, Ordering::SeqCst);
        self.handlers.emit_connect();
        // the deferred queue holds queued calls plus one subscribe per
        // surviving expression, so one flush restores everything
        self.flush_deferred(t).await
    }

    /// Command handling while a reconnect is pending: everything queues.
    fn handle_cmd_queued(&mut self, cmd: ClientCmd) {
        match cmd {
            ClientCmd::Call {
                rid,
                service,
                op,
                args,
                context,
                sender,
            } => {
                self.deferred.push_back(DeferredSend {
                    attempts: 0,
                    work: PendingSend::Call {
                        rid,
                        service,
                        op,
                        args,
                        context,
                        sender,
                    },
                });
            },
            ClientCmd::Cancel { rid } => self.cancel_rid(rid),
            ClientCmd::Subscribe {
                expression,
                listener,
                ack,
            } => {
                if let AttachOutcome::Created { .. } = self.router.attach(&expression, listener, ack)
                {
                    self.deferred.push_back(DeferredSend {
                        attempts: 0,
                        work: PendingSend::Subscribe { expression },
                    });
                }
            },
            ClientCmd::CloseSubscription {
                expression,
                listener_id,
            } => {
                if let RemoveOutcome::LastPending | RemoveOutcome::LastActive { .. } =
                    self.router.remove_listener(&expression, listener_id)
                {
                    self.drop_deferred_subscribe(&expression);
                }
            },
            ClientCmd::Shutdown => {},
        }
    }

    /// Command handling after a terminal close: nothing can ever be sent.
    fn handle_cmd_terminal(&mut self, cmd: ClientCmd) {
        match cmd {
            ClientCmd::Call { rid, sender, .. } => {
                log::debug!("rejecting rid {}: connection is closed", rid);
                sender.reject(TsdbLinkError::ConnectionClosed(
                    "connection is closed".to_string(),
                ));
            },
            ClientCmd::Cancel { rid } => self.cancel_rid(rid),
            ClientCmd::Subscribe { ack, .. } => {
                let _ = ack.send(Err(TsdbLinkError::ConnectionClosed(
                    "connection is closed".to_string(),
                )));
            },
            ClientCmd::CloseSubscription {
                expression,
                listener_id,
            } => {
                let _ = self.router.remove_listener(&expression, listener_id);
            },
            ClientCmd::Shutdown => {},
        }
    }

    fn teardown(&mut self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.session_tx.send_replace(None);
        for (_, entry) in self.table.drain_all() {
            if let ResultTarget::Caller(sender) = entry.target {
                sender.reject(TsdbLinkError::ConnectionClosed(reason.to_string()));
            }
        }
        self.router
            .cancel_all(TsdbLinkError::ConnectionClosed(reason.to_string()));
        self.fail_deferred(reason);
    }

    fn next_rid(&self) -> u64 {
        self.rid_seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

struct ClientShared {
    cmd_tx: mpsc::UnboundedSender<ClientCmd>,
    rid_seq: Arc<AtomicU64>,
    session_rx: watch::Receiver<Option<String>>,
    connected: Arc<AtomicBool>,
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(ClientCmd::Shutdown);
    }
}

/// Asynchronous client for the metric catalog's WebSocket API.
///
/// Cloning is cheap; clones share the connection, the request id sequence,
/// and the dispatcher task. The task shuts down when the last clone drops.
///
/// # Example
///
/// ```rust,no_run
/// use tsdb_link::{QueryContext, TsdbLinkClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = TsdbLinkClient::connect("ws://localhost:4242/ws").await?;
/// let ctx = QueryContext::new().with_page_size(50);
/// let page = client
///     .metric_names_by_keys(Some(ctx), &["host", "type", "cpu"])
///     .result()
///     .await?;
/// println!("{} metric names", page.results.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TsdbLinkClient {
    inner: Arc<ClientShared>,
}

impl std::fmt::Debug for TsdbLinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsdbLinkClient")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl TsdbLinkClient {
    /// Connect to a WebSocket endpoint with default configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::builder().url(url).connect().await
    }

    /// Start configuring a client.
    pub fn builder() -> TsdbLinkClientBuilder {
        TsdbLinkClientBuilder::new()
    }

    /// Run the client over an externally supplied transport (typically a
    /// message port). No reconnection is attempted for these.
    pub fn with_transport(transport: Transport) -> Self {
        Self::builder().connect_transport(transport)
    }

    /// Issue a correlated request against `service`/`op`.
    ///
    /// Returns immediately; the handle completes when the reply, timeout,
    /// cancellation, or disconnect arrives. Requests issued before the
    /// transport opens are queued and delivered once it does.
    pub fn call(
        &self,
        service: &str,
        op: &str,
        args: Map<String, JsonValue>,
        context: Option<QueryContext>,
    ) -> CallHandle {
        let rid = self.inner.rid_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, handle) = result_channel(rid, self.inner.cmd_tx.clone());
        let cmd = ClientCmd::Call {
            rid,
            service: service.to_string(),
            op: op.to_string(),
            args,
            context,
            sender,
        };
        // on failure the sender inside the command drops, which surfaces
        // as ConnectionClosed on the handle
        let _ = self.inner.cmd_tx.send(cmd);
        handle
    }

    /// Metric names filtered by tag keys.
    pub fn metric_names_by_keys(
        &self,
        context: Option<QueryContext>,
        keys: &[&str],
    ) -> CallHandle {
        let mut args = Map::new();
        args.insert("keys".to_string(), json!(keys));
        self.call("meta", "metricnames", args, Some(context.unwrap_or_default()))
    }

    /// Metric names filtered by tag key/value pairs.
    pub fn metric_names_by_tags(
        &self,
        context: Option<QueryContext>,
        tags: &HashMap<String, String>,
    ) -> CallHandle {
        let mut args = Map::new();
        args.insert("tags".to_string(), json!(tags));
        self.call("meta", "metricswtags", args, Some(context.unwrap_or_default()))
    }

    /// Time series metadata for a metric name and tag filter.
    pub fn ts_metas(
        &self,
        context: Option<QueryContext>,
        metric: &str,
        tags: &HashMap<String, String>,
    ) -> CallHandle {
        let mut args = Map::new();
        args.insert(
            "m".to_string(),
            json!(if metric.is_empty() { "*" } else { metric }),
        );
        args.insert("tags".to_string(), json!(tags));
        self.call("meta", "tsmetas", args, Some(context.unwrap_or_default()))
    }

    /// Tag keys of a metric, excluding `keys` already known.
    pub fn tag_keys(
        &self,
        context: Option<QueryContext>,
        metric: &str,
        keys: &[&str],
    ) -> CallHandle {
        let mut args = Map::new();
        args.insert("m".to_string(), json!(metric));
        args.insert("keys".to_string(), json!(keys));
        self.call("meta", "tagkeys", args, Some(context.unwrap_or_default()))
    }

    /// Values of one tag key on a metric, narrowed by the pairs in `tags`.
    pub fn tag_values(
        &self,
        context: Option<QueryContext>,
        metric: &str,
        tag_key: &str,
        tags: &HashMap<String, String>,
    ) -> CallHandle {
        let mut args = Map::new();
        args.insert("m".to_string(), json!(metric));
        args.insert("k".to_string(), json!(tag_key));
        args.insert("tags".to_string(), json!(tags));
        self.call("meta", "tagvalues", args, Some(context.unwrap_or_default()))
    }

    /// Look up UIDs by category and name pattern.
    pub fn find_uids(
        &self,
        context: Option<QueryContext>,
        uid_type: UidType,
        name: &str,
    ) -> CallHandle {
        let mut args = Map::new();
        args.insert("type".to_string(), json!(uid_type.as_str()));
        args.insert("name".to_string(), json!(name));
        self.call("meta", "finduid", args, Some(context.unwrap_or_default()))
    }

    /// Time series metadata matching a pattern expression.
    pub fn resolve_ts_metas(
        &self,
        context: Option<QueryContext>,
        expression: &str,
    ) -> CallHandle {
        let mut args = Map::new();
        args.insert(
            "x".to_string(),
            json!(if expression.is_empty() { "*:*" } else { expression }),
        );
        self.call("meta", "tsMetaEval", args, Some(context.unwrap_or_default()))
    }

    /// Annotations on series matching an expression, optionally bounded to
    /// a `[start, end]` time range (epoch millis).
    pub fn annotations(
        &self,
        context: Option<QueryContext>,
        expression: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> CallHandle {
        let mut args = Map::new();
        args.insert("x".to_string(), json!(expression));
        let mut range = Vec::new();
        if let Some(start) = start {
            range.push(start);
        }
        if let Some(end) = end {
            range.push(end);
        }
        args.insert("r".to_string(), json!(range));
        self.call("meta", "annotations", args, Some(context.unwrap_or_default()))
    }

    /// Series overlap between two pattern expressions.
    pub fn overlap(
        &self,
        context: Option<QueryContext>,
        expression_one: &str,
        expression_two: &str,
    ) -> CallHandle {
        let mut args = Map::new();
        args.insert("x".to_string(), json!(expression_one));
        args.insert("y".to_string(), json!(expression_two));
        self.call("meta", "overlap", args, Some(context.unwrap_or_default()))
    }

    /// Time series metadata shaped for d3 tree rendering.
    pub fn d3_ts_metas(&self, context: Option<QueryContext>, expression: &str) -> CallHandle {
        let mut args = Map::new();
        args.insert(
            "x".to_string(),
            json!(if expression.is_empty() { "*:*" } else { expression }),
        );
        self.call("meta", "d3tsmeta", args, Some(context.unwrap_or_default()))
    }

    /// Enumerate the services exposed by the server. Context-free.
    pub fn services(&self) -> CallHandle {
        self.call("router", "services", Map::new(), None)
    }

    /// Subscribe to a topic expression. Resolves once the server
    /// acknowledges; events then flow through the returned handle.
    /// Concurrent subscriptions to the same expression share one
    /// server-side subscription.
    pub async fn subscribe(&self, expression: &str) -> Result<Subscription> {
        let (listener, events) = mpsc::unbounded_channel();
        let (ack, granted) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(ClientCmd::Subscribe {
                expression: expression.to_string(),
                listener,
                ack,
            })
            .map_err(|_| {
                TsdbLinkError::ConnectionClosed("client dispatcher is not running".to_string())
            })?;
        let grant = granted.await.map_err(|_| {
            TsdbLinkError::ConnectionClosed("client dispatcher is not running".to_string())
        })??;
        Ok(Subscription::new(
            expression.to_string(),
            grant.subid,
            grant.listener_id,
            events,
            self.inner.cmd_tx.clone(),
        ))
    }

    /// The server-announced session id, if one has arrived on the current
    /// connection.
    pub fn session(&self) -> Option<String> {
        self.inner.session_rx.borrow().clone()
    }

    /// Whether the transport is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Stop the dispatcher and fail everything still pending. Dropping the
    /// last clone has the same effect.
    pub fn shutdown(&self) {
        let _ = self.inner.cmd_tx.send(ClientCmd::Shutdown);
    }
}

/// Builder for [`TsdbLinkClient`].
#[derive(Debug, Default)]
pub struct TsdbLinkClientBuilder {
    url: Option<String>,
    timeouts: TsdbLinkTimeouts,
    options: ConnectionOptions,
    handlers: EventHandlers,
}

impl TsdbLinkClientBuilder {
    fn new() -> Self {
        Self {
            url: None,
            timeouts: TsdbLinkTimeouts::default(),
            options: ConnectionOptions::default(),
            handlers: EventHandlers::new(),
        }
    }

    /// Set the WebSocket endpoint. `http(s)` URLs are rewritten to
    /// `ws(s)`.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the timeout configuration.
    pub fn timeouts(mut self, timeouts: TsdbLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the reconnect/retry policy.
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the lifecycle event handlers.
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Connect to the configured WebSocket endpoint and start the
    /// dispatcher. Fails fast if the initial connection cannot be made;
    /// later drops are handled by the reconnect policy.
    pub async fn connect(self) -> Result<TsdbLinkClient> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| TsdbLinkError::ConfigurationError("url is required".to_string()))?;
        let endpoint = crate::transport::websocket::resolve_ws_url(&url)?;
        let ws = WsTransport::connect(&endpoint, self.timeouts.connection_timeout).await?;
        Ok(self.spawn(ws.into(), Some(endpoint)))
    }

    /// Start the dispatcher over an externally supplied transport.
    pub fn connect_transport(self, transport: Transport) -> TsdbLinkClient {
        self.spawn(transport, None)
    }

    fn spawn(self, transport: Transport, endpoint: Option<String>) -> TsdbLinkClient {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = watch::channel(None);
        let connected = Arc::new(AtomicBool::new(false));
        let rid_seq = Arc::new(AtomicU64::new(0));

        let dispatcher = Dispatcher {
            cmd_rx,
            table: CorrelationTable::new(self.timeouts.request_timeout),
            router: SubscriptionRouter::new(),
            deferred: VecDeque::new(),
            session_tx,
            handlers: self.handlers,
            timeouts: self.timeouts,
            options: self.options,
            connected: connected.clone(),
            rid_seq: rid_seq.clone(),
            endpoint,
            reconnect_attempts: 0,
            reconnect_exhausted: false,
        };
        tokio::spawn(dispatcher.run(Some(transport)));

        TsdbLinkClient {
            inner: Arc::new(ClientShared {
                cmd_tx,
                rid_seq,
                session_rx,
                connected,
            }),
        }
    }
}
