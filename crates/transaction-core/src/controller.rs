//! # Transaction Controller
//!
//! The controller owns every transaction. It is sans-io: the caller feeds
//! it [`TransactionMessage`]s and expired timers together with the current
//! time, and it reacts by updating the transaction maps, arming timers,
//! handing bytes to transports and messages to TUs. [`crate::SipStack`]
//! drives it from a tokio task; tests drive it directly with a manual
//! clock.
//!
//! ## Dispatch
//!
//! For a SIP message the controller computes the transaction id (a CANCEL
//! gets its own id next to the INVITE it cancels) and looks in the client
//! map for requests from the TU and responses from the wire, in the server
//! map otherwise. A message for an unknown id creates a transaction, is
//! answered statelessly (400, 481, 500, 503) or, for stray responses, is
//! dropped or passed up by a stateless transaction.
//!
//! ## Overload
//!
//! New requests from the wire are refused with a 503 and a random
//! Retry-After of 32 to 63 seconds while the controller queue or the
//! selected TU's queue is rejecting new work. While the controller queue is
//! rejecting non-essential work, retransmission timers are pushed back
//! without retransmitting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, trace};

use rvoip_stack_transport::message::{make_100, make_response, SipMessage, TuId};
use rvoip_stack_transport::{DnsResolver, Method, TransportType, Tuple};

use crate::config::StackConfig;
use crate::fifo::{FifoReceiver, FifoSender, RejectionBehavior};
use crate::message::TransactionMessage;
use crate::selector::TransportSelector;
use crate::timer::{TimerKind, TimerMessage, TimerQueue};
use crate::transaction::{Context, Disposition, Event, Machine, State, TransactionId, TransactionMap, TransactionState};
use crate::tu::{TuMessage, TuRegistration, TuSelector};

/// Owner and dispatcher of all transactions
#[derive(Debug)]
pub struct TransactionController {
    config: StackConfig,
    clients: TransactionMap,
    servers: TransactionMap,
    timers: TimerQueue,
    selector: TransportSelector,
    tus: TuSelector,
    /// Our own queue, consulted for its load
    fifo: FifoSender<TransactionMessage>,
    stateless_counter: u64,
    shutdown: bool,
}

impl TransactionController {
    /// Create a controller.
    ///
    /// `fifo` is the queue the controller is fed from; transports, the
    /// resolver and the selector post into it. TU output for no registered
    /// TU goes to `fallback`.
    pub fn new(
        config: StackConfig,
        resolver: Arc<dyn DnsResolver>,
        fifo: FifoSender<TransactionMessage>,
        fallback: FifoSender<TuMessage>,
    ) -> Self {
        Self {
            selector: TransportSelector::new(resolver, fifo.clone()),
            tus: TuSelector::new(fallback),
            config,
            clients: TransactionMap::new(),
            servers: TransactionMap::new(),
            timers: TimerQueue::new(),
            fifo,
            stateless_counter: 0,
            shutdown: false,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn client_transaction(&self, id: &TransactionId) -> Option<&TransactionState> {
        self.clients.find(id)
    }

    pub fn server_transaction(&self, id: &TransactionId) -> Option<&TransactionState> {
        self.servers.find(id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn selector(&self) -> &TransportSelector {
        &self.selector
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Register a TU with a queue of its own
    pub fn register_transaction_user(&mut self, id: TuId, registration: TuRegistration) -> FifoReceiver<TuMessage> {
        self.tus.register_new(id, registration)
    }

    /// Process one queued message
    pub fn process(&mut self, msg: TransactionMessage, now: Instant) {
        trace!(msg = %msg.brief(), "controller processing");
        if self.shutdown {
            debug!(msg = %msg.brief(), "stack shut down, dropping");
            return;
        }
        match msg {
            TransactionMessage::Sip(sip) => self.process_sip(sip, now),
            TransactionMessage::Timer(timer) => self.process_timer(timer, now),
            TransactionMessage::TransportFailure(failure) => {
                let id = TransactionId::from(failure.transaction_id);
                let event = Event::TransportFailure {
                    reason: failure.reason,
                    subcode: failure.subcode,
                };
                self.dispatch_to(&id, failure.is_client, event, now);
            }
            TransactionMessage::DnsResult {
                transaction_id,
                is_client,
                outcome,
            } => self.dispatch_to(&transaction_id, is_client, Event::Dns(outcome), now),
            TransactionMessage::ConnectionTerminated(peer) => {
                debug!(tuple = %peer, "connection terminated");
                self.tus.notify_connection_terminated(&peer);
            }
            TransactionMessage::AbandonServerTransaction(id) => self.dispatch_to(&id, false, Event::Abandon, now),
            TransactionMessage::CancelClientInviteTransaction(id) => {
                self.dispatch_to(&id, true, Event::CancelInvite, now)
            }
            TransactionMessage::AddTransport(transport) => self.selector.add_transport(transport),
            TransactionMessage::RemoveTransport(key) => {
                self.selector.remove_transport(key);
            }
            TransactionMessage::CloseConnection(peer) => self.selector.close_connection(&peer),
            TransactionMessage::RegisterTu {
                id,
                registration,
                sender,
            } => self.tus.register(id, registration, sender),
            TransactionMessage::UnregisterTu(id) => {
                if !self.tus.unregister(id) {
                    debug!(tu = %id, "unregistering unknown TU");
                }
            }
            TransactionMessage::Shutdown => self.shutdown(),
        }
    }

    /// Fire every timer due at `now`. Returns how many fired.
    pub fn process_expired_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(timer) = self.timers.pop_expired(now) {
            self.process_timer(timer, now);
            fired += 1;
        }
        fired
    }

    /// Stop all transports and drop every transaction
    pub fn shutdown(&mut self) {
        info!(
            clients = self.clients.len(),
            servers = self.servers.len(),
            "shutting down transaction controller"
        );
        self.selector.shutdown_all();
        self.clients = TransactionMap::new();
        self.servers = TransactionMap::new();
        self.timers = TimerQueue::new();
        self.shutdown = true;
    }

    fn map_for(&mut self, is_client: bool) -> &mut TransactionMap {
        if is_client {
            &mut self.clients
        } else {
            &mut self.servers
        }
    }

    fn dispatch_to(&mut self, id: &TransactionId, is_client: bool, event: Event, now: Instant) {
        match self.map_for(is_client).take(id) {
            Some(state) => self.run(state, event, now),
            None => debug!(tid = %id, is_client, event = ?event, "no transaction, ignoring"),
        }
    }

    /// Let a transaction handle an event, then put it back or drop it
    fn run(&mut self, mut state: TransactionState, event: Event, now: Instant) {
        let disposition = {
            let mut ctx = Context {
                config: &self.config,
                now,
                timers: &mut self.timers,
                selector: &self.selector,
                tus: &self.tus,
                clients: &mut self.clients,
            };
            state.process(event, &mut ctx)
        };
        self.finish(state, disposition);
    }

    /// Put a transaction into the map of its direction
    fn store(&mut self, state: TransactionState) {
        if let Err(rejected) = self.map_for(state.machine().is_client()).add(state) {
            error!(tid = %rejected.id(), machine = %rejected.machine(), "transaction id already live, dropping the newer one");
        }
    }

    fn finish(&mut self, state: TransactionState, disposition: Disposition) {
        match disposition {
            Disposition::Continue => {
                self.store(state);
            }
            Disposition::Terminate => {
                debug!(tid = %state.id(), machine = %state.machine(), "transaction terminated");
                if state.machine() != Machine::Stateless {
                    self.tus
                        .notify_transaction_terminated(state.tu(), state.id(), state.machine().is_client());
                }
            }
        }
    }

    fn process_timer(&mut self, timer: TimerMessage, now: Instant) {
        let is_client = timer.is_client();
        let Some(state) = self.map_for(is_client).take(&timer.transaction_id) else {
            trace!(timer = %timer, "timer for finished transaction");
            return;
        };

        if timer.kind.is_retransmission() && self.fifo.rejection_behavior() == RejectionBehavior::RejectingNonEssential {
            let t2 = self.config.timers.t2;
            let delay = match timer.kind {
                TimerKind::A => timer.duration * 2,
                TimerKind::E2 => t2,
                _ => (timer.duration * 2).min(t2),
            };
            debug!(timer = %timer, ms = delay.as_millis() as u64, "overloaded, postponing retransmission");
            self.timers.add(timer.kind, timer.transaction_id, delay, now);
            self.store(state);
            return;
        }

        self.run(state, Event::Timer(timer), now);
    }

    fn process_sip(&mut self, mut msg: SipMessage, now: Instant) {
        if msg.external && msg.is_request() && *msg.method() != Method::Ack {
            if let Some(reason) = msg.invalid_reason.clone() {
                info!(msg = %msg.brief(), reason = %reason, "rejecting invalid request");
                let phrase = format!("Bad Request ({})", reason);
                self.send_stateless_response(&msg, 400, Some(&phrase), None);
                return;
            }
        }

        let Some(id) = TransactionId::of(&msg) else {
            debug!(msg = %msg.brief(), "message without Via, dropping");
            return;
        };

        let is_client = msg.is_request() != msg.external;
        let Some(mut state) = self.map_for(is_client).take(&id) else {
            self.process_new(msg, id, now);
            return;
        };

        let method = msg.method().clone();
        // ACK for a 2xx, or an ACK nothing is waiting for, runs statelessly
        if method == Method::Ack && msg.is_request() && !state.ack_is_valid() {
            self.store(state);
            self.process_new(msg, id, now);
            return;
        }
        if *state.method() != method && !(*state.method() == Method::Invite && method == Method::Ack) {
            info!(tid = %id, got = %method, want = %state.method(), "method mismatch, dropping");
            self.store(state);
            return;
        }
        if msg.external && msg.is_request() && method != Method::Ack && state.is_reliable() {
            debug!(tid = %id, "retransmission over reliable transport, dropping");
            self.store(state);
            return;
        }
        if msg.external && msg.is_response() {
            state.fix_response(&mut msg, &self.config);
        }

        self.run(state, Event::Sip(msg), now);
    }

    fn process_new(&mut self, msg: SipMessage, id: TransactionId, now: Instant) {
        match (msg.is_request(), msg.external) {
            (true, true) => self.new_server_request(msg, id, now),
            (true, false) => self.new_client_request(msg, id, now),
            (false, true) => self.stray_response(msg, now),
            (false, false) => self.stateless_tu_response(msg, now),
        }
    }

    fn new_server_request(&mut self, mut msg: SipMessage, id: TransactionId, now: Instant) {
        let method = msg.method().clone();
        let tu = self.tus.select_transaction_user(&msg);

        if method == Method::Ack {
            if self.tus.rejection_behavior(tu) == RejectionBehavior::RejectingNonEssential {
                info!(msg = %msg.brief(), "TU overloaded, dropping ACK");
                return;
            }
            debug!(msg = %msg.brief(), "ACK without transaction, passing to TU");
            msg.tu = tu;
            self.tus.add(tu, TuMessage::Sip(msg));
            return;
        }

        if self.tus.have_transaction_users() && tu.is_none() {
            info!(msg = %msg.brief(), "no TU for request");
            self.send_stateless_response(&msg, 500, None, None);
            return;
        }
        if self.fifo.rejection_behavior() >= RejectionBehavior::RejectingNewWork || (tu.is_some() && self.tus.is_overloaded(tu)) {
            let retry_after = rand::thread_rng().gen_range(32..64);
            info!(msg = %msg.brief(), retry_after, "overloaded, rejecting new request");
            self.send_stateless_response(&msg, 503, None, Some(retry_after));
            return;
        }
        msg.tu = tu;

        let Some(response_target) = response_target_for(&msg) else {
            debug!(msg = %msg.brief(), "request without source, dropping");
            return;
        };
        let timers = self.config.timers;

        match method {
            Method::Invite => {
                let mut state = TransactionState::new(id, Machine::ServerInvite, State::Trying, Method::Invite, tu);
                state.set_next_transmission(make_100(&msg));
                let transport = response_target.transport_type();
                state.set_response_target(response_target);
                self.with_context(now, |ctx| {
                    state.process_reliability(transport, ctx);
                    if timers.t100.is_zero() {
                        state.send_current_to_wire(ctx);
                        state.set_state(State::Proceeding);
                    } else {
                        state.start_timer(TimerKind::Trying, timers.t100, ctx);
                    }
                    state.send_to_tu(msg, ctx);
                });
                self.store(state);
            }
            Method::Cancel => {
                let invite_id = msg.transaction_id().map(TransactionId::new);
                let invite = invite_id.as_ref().and_then(|i| self.servers.find(i)).filter(|s| *s.method() == Method::Invite);
                let Some(invite) = invite else {
                    debug!(tid = %id, "CANCEL matches no INVITE");
                    self.send_stateless_response(&msg, 481, None, None);
                    return;
                };
                let invite_target = invite.response_target().cloned();
                let invite_tu = invite.tu().or(tu);

                let mut state = TransactionState::new(id, Machine::ServerNonInvite, State::Trying, Method::Cancel, invite_tu);
                let target = invite_target.unwrap_or(response_target);
                let transport = target.transport_type();
                state.set_response_target(target);
                state.set_next_transmission(make_100(&msg));
                msg.tu = invite_tu;
                self.with_context(now, |ctx| {
                    state.process_reliability(transport, ctx);
                    state.start_timer(TimerKind::Trying, timers.nit_100(), ctx);
                    state.send_to_tu(msg, ctx);
                });
                self.store(state);
            }
            _ => {
                let mut state = TransactionState::new(id, Machine::ServerNonInvite, State::Trying, method, tu);
                state.set_next_transmission(make_100(&msg));
                let transport = response_target.transport_type();
                state.set_response_target(response_target);
                self.with_context(now, |ctx| {
                    state.process_reliability(transport, ctx);
                    state.start_timer(TimerKind::Trying, timers.nit_100(), ctx);
                    state.send_to_tu(msg, ctx);
                });
                self.store(state);
            }
        }
    }

    fn new_client_request(&mut self, msg: SipMessage, id: TransactionId, now: Instant) {
        let method = msg.method().clone();
        match method {
            Method::Invite => {
                let state = TransactionState::new(id, Machine::ClientInvite, State::Calling, Method::Invite, msg.tu);
                self.run(state, Event::Sip(msg), now);
            }
            Method::Ack => {
                let id = if self.clients.contains(&id) { self.next_stateless_id() } else { id };
                let state = TransactionState::new(id, Machine::Stateless, State::Calling, Method::Ack, msg.tu);
                let ts = self.config.timers.ts;
                self.with_context(now, |ctx| state.start_timer(TimerKind::Stateless, ts, ctx));
                self.run(state, Event::Sip(msg), now);
            }
            Method::Cancel => self.new_client_cancel(msg, now),
            _ => {
                let state = TransactionState::new(id, Machine::ClientNonInvite, State::Trying, method, msg.tu);
                self.run(state, Event::Sip(msg), now);
            }
        }
    }

    /// A CANCEL from the TU without a CANCEL transaction yet
    fn new_client_cancel(&mut self, cancel: SipMessage, now: Instant) {
        let invite_id = cancel.transaction_id().map(TransactionId::new);
        let is_invite = invite_id
            .as_ref()
            .and_then(|id| self.clients.find(id))
            .is_some_and(|s| *s.method() == Method::Invite);
        let invite = invite_id.as_ref().filter(|_| is_invite).and_then(|id| self.clients.take(id));
        let Some(mut invite) = invite else {
            debug!(msg = %cancel.brief(), "CANCEL from TU matches no INVITE, answering 481");
            self.tus.add(cancel.tu, TuMessage::Sip(make_response(&cancel, 481, None)));
            return;
        };

        match invite.state() {
            State::Calling if invite.machine() == Machine::ClientInvite => {
                debug!(tid = %invite.id(), "CANCEL before any provisional, terminating INVITE locally");
                self.tus.add(cancel.tu, TuMessage::Sip(make_response(&cancel, 200, None)));
                if let Some(request) = invite.next_transmission() {
                    let terminated = make_response(request, 487, None);
                    self.tus.add(invite.tu(), TuMessage::Sip(terminated));
                }
                self.finish(invite, Disposition::Terminate);
            }
            State::Completed => {
                debug!(tid = %invite.id(), "CANCEL after final response, answering 200");
                self.tus.add(cancel.tu, TuMessage::Sip(make_response(&cancel, 200, None)));
                self.store(invite);
            }
            _ => {
                self.with_context(now, |ctx| invite.handle_internal_cancel(cancel, ctx));
                self.store(invite);
            }
        }
    }

    /// A response from the wire that matches no client transaction
    fn stray_response(&mut self, msg: SipMessage, now: Instant) {
        if self.config.discard_stray_responses {
            debug!(msg = %msg.brief(), "discarding stray response");
            return;
        }
        let id = self.next_stateless_id();
        debug!(tid = %id, msg = %msg.brief(), "passing stray response to TU");
        let state = TransactionState::new(id, Machine::Stateless, State::Calling, msg.method().clone(), msg.tu);
        let ts = self.config.timers.ts;
        self.with_context(now, |ctx| state.start_timer(TimerKind::Stateless, ts, ctx));
        self.run(state, Event::Sip(msg), now);
    }

    /// A response from the TU that matches no server transaction is sent
    /// statelessly along the Via
    fn stateless_tu_response(&mut self, msg: SipMessage, now: Instant) {
        let Some(target) = msg.top_via().and_then(via_target) else {
            info!(msg = %msg.brief(), "response from TU without usable Via, dropping");
            return;
        };
        let id = self.next_stateless_id();
        debug!(tid = %id, tuple = %target, "sending stateless response");
        let mut state = TransactionState::new(id, Machine::Stateless, State::Calling, msg.method().clone(), msg.tu);
        state.set_target(target);
        let ts = self.config.timers.ts;
        self.with_context(now, |ctx| state.start_timer(TimerKind::Stateless, ts, ctx));
        self.run(state, Event::Sip(msg), now);
    }

    fn next_stateless_id(&mut self) -> TransactionId {
        self.stateless_counter += 1;
        TransactionId::new(format!("stateless-{}", self.stateless_counter))
    }

    /// Answer a request without creating a transaction
    fn send_stateless_response(&self, request: &SipMessage, code: u16, reason: Option<&str>, retry_after: Option<u32>) {
        let Some(mut target) = response_target_for(request) else {
            debug!(msg = %request.brief(), "no source to answer, dropping");
            return;
        };
        let mut response = make_response(request, code, reason);
        response.retry_after = retry_after;
        let id = TransactionId::of(request).unwrap_or_else(|| TransactionId::new("stateless"));
        let _ = self.selector.transmit(&mut response, &mut target, &id, false);
    }

    fn with_context<R>(&mut self, now: Instant, f: impl FnOnce(&mut Context<'_>) -> R) -> R {
        let mut ctx = Context {
            config: &self.config,
            now,
            timers: &mut self.timers,
            selector: &self.selector,
            tus: &self.tus,
            clients: &mut self.clients,
        };
        f(&mut ctx)
    }
}

/// Where responses to a wire request go: the source address, with the
/// source port when the client asked for rport or the transport is
/// connection oriented, otherwise the sent-by port of the top Via.
pub(crate) fn response_target_for(request: &SipMessage) -> Option<Tuple> {
    let mut target = request.source.clone()?;
    let via = request.top_via();
    let use_source_port = target.transport_type().is_connection_oriented() || via.is_some_and(|v| v.rport);
    if !use_source_port {
        let port = via
            .and_then(|v| v.port)
            .unwrap_or_else(|| target.transport_type().default_port());
        target.set_port(port);
    }
    Some(target)
}

/// Tuple for a Via with a numeric received or sent-by address
fn via_target(via: &rvoip_stack_transport::message::Via) -> Option<Tuple> {
    let host = via.received.as_deref().unwrap_or(&via.host);
    let ip = host.trim_start_matches('[').trim_end_matches(']').parse().ok()?;
    let transport = match via.transport {
        TransportType::Unknown => TransportType::Udp,
        other => other,
    };
    Some(Tuple::from_ip(ip, via.port.unwrap_or_else(|| transport.default_port()), transport))
}

/// Time left before `deadline`, for runners sleeping between events
pub fn time_until(deadline: Option<Instant>, now: Instant) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(now))
}
