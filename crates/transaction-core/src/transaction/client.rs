//! Client side machines: ClientNonInvite, ClientInvite and ClientStale.
//!
//! ## RFC 3261 Context
//!
//! A client transaction owns the request from the moment the TU hands it
//! over. Over unreliable transports it retransmits (Timer A for INVITE,
//! Timers E1/E2 for everything else) until a response arrives, and gives up
//! after 64*T1 (Timers B and F) with a 408 synthesized for the TU. The ACK
//! for a non-2xx final response to an INVITE is generated here; the ACK for
//! a 2xx belongs to the TU.

use tracing::{debug, error, info};

use rvoip_stack_transport::message::{make_cancel, make_failure_ack, SipMessage};
use rvoip_stack_transport::Method;

use super::state::{Context, Event};
use super::{Disposition, Machine, State, TransactionState};
use crate::timer::TimerKind;

impl TransactionState {
    pub(super) fn process_client_non_invite(&mut self, event: Event, ctx: &mut Context<'_>) -> Disposition {
        let timers = ctx.config.timers;
        match event {
            Event::Sip(msg) if msg.is_request() && !msg.external => {
                debug!(tid = %self.id, "sending request, arming TimerF");
                self.save_originals(&msg);
                self.next_transmission = Some(msg);
                self.start_timer(TimerKind::F, timers.timer_f(), ctx);
                self.send_current_to_wire(ctx);
                Disposition::Continue
            }
            Event::Sip(msg) if msg.is_response() && msg.external => {
                let code = msg.status_code().unwrap_or_default();
                let active = matches!(self.state, State::Trying | State::Proceeding);
                if code < 200 {
                    if !active {
                        debug!(tid = %self.id, code, "ignoring provisional");
                        return Disposition::Continue;
                    }
                    if !self.is_reliable && self.state == State::Trying {
                        self.start_timer(TimerKind::E2, timers.t2, ctx);
                    }
                    self.state = State::Proceeding;
                    self.send_to_tu(msg, ctx);
                    Disposition::Continue
                } else if active {
                    self.send_to_tu(msg, ctx);
                    if self.is_reliable {
                        return Disposition::Terminate;
                    }
                    debug!(tid = %self.id, code, "final response, arming TimerK");
                    self.state = State::Completed;
                    self.start_timer(TimerKind::K, timers.timer_k(), ctx);
                    if let Some(dns) = self.dns_result.as_mut() {
                        dns.destroy();
                    }
                    self.next_transmission = None;
                    Disposition::Continue
                } else {
                    debug!(tid = %self.id, code, "absorbing retransmitted final response");
                    Disposition::Continue
                }
            }
            Event::Timer(timer) => match (timer.kind, self.state) {
                (TimerKind::E1, State::Trying) => {
                    let next = if timer.duration < timers.t2 {
                        (timer.duration * 2).min(timers.t2)
                    } else {
                        timer.duration
                    };
                    self.start_timer(TimerKind::E1, next, ctx);
                    self.resend_to_wire(ctx);
                    Disposition::Continue
                }
                (TimerKind::E2, State::Proceeding) => {
                    self.start_timer(TimerKind::E2, timers.t2, ctx);
                    self.resend_to_wire(ctx);
                    Disposition::Continue
                }
                (TimerKind::F, State::Trying | State::Proceeding) => {
                    info!(tid = %self.id, "TimerF fired, request timed out");
                    self.send_timeout_to_tu(ctx);
                    Disposition::Terminate
                }
                (TimerKind::K, _) => Disposition::Terminate,
                _ => Disposition::Continue,
            },
            Event::TransportFailure { reason, subcode } => self.process_transport_failure(reason, subcode, ctx),
            other => {
                debug!(tid = %self.id, event = ?other, "ignored by client non-INVITE transaction");
                Disposition::Continue
            }
        }
    }

    pub(super) fn process_client_invite(&mut self, event: Event, ctx: &mut Context<'_>) -> Disposition {
        let timers = ctx.config.timers;
        match event {
            Event::Sip(msg) if msg.is_request() && !msg.external => {
                if *msg.method() != Method::Invite || self.state != State::Calling || self.next_transmission.is_some() {
                    debug!(tid = %self.id, msg = %msg.brief(), "ignoring request from TU");
                    return Disposition::Continue;
                }
                debug!(tid = %self.id, "sending INVITE, arming TimerB");
                self.save_originals(&msg);
                self.next_transmission = Some(msg);
                self.start_timer(TimerKind::B, timers.timer_b(), ctx);
                self.send_current_to_wire(ctx);
                Disposition::Continue
            }
            Event::Sip(msg) if msg.is_response() && msg.external => self.client_invite_response(msg, ctx),
            Event::Timer(timer) => match (timer.kind, self.state) {
                (TimerKind::A, State::Calling) if !self.is_abandoned => {
                    self.start_timer(TimerKind::A, timer.duration * 2, ctx);
                    self.resend_to_wire(ctx);
                    Disposition::Continue
                }
                (TimerKind::B, State::Calling) => {
                    info!(tid = %self.id, "TimerB fired, INVITE timed out");
                    self.send_timeout_to_tu(ctx);
                    Disposition::Terminate
                }
                (TimerKind::D, _) => Disposition::Terminate,
                (TimerKind::CleanUp, State::Proceeding) => {
                    info!(tid = %self.id, "cancelled INVITE never completed");
                    self.send_timeout_to_tu(ctx);
                    Disposition::Terminate
                }
                _ => Disposition::Continue,
            },
            Event::TransportFailure { reason, subcode } => self.process_transport_failure(reason, subcode, ctx),
            Event::CancelInvite => {
                match self.state {
                    State::Proceeding => match self.next_transmission.as_ref().map(make_cancel) {
                        Some(cancel) => self.handle_internal_cancel(cancel, ctx),
                        None => debug!(tid = %self.id, "no INVITE to cancel"),
                    },
                    State::Calling => {
                        debug!(tid = %self.id, "cancel requested before any provisional, abandoning");
                        self.is_abandoned = true;
                    }
                    _ => debug!(tid = %self.id, state = %self.state, "too late to cancel"),
                }
                Disposition::Continue
            }
            other => {
                debug!(tid = %self.id, event = ?other, "ignored by client INVITE transaction");
                Disposition::Continue
            }
        }
    }

    fn client_invite_response(&mut self, msg: SipMessage, ctx: &mut Context<'_>) -> Disposition {
        let code = msg.status_code().unwrap_or_default();
        let active = matches!(self.state, State::Calling | State::Proceeding);

        if code < 200 {
            if !active {
                debug!(tid = %self.id, code, "ignoring provisional");
                return Disposition::Continue;
            }
            self.state = State::Proceeding;
            if self.is_abandoned {
                if let Some(cancel) = self.next_transmission.as_ref().map(make_cancel) {
                    self.handle_internal_cancel(cancel, ctx);
                }
                self.is_abandoned = false;
            }
            self.msg_to_retransmit = None;
            self.send_to_tu(msg, ctx);
            return Disposition::Continue;
        }

        if code < 300 {
            debug!(tid = %self.id, code, "2xx, keeping stale INVITE for retransmissions");
            self.send_to_tu(msg, ctx);
            self.machine = Machine::ClientStale;
            self.state = State::Completed;
            self.next_transmission = None;
            if let Some(dns) = self.dns_result.as_mut() {
                dns.destroy();
            }
            self.start_timer(TimerKind::StaleClient, ctx.config.timers.ts, ctx);
            return Disposition::Continue;
        }

        if self.is_reliable {
            if let Some(ack) = self.next_transmission.as_ref().map(|invite| make_failure_ack(invite, &msg)) {
                self.next_transmission = Some(ack);
                self.msg_to_retransmit = None;
                self.send_current_to_wire(ctx);
            }
            self.send_to_tu(msg, ctx);
            return Disposition::Terminate;
        }

        if active {
            debug!(tid = %self.id, code, "failure response, ACKing and arming TimerD");
            self.state = State::Completed;
            self.start_timer(TimerKind::D, ctx.config.timers.td, ctx);
            if let Some(ack) = self.next_transmission.as_ref().map(|invite| make_failure_ack(invite, &msg)) {
                self.next_transmission = Some(ack);
                self.msg_to_retransmit = None;
                self.send_current_to_wire(ctx);
            }
            self.send_to_tu(msg, ctx);
            if let Some(dns) = self.dns_result.as_mut() {
                dns.destroy();
            }
        } else if self.state == State::Completed {
            debug!(tid = %self.id, code, "retransmitted failure response, resending ACK");
            self.resend_to_wire(ctx);
        }
        Disposition::Continue
    }

    /// Send a CANCEL for this INVITE on its own client transaction.
    ///
    /// The CANCEL reuses the INVITE's branch and target so it follows the
    /// INVITE hop by hop. The INVITE arms TimerCleanUp in case the far end
    /// never answers with a final response.
    pub(crate) fn handle_internal_cancel(&mut self, mut cancel: SipMessage, ctx: &mut Context<'_>) {
        let cancel_id = self.id.cancel_id();
        if ctx.clients.contains(&cancel_id) {
            debug!(tid = %self.id, "CANCEL already in progress");
            return;
        }

        if let Some(branch) = self.next_transmission.as_ref().and_then(|invite| invite.top_via()).and_then(|via| via.branch.clone()) {
            if let Some(via) = cancel.top_via_mut() {
                via.branch = Some(branch);
            }
        }
        cancel.external = false;
        if cancel.tu.is_none() {
            cancel.tu = self.tu;
        }

        let mut state = TransactionState::new(cancel_id, Machine::ClientNonInvite, State::Trying, Method::Cancel, cancel.tu);
        state.response_target = self.response_target.clone();
        state.target = self.target.clone();
        if let Some(target) = &self.target {
            state.process_reliability(target.transport_type(), ctx);
        }

        debug!(tid = %self.id, "sending CANCEL, arming TimerCleanUp");
        match state.process(Event::Sip(cancel), ctx) {
            Disposition::Continue => {
                if let Err(rejected) = ctx.clients.add(state) {
                    error!(tid = %rejected.id(), "CANCEL transaction already live, dropping the newer one");
                }
            }
            Disposition::Terminate => ctx.tus.notify_transaction_terminated(state.tu(), state.id(), true),
        }
        self.start_timer(TimerKind::CleanUp, ctx.config.timers.timer_cleanup(), ctx);
    }

    /// A client INVITE after its 2xx: passes retransmitted 2xx responses
    /// to the TU until TimerStaleClient fires
    pub(super) fn process_client_stale(&mut self, event: Event, ctx: &mut Context<'_>) -> Disposition {
        match event {
            Event::Timer(timer) if timer.kind == TimerKind::StaleClient => Disposition::Terminate,
            Event::TransportFailure { reason, subcode } => self.process_transport_failure(reason, subcode, ctx),
            Event::Sip(msg)
                if msg.external && msg.is_response() && msg.status_code().is_some_and(|c| (200..300).contains(&c)) =>
            {
                self.send_to_tu(msg, ctx);
                Disposition::Continue
            }
            Event::Sip(msg) => {
                info!(tid = %self.id, msg = %msg.brief(), "dropping message for stale client INVITE");
                Disposition::Continue
            }
            _ => Disposition::Continue,
        }
    }
}
