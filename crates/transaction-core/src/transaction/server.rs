//! Server side machines: ServerNonInvite, ServerInvite and ServerStale.
//!
//! ## RFC 3261 Context
//!
//! A server transaction absorbs request retransmissions by resending the
//! last response, and over unreliable transports retransmits a final
//! response to an INVITE (Timer G) until the ACK arrives or Timer H gives
//! up. Non-INVITE server transactions send a 100 Trying once the client has
//! been waiting for as long as it takes Timer E to reach T2 (RFC 4320).

use tracing::{debug, info, warn};

use rvoip_stack_transport::message::{make_100, make_response};
use rvoip_stack_transport::Method;

use super::state::{Context, Event};
use super::{Disposition, Machine, State, TransactionState};
use crate::timer::TimerKind;

impl TransactionState {
    pub(super) fn process_server_non_invite(&mut self, event: Event, ctx: &mut Context<'_>) -> Disposition {
        let timers = ctx.config.timers;
        match event {
            Event::Sip(msg) if msg.is_request() && msg.external => {
                match self.state {
                    State::Trying => debug!(tid = %self.id, "request retransmission while Trying, ignoring"),
                    State::Proceeding | State::Completed => {
                        if self.is_abandoned {
                            debug!(tid = %self.id, "abandoned by TU, answering retransmission with 500");
                            self.next_transmission = Some(make_response(&msg, 500, None));
                            self.msg_to_retransmit = None;
                            self.is_abandoned = false;
                        } else if self.next_transmission.is_none() && self.msg_to_retransmit.is_none() {
                            self.next_transmission = Some(make_100(&msg));
                        }
                        self.resend_to_wire(ctx);
                    }
                    _ => {}
                }
                Disposition::Continue
            }
            Event::Sip(msg) if msg.is_response() && !msg.external => {
                let code = msg.status_code().unwrap_or_default();
                let active = matches!(self.state, State::Trying | State::Proceeding);
                if !active {
                    debug!(tid = %self.id, code, state = %self.state, "ignoring response from TU");
                    return Disposition::Continue;
                }
                self.next_transmission = Some(msg);
                self.msg_to_retransmit = None;
                if code < 200 {
                    self.state = State::Proceeding;
                    self.send_current_to_wire(ctx);
                    return Disposition::Continue;
                }
                self.send_current_to_wire(ctx);
                if self.is_reliable {
                    return Disposition::Terminate;
                }
                debug!(tid = %self.id, code, "final response sent, arming TimerJ");
                self.state = State::Completed;
                self.start_timer(TimerKind::J, timers.timer_j(), ctx);
                Disposition::Continue
            }
            Event::Timer(timer) => match (timer.kind, self.state) {
                (TimerKind::J, State::Completed) => Disposition::Terminate,
                (TimerKind::Trying, State::Trying) => {
                    debug!(tid = %self.id, "TimerTrying fired, sending 100");
                    self.send_current_to_wire(ctx);
                    self.state = State::Proceeding;
                    Disposition::Continue
                }
                _ => Disposition::Continue,
            },
            Event::TransportFailure { reason, .. } => {
                info!(tid = %self.id, reason = %reason, "transport failure on server transaction");
                Disposition::Terminate
            }
            Event::Abandon => {
                if !matches!(self.state, State::Trying | State::Proceeding) {
                    return Disposition::Continue;
                }
                self.is_abandoned = true;
                if self.is_reliable {
                    return Disposition::Terminate;
                }
                self.state = State::Completed;
                self.start_timer(TimerKind::J, timers.timer_j(), ctx);
                Disposition::Continue
            }
            other => {
                debug!(tid = %self.id, event = ?other, "ignored by server non-INVITE transaction");
                Disposition::Continue
            }
        }
    }

    pub(super) fn process_server_invite(&mut self, event: Event, ctx: &mut Context<'_>) -> Disposition {
        let timers = ctx.config.timers;
        match event {
            Event::Sip(msg) if msg.is_request() && msg.external && *msg.method() == Method::Invite => {
                if self.is_abandoned {
                    debug!(tid = %self.id, "abandoned by TU, answering retransmission with 500");
                    self.is_abandoned = false;
                    self.next_transmission = Some(make_response(&msg, 500, None));
                    self.msg_to_retransmit = None;
                    self.enter_completed(ctx);
                    self.send_current_to_wire(ctx);
                } else if matches!(self.state, State::Proceeding | State::Completed) {
                    if self.next_transmission.is_none() && self.msg_to_retransmit.is_none() {
                        self.next_transmission = Some(make_100(&msg));
                    }
                    debug!(tid = %self.id, "INVITE retransmission, resending last response");
                    self.resend_to_wire(ctx);
                }
                Disposition::Continue
            }
            Event::Sip(msg) if msg.is_request() && msg.external && *msg.method() == Method::Ack => match self.state {
                State::Completed if self.is_reliable => Disposition::Terminate,
                State::Completed => {
                    debug!(tid = %self.id, "ACK received, arming TimerI");
                    self.state = State::Confirmed;
                    self.start_timer(TimerKind::I, timers.timer_i(), ctx);
                    self.next_transmission = None;
                    self.msg_to_retransmit = None;
                    Disposition::Continue
                }
                _ => {
                    debug!(tid = %self.id, state = %self.state, "absorbing ACK");
                    Disposition::Continue
                }
            },
            Event::Sip(msg) if msg.is_response() && !msg.external => {
                let code = msg.status_code().unwrap_or_default();
                if !matches!(self.state, State::Trying | State::Proceeding) {
                    debug!(tid = %self.id, code, state = %self.state, "ignoring response from TU");
                    return Disposition::Continue;
                }
                self.next_transmission = Some(msg);
                self.msg_to_retransmit = None;
                if code < 200 {
                    self.state = State::Proceeding;
                    self.send_current_to_wire(ctx);
                } else if code < 300 {
                    debug!(tid = %self.id, code, "2xx sent, keeping stale INVITE");
                    self.send_current_to_wire(ctx);
                    self.machine = Machine::ServerStale;
                    self.start_timer(TimerKind::StaleServer, timers.ts, ctx);
                } else {
                    debug!(tid = %self.id, code, "failure response sent, waiting for ACK");
                    self.enter_completed(ctx);
                    self.send_current_to_wire(ctx);
                }
                Disposition::Continue
            }
            Event::Timer(timer) => match (timer.kind, self.state) {
                (TimerKind::G, State::Completed) => {
                    self.resend_to_wire(ctx);
                    self.start_timer(TimerKind::G, (timer.duration * 2).min(timers.t2), ctx);
                    Disposition::Continue
                }
                (TimerKind::H, State::Completed) => {
                    warn!(tid = %self.id, "TimerH fired, ACK never received");
                    Disposition::Terminate
                }
                (TimerKind::I, State::Confirmed) => Disposition::Terminate,
                (TimerKind::Trying, State::Trying) => {
                    debug!(tid = %self.id, "TimerTrying fired, sending 100");
                    self.send_current_to_wire(ctx);
                    self.state = State::Proceeding;
                    Disposition::Continue
                }
                _ => Disposition::Continue,
            },
            Event::TransportFailure { reason, .. } => {
                info!(tid = %self.id, reason = %reason, "transport failure on server INVITE transaction");
                Disposition::Terminate
            }
            Event::Abandon => {
                if !matches!(self.state, State::Trying | State::Proceeding) || self.is_abandoned {
                    return Disposition::Continue;
                }
                match self.next_transmission.as_ref() {
                    Some(provisional) => {
                        debug!(tid = %self.id, "abandoned by TU, replacing provisional with 500");
                        let error = make_response(provisional, 500, Some("Server Error"));
                        self.next_transmission = Some(error);
                        self.msg_to_retransmit = None;
                        self.enter_completed(ctx);
                        self.send_current_to_wire(ctx);
                        Disposition::Continue
                    }
                    None if self.is_reliable => Disposition::Terminate,
                    None => {
                        self.is_abandoned = true;
                        Disposition::Continue
                    }
                }
            }
            other => {
                debug!(tid = %self.id, event = ?other, "ignored by server INVITE transaction");
                Disposition::Continue
            }
        }
    }

    /// A final non-2xx response is about to go out: wait for the ACK
    fn enter_completed(&mut self, ctx: &mut Context<'_>) {
        let timers = ctx.config.timers;
        self.ack_is_valid = true;
        self.state = State::Completed;
        self.start_timer(TimerKind::H, timers.timer_h(), ctx);
        if !self.is_reliable {
            self.start_timer(TimerKind::G, timers.t1, ctx);
        }
    }

    /// A server INVITE after its 2xx: matches late INVITE retransmissions
    /// and carries 2xx retransmissions from the TU to the original source.
    /// ACKs for the 2xx never get here; they run statelessly.
    pub(super) fn process_server_stale(&mut self, event: Event, ctx: &mut Context<'_>) -> Disposition {
        match event {
            Event::Timer(timer) if timer.kind == TimerKind::StaleServer => Disposition::Terminate,
            Event::TransportFailure { reason, subcode } => self.process_transport_failure(reason, subcode, ctx),
            Event::Sip(msg) if msg.external && msg.is_request() && *msg.method() == Method::Invite => {
                debug!(tid = %self.id, "dropping INVITE retransmission after 2xx");
                Disposition::Continue
            }
            Event::Sip(msg) if !msg.external && msg.is_response() => {
                self.next_transmission = Some(msg);
                self.msg_to_retransmit = None;
                self.send_current_to_wire(ctx);
                Disposition::Continue
            }
            Event::Sip(msg) => {
                info!(tid = %self.id, msg = %msg.brief(), "dropping message for stale server INVITE");
                Disposition::Continue
            }
            _ => Disposition::Continue,
        }
    }
}
