use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use rvoip_stack_transport::message::{make_response, NameAddr, SipMessage, TuId, Via};
use rvoip_stack_transport::dns::DnsOutcome;
use rvoip_stack_transport::{DnsResult, FailureReason, Method, SendData, TransportType, Tuple};

use super::{Disposition, Machine, State, TransactionId, TransactionMap};
use crate::config::StackConfig;
use crate::fifo::RejectionBehavior;
use crate::selector::TransportSelector;
use crate::timer::{TimerKind, TimerMessage, TimerQueue};
use crate::tu::{TuMessage, TuSelector};

/// What a transaction is asked to handle
#[derive(Debug)]
pub(crate) enum Event {
    /// A message from the wire or from the TU
    Sip(SipMessage),
    Timer(TimerMessage),
    TransportFailure { reason: FailureReason, subcode: i32 },
    Dns(DnsOutcome),
    /// The TU will not answer this server transaction
    Abandon,
    /// The TU wants this client INVITE cancelled
    CancelInvite,
}

/// Everything a transaction may touch while it handles an event
pub(crate) struct Context<'a> {
    pub config: &'a StackConfig,
    pub now: Instant,
    pub timers: &'a mut TimerQueue,
    pub selector: &'a TransportSelector,
    pub tus: &'a TuSelector,
    /// Client transactions, for CANCELs generated by the stack
    pub clients: &'a mut TransactionMap,
}

/// One RFC 3261 transaction
#[derive(Debug)]
pub struct TransactionState {
    pub(super) id: TransactionId,
    pub(super) machine: Machine,
    pub(super) state: State,
    pub(super) method: Method,
    pub(super) is_abandoned: bool,
    pub(super) is_reliable: bool,
    /// Message to send next: the request of a client transaction, the
    /// latest response of a server transaction
    pub(super) next_transmission: Option<SipMessage>,
    /// Encoded form of the last send, kept for retransmission over
    /// unreliable transports
    pub(super) msg_to_retransmit: Option<SendData>,
    pub(super) dns_result: Option<DnsResult>,
    pub(super) pending_dns: bool,
    /// Where server transactions send responses
    pub(super) response_target: Option<Tuple>,
    /// Where client transactions send requests
    pub(super) target: Option<Tuple>,
    pub(super) tu: Option<TuId>,
    pub(super) original_contact: Option<NameAddr>,
    pub(super) original_via: Option<Via>,
    pub(super) ack_is_valid: bool,
    pub(super) failure_reason: FailureReason,
    pub(super) failure_subcode: i32,
}

impl TransactionState {
    pub(crate) fn new(id: TransactionId, machine: Machine, state: State, method: Method, tu: Option<TuId>) -> Self {
        trace!(tid = %id, machine = %machine, state = %state, "creating transaction");
        Self {
            id,
            machine,
            state,
            method,
            is_abandoned: false,
            is_reliable: true,
            next_transmission: None,
            msg_to_retransmit: None,
            dns_result: None,
            pending_dns: false,
            response_target: None,
            target: None,
            tu,
            original_contact: None,
            original_via: None,
            ack_is_valid: false,
            failure_reason: FailureReason::None,
            failure_subcode: 0,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn tu(&self) -> Option<TuId> {
        self.tu
    }

    pub fn is_reliable(&self) -> bool {
        self.is_reliable
    }

    pub fn is_abandoned(&self) -> bool {
        self.is_abandoned
    }

    pub fn ack_is_valid(&self) -> bool {
        self.ack_is_valid
    }

    pub fn is_waiting_for_dns(&self) -> bool {
        self.pending_dns
    }

    /// The tuple requests are sent to
    pub fn target(&self) -> Option<&Tuple> {
        self.target.as_ref()
    }

    /// The tuple responses are sent to
    pub fn response_target(&self) -> Option<&Tuple> {
        self.response_target.as_ref()
    }

    pub fn failure_reason(&self) -> FailureReason {
        self.failure_reason
    }

    pub(crate) fn set_response_target(&mut self, target: Tuple) {
        self.response_target = Some(target);
    }

    pub(crate) fn set_target(&mut self, target: Tuple) {
        self.target = Some(target);
    }

    pub(crate) fn set_next_transmission(&mut self, msg: SipMessage) {
        self.next_transmission = Some(msg);
    }

    pub(crate) fn set_state(&mut self, state: State) {
        self.state = state;
    }

    /// The request or response this transaction sends next
    pub fn next_transmission(&self) -> Option<&SipMessage> {
        self.next_transmission.as_ref()
    }

    /// Handle one event. The caller drops the transaction on
    /// [`Disposition::Terminate`].
    pub(crate) fn process(&mut self, event: Event, ctx: &mut Context<'_>) -> Disposition {
        trace!(tid = %self.id, machine = %self.machine, state = %self.state, event = ?event, "processing");
        if let Event::Dns(outcome) = event {
            return self.handle_dns(outcome, ctx);
        }
        match self.machine {
            Machine::ClientNonInvite => self.process_client_non_invite(event, ctx),
            Machine::ClientInvite => self.process_client_invite(event, ctx),
            Machine::ServerNonInvite => self.process_server_non_invite(event, ctx),
            Machine::ServerInvite => self.process_server_invite(event, ctx),
            Machine::Stateless => self.process_stateless(event, ctx),
            Machine::ClientStale => self.process_client_stale(event, ctx),
            Machine::ServerStale => self.process_server_stale(event, ctx),
        }
    }

    pub(crate) fn start_timer(&self, kind: TimerKind, duration: Duration, ctx: &mut Context<'_>) {
        ctx.timers.add(kind, self.id.clone(), duration, ctx.now);
    }

    /// Derive reliability from the transport type of the target.
    ///
    /// The first switch to an unreliable transport arms the client
    /// retransmission timer.
    pub(crate) fn process_reliability(&mut self, transport: TransportType, ctx: &mut Context<'_>) {
        if transport.is_reliable() {
            self.is_reliable = true;
            return;
        }
        if self.is_reliable {
            self.is_reliable = false;
            match self.machine {
                Machine::ClientNonInvite => self.start_timer(TimerKind::E1, ctx.config.timers.t1, ctx),
                Machine::ClientInvite => self.start_timer(TimerKind::A, ctx.config.timers.t1, ctx),
                _ => {}
            }
        }
    }

    /// Save the Contact and top Via a TU request arrived with, so that a
    /// failover can undo what the selector filled in for the last target
    pub(super) fn save_originals(&mut self, msg: &SipMessage) {
        self.original_contact = msg.contacts.first().cloned();
        self.original_via = msg.top_via().cloned();
    }

    pub(super) fn restore_originals(&mut self) {
        let Some(msg) = self.next_transmission.as_mut() else {
            return;
        };
        if let (Some(contact), Some(original)) = (msg.contacts.first_mut(), &self.original_contact) {
            *contact = original.clone();
        }
        if let (Some(via), Some(original)) = (msg.top_via_mut(), &self.original_via) {
            *via = original.clone();
        }
    }

    /// Send the pending message, or retransmit the last one.
    ///
    /// A client request without a target starts DNS resolution and goes out
    /// once the result arrives.
    pub(crate) fn send_current_to_wire(&mut self, ctx: &mut Context<'_>) {
        if let Some(data) = &self.msg_to_retransmit {
            ctx.selector.retransmit(data);
            return;
        }
        let Some(mut msg) = self.next_transmission.take() else {
            debug!(tid = %self.id, "nothing to send");
            return;
        };

        let sent = if self.machine.is_client() {
            if self.target.is_none() {
                if let Some(destination) = msg.destination.clone() {
                    let transport = destination.transport_type();
                    self.target = Some(destination);
                    self.process_reliability(transport, ctx);
                }
            }
            match self.target.as_mut() {
                Some(target) => ctx.selector.transmit(&mut msg, target, &self.id, true),
                None => {
                    if self.dns_result.is_none() {
                        match ctx.selector.dns_resolve(&mut msg, &self.id, true) {
                            Some(result) => {
                                self.dns_result = Some(result);
                                self.pending_dns = true;
                            }
                            None => info!(tid = %self.id, "no target to resolve, dropping"),
                        }
                    } else {
                        debug!(tid = %self.id, "waiting for DNS before sending");
                    }
                    self.next_transmission = Some(msg);
                    return;
                }
            }
        } else {
            let forced = msg.force_target.as_ref().and_then(TransportSelector::simple_tuple_for_uri);
            match forced.or_else(|| self.response_target.clone()) {
                Some(mut target) => {
                    let sent = ctx.selector.transmit(&mut msg, &mut target, &self.id, false);
                    if self.response_target.is_none() {
                        self.response_target = Some(target);
                    }
                    sent
                }
                None => {
                    info!(tid = %self.id, "no response target, dropping response");
                    None
                }
            }
        };

        if let Some(data) = sent {
            if !self.is_reliable {
                self.msg_to_retransmit = Some(data);
            }
        }
        // an ACK is sent once; everything else stays for failover and fix-ups
        if !(msg.is_request() && *msg.method() == Method::Ack) {
            self.next_transmission = Some(msg);
        }
    }

    /// Retransmit over the current target, e.g. when a retransmission timer
    /// fires
    pub(super) fn resend_to_wire(&mut self, ctx: &mut Context<'_>) {
        self.send_current_to_wire(ctx);
    }

    /// Hand a message to the owning TU.
    ///
    /// Responses feed the DNS target marks first. Under heavy TU load ACKs
    /// are dropped, and so are responses unless the TU declared them
    /// mandatory.
    pub(crate) fn send_to_tu(&mut self, msg: SipMessage, ctx: &mut Context<'_>) {
        if msg.is_response() {
            self.dns_feedback(&msg, ctx);
        }

        if ctx.tus.rejection_behavior(self.tu) == RejectionBehavior::RejectingNonEssential {
            if *msg.method() == Method::Ack && msg.is_request() {
                info!(tid = %self.id, "TU overloaded, dropping ACK");
                return;
            }
            if msg.is_response() && self.tu.is_some_and(|tu| ctx.tus.is_registered(tu)) && !ctx.tus.responses_mandatory(self.tu) {
                info!(tid = %self.id, "TU overloaded, dropping response");
                return;
            }
        }
        ctx.tus.add(self.tu, TuMessage::Sip(msg));
    }

    /// Build a response to the stored request and hand it to the TU
    pub(super) fn send_synthetic_to_tu(&mut self, code: u16, reason: Option<&str>, ctx: &mut Context<'_>) {
        let Some(request) = self.next_transmission.as_ref().filter(|m| m.is_request()) else {
            debug!(tid = %self.id, code, "no request to answer");
            return;
        };
        let response = make_response(request, code, reason);
        self.send_to_tu(response, ctx);
    }

    /// 408 to the TU, or 503 when the transaction never got past DNS
    pub(super) fn send_timeout_to_tu(&mut self, ctx: &mut Context<'_>) {
        if self.pending_dns {
            self.send_synthetic_to_tu(503, Some("DNS Timeout"), ctx);
        } else {
            self.send_synthetic_to_tu(408, None, ctx);
        }
    }

    /// Copy dialog identifiers and the CSeq number of the stored request
    /// into a response that disagrees with it
    pub(crate) fn fix_response(&self, msg: &mut SipMessage, config: &StackConfig) {
        let Some(request) = self.next_transmission.as_ref().filter(|m| m.is_request()) else {
            return;
        };
        if config.fix_bad_dialog_identifiers {
            if msg.call_id != request.call_id {
                info!(tid = %self.id, "fixing Call-ID of response");
                msg.call_id = request.call_id.clone();
            }
            if msg.from.tag != request.from.tag {
                info!(tid = %self.id, "fixing From tag of response");
                msg.from.tag = request.from.tag.clone();
            }
            if request.to.tag.is_some() && msg.to.tag != request.to.tag {
                info!(tid = %self.id, "fixing To tag of response");
                msg.to.tag = request.to.tag.clone();
            }
        }
        if config.fix_bad_cseq_numbers && msg.cseq.seq != request.cseq.seq {
            info!(tid = %self.id, got = msg.cseq.seq, want = request.cseq.seq, "fixing CSeq of response");
            msg.cseq.seq = request.cseq.seq;
        }
    }

    /// Stateless transactions: ACKs from the TU and stray responses
    fn process_stateless(&mut self, event: Event, ctx: &mut Context<'_>) -> Disposition {
        match event {
            Event::Sip(msg) if msg.external => {
                self.send_to_tu(msg, ctx);
                Disposition::Continue
            }
            Event::Sip(msg) => {
                self.next_transmission = Some(msg);
                self.send_current_to_wire(ctx);
                Disposition::Continue
            }
            Event::Timer(timer) if timer.kind == TimerKind::Stateless => Disposition::Terminate,
            Event::TransportFailure { reason, subcode } => {
                let _ = self.process_transport_failure(reason, subcode, ctx);
                Disposition::Terminate
            }
            other => {
                debug!(tid = %self.id, event = ?other, "ignored by stateless transaction");
                Disposition::Continue
            }
        }
    }
}
