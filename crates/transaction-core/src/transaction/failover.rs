//! Target failover.
//!
//! A client request walks the candidates of its [`DnsResult`]: each
//! transport failure greylists the candidate that failed and moves on to
//! the next one. Only when no candidate is left does the TU see a failure,
//! as a 503 whose Warning names the last failure seen.

use std::time::Duration;

use tracing::{debug, info, warn};

use rvoip_stack_transport::dns::DnsOutcome;
use rvoip_stack_transport::message::{make_response, SipMessage, Warning};
use rvoip_stack_transport::{DnsAvailability, FailureReason, Method};

use super::state::Context;
use super::{Disposition, Machine, State, TransactionState};

const CANCEL_TRANSPORT_TEXT: &str = "Failed to deliver CANCEL using the same transport as the INVITE was used";

impl TransactionState {
    pub(super) fn process_transport_failure(&mut self, reason: FailureReason, subcode: i32, ctx: &mut Context<'_>) -> Disposition {
        if reason > self.failure_reason {
            self.failure_reason = reason;
            self.failure_subcode = subcode;
        }
        warn!(tid = %self.id, reason = %reason, subcode, "transport failure");

        let finished = matches!(self.state, State::Completed | State::Terminated);
        if self.method == Method::Cancel && self.machine.is_client() && !finished {
            if let Some(cancel) = self.next_transmission.as_ref().filter(|m| m.is_request()) {
                let mut response = make_response(cancel, 503, None);
                response.warnings.push(self.warning(CANCEL_TRANSPORT_TEXT.to_string(), ctx));
                self.send_to_tu(response, ctx);
            }
            return Disposition::Terminate;
        }

        let Some(dns) = self.dns_result.as_mut() else {
            return self.process_no_dns_results(ctx);
        };
        dns.greylist_last(ctx.now, ctx.config.greylist_duration);

        let failover = match self.machine {
            Machine::ClientNonInvite => !finished,
            Machine::ClientInvite => {
                if self.state == State::Proceeding {
                    self.state = State::Calling;
                }
                !finished
            }
            _ => false,
        };
        if !failover {
            return self.process_no_dns_results(ctx);
        }

        let availability = self.dns_result.as_ref().map(|d| d.available(ctx.now));
        match availability {
            Some(DnsAvailability::Available) => {
                self.restore_originals();
                self.msg_to_retransmit = None;
                let next = self.dns_result.as_mut().and_then(|d| d.next(ctx.now));
                match next {
                    Some(target) => {
                        info!(tid = %self.id, tuple = %target, "failing over to next target");
                        let transport = target.transport_type();
                        self.target = Some(target);
                        self.process_reliability(transport, ctx);
                        self.send_current_to_wire(ctx);
                        Disposition::Continue
                    }
                    None => self.process_no_dns_results(ctx),
                }
            }
            Some(DnsAvailability::Pending) => {
                self.pending_dns = true;
                self.restore_originals();
                self.msg_to_retransmit = None;
                Disposition::Continue
            }
            _ => self.process_no_dns_results(ctx),
        }
    }

    /// Tell the TU the request could not be delivered anywhere
    pub(super) fn process_no_dns_results(&mut self, ctx: &mut Context<'_>) -> Disposition {
        let Some(request) = self.next_transmission.as_ref().filter(|m| m.is_request()) else {
            return Disposition::Continue;
        };
        if *request.method() == Method::Ack {
            return Disposition::Continue;
        }

        let reason = self.failure_reason;
        let detail = format!("({},{})", reason, self.failure_subcode);
        let mut text = if self.dns_result.is_some() {
            format!("No other DNS entries to try {}", detail)
        } else {
            format!("Transport failure {}", detail)
        };
        let (code, phrase) = match reason {
            FailureReason::None => (503, "No DNS results"),
            FailureReason::Failure
            | FailureReason::TransportNoSocket
            | FailureReason::TransportBadConnect
            | FailureReason::ConnectionUnknown
            | FailureReason::ConnectionException => (503, "Transport failure: no transports left to try"),
            FailureReason::NoTransport => (503, "No matching transport found"),
            FailureReason::NoRoute => (503, "No route to host"),
            FailureReason::CertNameMismatch => (503, "Certificate Name Mismatch"),
            FailureReason::CertValidationFailure => (503, "Certificate Validation Failure"),
            FailureReason::TransportNoExistConn => {
                text = "Flow no longer exists".to_string();
                (430, "Flow failed")
            }
            FailureReason::TransportShutdown => (503, "Transport shutdown: no transports left to try"),
        };

        info!(tid = %self.id, code, phrase, "no targets left");
        let mut response = make_response(request, code, Some(phrase));
        response.warnings.push(self.warning(text, ctx));
        self.send_to_tu(response, ctx);
        Disposition::Terminate
    }

    /// A DNS lookup for this transaction completed
    pub(super) fn handle_dns(&mut self, outcome: DnsOutcome, ctx: &mut Context<'_>) -> Disposition {
        let Some(dns) = self.dns_result.as_mut() else {
            debug!(tid = %self.id, "DNS result without a lookup, ignoring");
            return Disposition::Continue;
        };
        match outcome {
            Ok(candidates) => dns.resolved(candidates),
            Err(e) => {
                info!(tid = %self.id, error = %e, "DNS lookup failed");
                dns.resolved(Vec::new());
            }
        }
        if !self.pending_dns {
            return Disposition::Continue;
        }

        match dns.available(ctx.now) {
            DnsAvailability::Available => {
                self.pending_dns = false;
                let Some(mut target) = dns.next(ctx.now) else {
                    return self.process_no_dns_results(ctx);
                };
                if let Some(key) = self
                    .next_transmission
                    .as_ref()
                    .and_then(|m| m.destination.as_ref())
                    .map(|d| d.transport_key())
                {
                    target.set_transport_key(key);
                }
                debug!(tid = %self.id, tuple = %target, "DNS target selected");
                let transport = target.transport_type();
                self.target = Some(target);
                self.process_reliability(transport, ctx);
                self.send_current_to_wire(ctx);
                Disposition::Continue
            }
            DnsAvailability::Pending => Disposition::Continue,
            DnsAvailability::Finished | DnsAvailability::Destroyed => {
                self.pending_dns = false;
                self.process_no_dns_results(ctx)
            }
        }
    }

    /// Feed the outcome of a request back into the target marks
    pub(super) fn dns_feedback(&mut self, response: &SipMessage, ctx: &mut Context<'_>) {
        let Some(dns) = self.dns_result.as_mut() else {
            return;
        };
        let code = response.status_code().unwrap_or_default();
        if response.external {
            match response.retry_after {
                Some(secs) if code == 503 && secs > 0 => {
                    dns.blacklist_last(ctx.now, Duration::from_secs(u64::from(secs)));
                }
                _ => dns.whitelist_last(),
            }
        } else if code == 408 && matches!(self.state, State::Trying | State::Calling) {
            dns.greylist_last(ctx.now, ctx.config.greylist_duration);
        }
    }

    fn warning(&self, text: String, ctx: &Context<'_>) -> Warning {
        Warning {
            code: 399,
            agent: ctx.config.hostname.clone(),
            text,
        }
    }
}
