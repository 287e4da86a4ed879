use std::fmt;
use std::sync::Arc;

use rand::Rng;
use tracing::warn;

use rvoip_stack_transport::dns::DnsOutcome;
use rvoip_stack_transport::message::{SipMessage, TuId};
use rvoip_stack_transport::{
    Admission, Transport, TransportEvent, TransportFailure, TransportKey, TransportSink, Tuple,
};

use crate::fifo::{FifoSender, RejectionBehavior};
use crate::timer::TimerMessage;
use crate::transaction::TransactionId;
use crate::tu::{TuMessage, TuRegistration};

/// Everything the transaction controller processes.
///
/// Transports, DNS completions, timers and the TU API all funnel into this
/// one type so that a single task owns every transaction.
pub enum TransactionMessage {
    /// A message from the wire (`external`) or from a TU
    Sip(SipMessage),
    /// A fired timer
    Timer(TimerMessage),
    /// A send failed
    TransportFailure(TransportFailure),
    /// DNS resolution for a transaction finished
    DnsResult {
        transaction_id: TransactionId,
        is_client: bool,
        outcome: DnsOutcome,
    },
    /// A connection closed or was collected
    ConnectionTerminated(Tuple),
    /// The TU will never answer this server transaction
    AbandonServerTransaction(TransactionId),
    /// The TU wants this client INVITE cancelled
    CancelClientInviteTransaction(TransactionId),
    AddTransport(Arc<dyn Transport>),
    RemoveTransport(TransportKey),
    CloseConnection(Tuple),
    RegisterTu {
        id: TuId,
        registration: TuRegistration,
        sender: FifoSender<TuMessage>,
    },
    UnregisterTu(TuId),
    Shutdown,
}

impl TransactionMessage {
    /// One-line summary for logs
    pub fn brief(&self) -> String {
        match self {
            TransactionMessage::Sip(msg) => msg.brief(),
            TransactionMessage::Timer(timer) => timer.to_string(),
            TransactionMessage::TransportFailure(f) => {
                format!("TransportFailure tid={} reason={}", f.transaction_id, f.reason)
            }
            TransactionMessage::DnsResult { transaction_id, .. } => format!("DnsResult tid={}", transaction_id),
            TransactionMessage::ConnectionTerminated(peer) => format!("ConnectionTerminated {}", peer),
            TransactionMessage::AbandonServerTransaction(id) => format!("AbandonServerTransaction tid={}", id),
            TransactionMessage::CancelClientInviteTransaction(id) => {
                format!("CancelClientInviteTransaction tid={}", id)
            }
            TransactionMessage::AddTransport(t) => format!("AddTransport {:?}", t),
            TransactionMessage::RemoveTransport(key) => format!("RemoveTransport {}", key),
            TransactionMessage::CloseConnection(peer) => format!("CloseConnection {}", peer),
            TransactionMessage::RegisterTu { id, registration, .. } => {
                format!("RegisterTu {} ({})", id, registration.name)
            }
            TransactionMessage::UnregisterTu(id) => format!("UnregisterTu {}", id),
            TransactionMessage::Shutdown => "Shutdown".to_string(),
        }
    }
}

impl fmt::Debug for TransactionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.brief())
    }
}

impl From<TransportEvent> for TransactionMessage {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::MessageReceived(msg) => TransactionMessage::Sip(msg),
            TransportEvent::Failure(failure) => TransactionMessage::TransportFailure(failure),
            TransportEvent::ConnectionTerminated(peer) => TransactionMessage::ConnectionTerminated(peer),
        }
    }
}

/// Transports deliver straight into the controller queue
impl TransportSink for FifoSender<TransactionMessage> {
    fn deliver(&self, event: TransportEvent) {
        if self.add(event.into()).is_err() {
            warn!("transaction queue closed, dropping transport event");
        }
    }

    /// A loaded queue sheds requests first, then everything
    fn admit(&self, msg: &SipMessage) -> Admission {
        match self.rejection_behavior() {
            RejectionBehavior::Normal => Admission::Accept,
            RejectionBehavior::RejectingNewWork if msg.is_response() => Admission::Accept,
            _ => Admission::Reject {
                retry_after: rand::thread_rng().gen_range(32..64),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::{self, FifoLimits};
    use rvoip_stack_transport::message::{make_response, NameAddr, Via};
    use rvoip_stack_transport::{Method, TransportType};

    fn request(method: Method) -> SipMessage {
        SipMessage::request(
            method,
            "sip:bob@127.0.0.1".parse().unwrap(),
            NameAddr::new("sip:alice@127.0.0.1".parse().unwrap()).with_tag("a"),
            NameAddr::new("sip:bob@127.0.0.1".parse().unwrap()),
            "shed-call",
            1,
        )
        .with_via(Via::new(TransportType::Udp, "127.0.0.1", Some(5070), "z9hG4bKshed"))
    }

    fn filler() -> TransactionMessage {
        TransactionMessage::ConnectionTerminated(Tuple::new("127.0.0.1:5070".parse().unwrap(), TransportType::Udp))
    }

    fn rejected(admission: Admission) -> bool {
        match admission {
            Admission::Accept => false,
            Admission::Reject { retry_after } => {
                assert!((32..64).contains(&retry_after));
                true
            }
        }
    }

    #[test]
    fn test_admission_follows_queue_depth() {
        let (tx, _rx) = fifo::channel(FifoLimits {
            reject_new_work_depth: 1,
            reject_non_essential_depth: 2,
        });
        let invite = request(Method::Invite);
        let response = make_response(&invite, 200, None);

        assert!(!rejected(tx.admit(&invite)));
        assert!(!rejected(tx.admit(&response)));

        tx.add(filler()).unwrap();
        assert!(rejected(tx.admit(&invite)));
        assert!(rejected(tx.admit(&request(Method::Ack))));
        assert!(!rejected(tx.admit(&response)), "responses finish existing work");

        tx.add(filler()).unwrap();
        assert!(rejected(tx.admit(&invite)));
        assert!(rejected(tx.admit(&response)));
    }

    #[test]
    fn test_unlimited_queue_admits_everything() {
        let (tx, _rx) = fifo::channel(FifoLimits::unlimited());
        for _ in 0..100 {
            tx.add(filler()).unwrap();
        }
        assert_eq!(tx.admit(&request(Method::Options)), Admission::Accept);
    }
}
