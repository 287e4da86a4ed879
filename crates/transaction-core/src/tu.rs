//! Transaction User routing.
//!
//! A TU registers a [`MessageFilter`] and gets its own queue. Requests from
//! the wire go to the first TU whose filter matches; everything a
//! transaction later hands upward goes to the TU that owns it. Messages for
//! no TU, or for a TU that has since unregistered, go to the fallback queue
//! returned when the stack was created.

use rvoip_stack_transport::message::{SipMessage, TuId};
use rvoip_stack_transport::{Method, Tuple};
use tracing::{debug, info};

use crate::fifo::{self, FifoLimits, FifoReceiver, FifoSender, RejectionBehavior};
use crate::transaction::TransactionId;

/// Which requests a TU wants
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Accepted methods; empty accepts all
    pub methods: Vec<Method>,
    /// Accepted Request-URI hosts, compared ignoring case; empty accepts all
    pub domains: Vec<String>,
}

impl MessageFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into());
        self
    }

    pub fn matches(&self, msg: &SipMessage) -> bool {
        if !self.methods.is_empty() && !self.methods.contains(msg.method()) {
            return false;
        }
        if self.domains.is_empty() {
            return true;
        }
        let Some(uri) = msg.request_uri() else {
            return false;
        };
        self.domains.iter().any(|d| d.eq_ignore_ascii_case(uri.host_unbracketed()))
    }
}

/// Registration options of a TU
#[derive(Debug, Clone)]
pub struct TuRegistration {
    pub name: String,
    pub filter: MessageFilter,
    /// Deliver [`TuMessage::TransactionTerminated`] notices
    pub register_for_transaction_termination: bool,
    /// Deliver [`TuMessage::ConnectionTerminated`] notices
    pub register_for_connection_termination: bool,
    /// Responses are delivered even when the TU queue is overloaded
    pub responses_mandatory: bool,
    pub limits: FifoLimits,
}

impl TuRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: MessageFilter::any(),
            register_for_transaction_termination: false,
            register_for_connection_termination: false,
            responses_mandatory: false,
            limits: FifoLimits::default(),
        }
    }

    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_transaction_termination(mut self) -> Self {
        self.register_for_transaction_termination = true;
        self
    }

    pub fn with_connection_termination(mut self) -> Self {
        self.register_for_connection_termination = true;
        self
    }

    pub fn with_responses_mandatory(mut self) -> Self {
        self.responses_mandatory = true;
        self
    }

    pub fn with_limits(mut self, limits: FifoLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// What a TU receives
#[derive(Debug, Clone)]
pub enum TuMessage {
    /// A request or response for the TU
    Sip(SipMessage),
    /// A transaction owned by the TU ended
    TransactionTerminated { transaction_id: TransactionId, is_client: bool },
    /// A connection to a peer closed
    ConnectionTerminated(Tuple),
}

#[derive(Debug)]
struct TransactionUser {
    id: TuId,
    registration: TuRegistration,
    sender: FifoSender<TuMessage>,
}

/// Routes transaction output to registered TUs
#[derive(Debug)]
pub struct TuSelector {
    users: Vec<TransactionUser>,
    fallback: FifoSender<TuMessage>,
}

impl TuSelector {
    pub fn new(fallback: FifoSender<TuMessage>) -> Self {
        Self {
            users: Vec::new(),
            fallback,
        }
    }

    /// Register a TU under `id`, delivering into `sender`
    pub fn register(&mut self, id: TuId, registration: TuRegistration, sender: FifoSender<TuMessage>) {
        info!(tu = %id, name = %registration.name, "registering transaction user");
        self.users.retain(|u| u.id != id);
        self.users.push(TransactionUser {
            id,
            registration,
            sender,
        });
    }

    /// Create a queue for a TU and register it
    pub fn register_new(&mut self, id: TuId, registration: TuRegistration) -> FifoReceiver<TuMessage> {
        let (sender, receiver) = fifo::channel(registration.limits);
        self.register(id, registration, sender);
        receiver
    }

    pub fn unregister(&mut self, id: TuId) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.id != id);
        before != self.users.len()
    }

    pub fn have_transaction_users(&self) -> bool {
        !self.users.is_empty()
    }

    pub fn is_registered(&self, id: TuId) -> bool {
        self.user(Some(id)).is_some()
    }

    /// First TU whose filter accepts the request
    pub fn select_transaction_user(&self, msg: &SipMessage) -> Option<TuId> {
        self.users.iter().find(|u| u.registration.filter.matches(msg)).map(|u| u.id)
    }

    fn user(&self, id: Option<TuId>) -> Option<&TransactionUser> {
        let id = id?;
        self.users.iter().find(|u| u.id == id)
    }

    /// Load of the TU's queue; the fallback queue when `tu` is unknown
    pub fn rejection_behavior(&self, tu: Option<TuId>) -> RejectionBehavior {
        match self.user(tu) {
            Some(user) => user.sender.rejection_behavior(),
            None => self.fallback.rejection_behavior(),
        }
    }

    pub fn is_overloaded(&self, tu: Option<TuId>) -> bool {
        self.rejection_behavior(tu) != RejectionBehavior::Normal
    }

    pub fn responses_mandatory(&self, tu: Option<TuId>) -> bool {
        self.user(tu).is_some_and(|u| u.registration.responses_mandatory)
    }

    pub fn wants_transaction_termination(&self, tu: Option<TuId>) -> bool {
        self.user(tu).is_some_and(|u| u.registration.register_for_transaction_termination)
    }

    /// Deliver to `tu`, or to the fallback queue when it is not registered
    pub fn add(&self, tu: Option<TuId>, msg: TuMessage) {
        let sender = match self.user(tu) {
            Some(user) => &user.sender,
            None => &self.fallback,
        };
        if sender.add(msg).is_err() {
            debug!(tu = ?tu, "TU queue closed, dropping message");
        }
    }

    /// Tell the owning TU that a transaction ended, if it asked to know
    pub fn notify_transaction_terminated(&self, tu: Option<TuId>, transaction_id: &TransactionId, is_client: bool) {
        if self.wants_transaction_termination(tu) {
            self.add(
                tu,
                TuMessage::TransactionTerminated {
                    transaction_id: transaction_id.clone(),
                    is_client,
                },
            );
        }
    }

    /// Tell every interested TU that a connection closed
    pub fn notify_connection_terminated(&self, peer: &Tuple) {
        for user in self
            .users
            .iter()
            .filter(|u| u.registration.register_for_connection_termination)
        {
            let _ = user.sender.add(TuMessage::ConnectionTerminated(peer.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_stack_transport::message::NameAddr;

    fn request(method: Method, uri: &str) -> SipMessage {
        SipMessage::request(
            method,
            uri.parse().unwrap(),
            NameAddr::new("sip:alice@a.example".parse().unwrap()),
            NameAddr::new("sip:bob@b.example".parse().unwrap()),
            "c1",
            1,
        )
    }

    fn selector() -> (TuSelector, FifoReceiver<TuMessage>) {
        let (tx, rx) = fifo::channel(FifoLimits::default());
        (TuSelector::new(tx), rx)
    }

    #[test]
    fn test_filter_by_method_and_domain() {
        let filter = MessageFilter::any().with_method(Method::Register).with_domain("Example.com");
        assert!(filter.matches(&request(Method::Register, "sip:example.com")));
        assert!(!filter.matches(&request(Method::Invite, "sip:example.com")));
        assert!(!filter.matches(&request(Method::Register, "sip:other.com")));
    }

    #[test]
    fn test_first_matching_tu_wins() {
        let (mut sel, _fallback) = selector();
        let _reg = sel.register_new(
            TuId(1),
            TuRegistration::new("registrar").with_filter(MessageFilter::any().with_method(Method::Register)),
        );
        let _all = sel.register_new(TuId(2), TuRegistration::new("catch-all"));

        assert_eq!(sel.select_transaction_user(&request(Method::Register, "sip:x")), Some(TuId(1)));
        assert_eq!(sel.select_transaction_user(&request(Method::Invite, "sip:x")), Some(TuId(2)));

        assert!(sel.unregister(TuId(2)));
        assert_eq!(sel.select_transaction_user(&request(Method::Invite, "sip:x")), None);
    }

    #[test]
    fn test_unknown_tu_goes_to_fallback() {
        let (mut sel, mut fallback) = selector();
        let mut rx = sel.register_new(TuId(1), TuRegistration::new("tu"));

        sel.add(Some(TuId(1)), TuMessage::ConnectionTerminated(conn()));
        sel.add(Some(TuId(9)), TuMessage::ConnectionTerminated(conn()));
        sel.add(None, TuMessage::ConnectionTerminated(conn()));

        assert_eq!(rx.drain().len(), 1);
        assert_eq!(fallback.drain().len(), 2);
    }

    #[test]
    fn test_notices_only_for_opted_in_tus() {
        let (mut sel, _fallback) = selector();
        let mut plain = sel.register_new(TuId(1), TuRegistration::new("plain"));
        let mut keen = sel.register_new(
            TuId(2),
            TuRegistration::new("keen")
                .with_transaction_termination()
                .with_connection_termination(),
        );

        sel.notify_transaction_terminated(Some(TuId(1)), &"t1".into(), true);
        sel.notify_transaction_terminated(Some(TuId(2)), &"t2".into(), false);
        sel.notify_connection_terminated(&conn());

        assert!(plain.drain().is_empty());
        let got = keen.drain();
        assert_eq!(got.len(), 2);
        assert!(matches!(
            &got[0],
            TuMessage::TransactionTerminated { is_client: false, .. }
        ));
        assert!(matches!(&got[1], TuMessage::ConnectionTerminated(_)));
    }

    #[test]
    fn test_overload_follows_tu_queue_depth() {
        let (mut sel, _fallback) = selector();
        let _rx = sel.register_new(
            TuId(1),
            TuRegistration::new("small").with_limits(FifoLimits {
                reject_new_work_depth: 1,
                reject_non_essential_depth: 0,
            }),
        );
        assert!(!sel.is_overloaded(Some(TuId(1))));
        sel.add(Some(TuId(1)), TuMessage::ConnectionTerminated(conn()));
        assert!(sel.is_overloaded(Some(TuId(1))));
        assert_eq!(sel.rejection_behavior(Some(TuId(1))), RejectionBehavior::RejectingNewWork);
    }

    fn conn() -> Tuple {
        Tuple::new("10.0.0.1:5060".parse().unwrap(), rvoip_stack_transport::TransportType::Tcp)
    }
}
