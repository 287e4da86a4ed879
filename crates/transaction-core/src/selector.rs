//! Outbound transport selection.
//!
//! The [`TransportSelector`] is the only way transactions reach the
//! network. It picks a registered transport for a target tuple, completes
//! the sent-by of the top Via and an empty Contact host from that
//! transport's local address, encodes and hands the bytes off. DNS
//! resolution is started here as well; completions come back through the
//! controller queue as [`TransactionMessage::DnsResult`].
//!
//! Nothing here reports errors to the caller synchronously. A message that
//! cannot be sent turns into a [`TransactionMessage::TransportFailure`] in
//! the queue, exactly like a failure reported later by the transport.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use rvoip_stack_transport::dns::target_transport;
use rvoip_stack_transport::message::encode;
use rvoip_stack_transport::tuple::IpVersion;
use rvoip_stack_transport::{
    DnsResolver, DnsResult, FailureReason, SendData, SipMessage, TargetMarks, Transport, TransportFailure,
    TransportKey, TransportType, Tuple, Uri,
};

use crate::fifo::FifoSender;
use crate::message::TransactionMessage;
use crate::transaction::TransactionId;

/// Chooses transports and resolves targets for transactions
pub struct TransportSelector {
    transports: BTreeMap<TransportKey, Arc<dyn Transport>>,
    resolver: Arc<dyn DnsResolver>,
    marks: TargetMarks,
    events: FifoSender<TransactionMessage>,
    /// Source address per any-interface transport and IP family
    sources: Mutex<HashMap<(TransportKey, IpVersion), IpAddr>>,
}

impl TransportSelector {
    pub fn new(resolver: Arc<dyn DnsResolver>, events: FifoSender<TransactionMessage>) -> Self {
        Self {
            transports: BTreeMap::new(),
            resolver,
            marks: TargetMarks::new(),
            events,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Register a transport under its own key
    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) {
        let key = transport.key();
        info!(key = %key, local = %transport.local_tuple(), "adding transport");
        self.forget_sources(key);
        if let Some(previous) = self.transports.insert(key, transport) {
            warn!(key = %key, "replacing transport with the same key");
            previous.shutdown();
        }
    }

    /// Unregister and shut down a transport
    pub fn remove_transport(&mut self, key: TransportKey) -> bool {
        self.forget_sources(key);
        match self.transports.remove(&key) {
            Some(transport) => {
                info!(key = %key, "removing transport");
                transport.shutdown();
                true
            }
            None => {
                debug!(key = %key, "no transport to remove");
                false
            }
        }
    }

    fn forget_sources(&self, key: TransportKey) {
        self.sources.lock().retain(|(k, _), _| *k != key);
    }

    /// Address the peer will see for a message sent from `local`.
    ///
    /// A transport bound to the any-interface address asks the routing
    /// table once per IP family; the answer is kept until the transport is
    /// replaced or removed.
    fn source_address(&self, local: &Tuple, target: &Tuple) -> IpAddr {
        if !local.is_any_interface() {
            return local.ip();
        }
        let key = (local.transport_key(), target.ip_version());
        if let Some(ip) = self.sources.lock().get(&key) {
            return *ip;
        }
        match route_source(target) {
            Ok(ip) => {
                debug!(key = %key.0, source = %ip, "learned source address");
                self.sources.lock().insert(key, ip);
                ip
            }
            Err(e) => {
                debug!(tuple = %target, error = %e, "could not determine source address");
                local.ip()
            }
        }
    }

    pub fn has_transports(&self) -> bool {
        !self.transports.is_empty()
    }

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    pub fn shutdown_all(&mut self) {
        for (_, transport) in std::mem::take(&mut self.transports) {
            transport.shutdown();
        }
    }

    /// Marks shared by every DNS result this selector creates
    pub fn target_marks(&self) -> &TargetMarks {
        &self.marks
    }

    /// Transport to use for `target`.
    ///
    /// A tuple bound to a transport key uses that transport; otherwise the
    /// first transport with the same type and IP family is chosen.
    pub fn find_transport(&self, target: &Tuple) -> Option<Arc<dyn Transport>> {
        if !target.transport_key().is_any() {
            return self
                .transports
                .get(&target.transport_key())
                .filter(|t| !t.is_closed())
                .cloned();
        }
        self.transports
            .values()
            .find(|t| {
                let local = t.local_tuple();
                !t.is_closed()
                    && local.transport_type() == target.transport_type()
                    && local.ip_version() == target.ip_version()
            })
            .cloned()
    }

    /// URI to resolve for a request: the forced target, else the first
    /// Route (which becomes the forced target), else the Request-URI.
    pub fn dns_target(msg: &mut SipMessage) -> Option<Uri> {
        if let Some(target) = &msg.force_target {
            return Some(target.clone());
        }
        if let Some(route) = msg.routes.first() {
            let uri = route.uri.clone();
            msg.force_target = Some(uri.clone());
            return Some(uri);
        }
        msg.request_uri().cloned()
    }

    /// Start resolving the destination of `msg` for a transaction.
    ///
    /// Returns the pending result, or `None` when the message has nothing
    /// to resolve. The outcome is queued as a DNS event for the transaction.
    pub fn dns_resolve(&self, msg: &mut SipMessage, transaction_id: &TransactionId, is_client: bool) -> Option<DnsResult> {
        let target = Self::dns_target(msg)?;
        debug!(tid = %transaction_id, uri = %target, "resolving target");

        let events = self.events.clone();
        let transaction_id = transaction_id.clone();
        self.resolver.lookup(
            &target,
            Box::new(move |outcome| {
                let event = TransactionMessage::DnsResult {
                    transaction_id,
                    is_client,
                    outcome,
                };
                if events.add(event).is_err() {
                    debug!("controller gone, dropping DNS result");
                }
            }),
        );
        Some(DnsResult::new(target, self.marks.clone()))
    }

    /// Encode `msg` and send it to `target`.
    ///
    /// The chosen transport key is recorded on `target`. Returns what was
    /// handed to the transport so unreliable transactions can retransmit it.
    pub fn transmit(
        &self,
        msg: &mut SipMessage,
        target: &mut Tuple,
        transaction_id: &TransactionId,
        is_client: bool,
    ) -> Option<SendData> {
        let Some(transport) = self.find_transport(target) else {
            let reason = if !target.connection_id().is_none() && target.only_use_existing_connection() {
                FailureReason::TransportNoExistConn
            } else {
                FailureReason::NoTransport
            };
            warn!(tid = %transaction_id, tuple = %target, reason = %reason, "no transport for target");
            self.post_failure(transaction_id.as_str(), is_client, reason);
            return None;
        };

        target.set_transport_key(transport.key());
        let local = transport.local_tuple();
        let source = self.source_address(&local, target);
        fill_local_address(msg, &local, source);

        let data = SendData::message(target.clone(), encode(msg), transaction_id.as_str(), is_client);
        debug!(tid = %transaction_id, tuple = %target, msg = %msg.brief(), "transmitting");
        transport.send(data.clone());
        Some(data)
    }

    /// Send previously encoded data again
    pub fn retransmit(&self, data: &SendData) {
        match self.find_transport(&data.destination) {
            Some(transport) => {
                debug!(tid = %data.transaction_id, tuple = %data.destination, "retransmitting");
                transport.send(data.clone());
            }
            None => self.post_failure(&data.transaction_id, data.is_client, FailureReason::NoTransport),
        }
    }

    /// Ask the owning transport to close the connection to `peer`
    pub fn close_connection(&self, peer: &Tuple) {
        match self.find_transport(peer) {
            Some(transport) => transport.send(SendData::close_connection(peer.clone())),
            None => debug!(tuple = %peer, "no transport owns connection to close"),
        }
    }

    /// Tuple for a URI with a numeric host, without DNS
    pub fn simple_tuple_for_uri(uri: &Uri) -> Option<Tuple> {
        let ip: IpAddr = uri.host_unbracketed().parse().ok()?;
        let transport = target_transport(uri);
        Some(Tuple::from_ip(ip, uri.port.unwrap_or_else(|| transport.default_port()), transport))
    }

    fn post_failure(&self, transaction_id: &str, is_client: bool, reason: FailureReason) {
        let failure = TransportFailure {
            transaction_id: transaction_id.to_string(),
            is_client,
            reason,
            subcode: 0,
        };
        if self.events.add(TransactionMessage::TransportFailure(failure)).is_err() {
            debug!("controller gone, dropping transport failure");
        }
    }
}

impl std::fmt::Debug for TransportSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSelector")
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Ask the routing table which local address reaches `target`, through a
/// connected UDP socket that never sends
fn route_source(target: &Tuple) -> io::Result<IpAddr> {
    let bind: SocketAddr = match target.ip_version() {
        IpVersion::V4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpVersion::V6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(target.addr())?;
    Ok(socket.local_addr()?.ip())
}

fn fill_local_address(msg: &mut SipMessage, local: &Tuple, source: IpAddr) {
    let host = match source {
        IpAddr::V6(v6) => format!("[{}]", v6),
        IpAddr::V4(v4) => v4.to_string(),
    };
    if msg.is_request() {
        if let Some(via) = msg.top_via_mut() {
            if via.transport == TransportType::Unknown {
                via.transport = local.transport_type();
            }
            if via.host.is_empty() {
                via.host = host.clone();
                via.port = Some(local.port());
            }
        }
    }
    if let Some(contact) = msg.contacts.first_mut() {
        if contact.uri.host.is_empty() {
            contact.uri.host = host;
            contact.uri.port = Some(local.port());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::{self, FifoLimits};
    use parking_lot::Mutex;
    use rvoip_stack_transport::message::{NameAddr, Via};
    use rvoip_stack_transport::{Method, StaticResolver};

    #[derive(Debug)]
    struct Recorder {
        local: Tuple,
        sent: Mutex<Vec<SendData>>,
    }

    impl Transport for Recorder {
        fn key(&self) -> TransportKey {
            self.local.transport_key()
        }
        fn local_tuple(&self) -> Tuple {
            self.local.clone()
        }
        fn send(&self, data: SendData) {
            self.sent.lock().push(data);
        }
        fn shutdown(&self) {}
        fn is_closed(&self) -> bool {
            false
        }
    }

    fn recorder(addr: &str, transport: TransportType, key: u32) -> Arc<Recorder> {
        Arc::new(Recorder {
            local: Tuple::new(addr.parse().unwrap(), transport).with_transport_key(TransportKey(key)),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn options() -> SipMessage {
        SipMessage::request(
            Method::Options,
            "sip:bob@192.0.2.10".parse().unwrap(),
            NameAddr::new("sip:alice@a.example".parse().unwrap()).with_tag("t"),
            NameAddr::new("sip:bob@b.example".parse().unwrap()),
            "c",
            1,
        )
        .with_via(Via::unfilled("z9hG4bK1"))
        .with_contact(NameAddr::new(Uri::new("").with_user("alice")))
    }

    #[test]
    fn test_transmit_fills_via_and_contact() {
        let (tx, _rx) = fifo::channel(FifoLimits::default());
        let mut selector = TransportSelector::new(Arc::new(StaticResolver::new()), tx);
        let udp = recorder("10.1.1.1:5070", TransportType::Udp, 1);
        selector.add_transport(udp.clone());

        let mut msg = options();
        let mut target = Tuple::new("192.0.2.10:5060".parse().unwrap(), TransportType::Udp);
        let data = selector.transmit(&mut msg, &mut target, &"z9hG4bK1".into(), true).unwrap();

        assert_eq!(target.transport_key(), TransportKey(1));
        let via = msg.top_via().unwrap();
        assert_eq!(via.host, "10.1.1.1");
        assert_eq!(via.port, Some(5070));
        assert_eq!(via.transport, TransportType::Udp);
        assert_eq!(msg.contacts[0].uri.host, "10.1.1.1");
        assert_eq!(udp.sent.lock().len(), 1);
        assert_eq!(data.transaction_id, "z9hG4bK1");
    }

    #[test]
    fn test_any_interface_source_is_resolved_once() {
        let (tx, _rx) = fifo::channel(FifoLimits::default());
        let mut selector = TransportSelector::new(Arc::new(StaticResolver::new()), tx);
        selector.add_transport(recorder("0.0.0.0:5070", TransportType::Udp, 1));

        for _ in 0..3 {
            let mut msg = options();
            let mut target = Tuple::new("127.0.0.1:5060".parse().unwrap(), TransportType::Udp);
            selector.transmit(&mut msg, &mut target, &"z9hG4bK1".into(), true).unwrap();
            assert_eq!(msg.top_via().unwrap().host, "127.0.0.1");
        }
        assert_eq!(selector.sources.lock().len(), 1);

        selector.remove_transport(TransportKey(1));
        assert!(selector.sources.lock().is_empty());
    }

    #[test]
    fn test_missing_transport_is_queued_as_failure() {
        let (tx, mut rx) = fifo::channel(FifoLimits::default());
        let selector = TransportSelector::new(Arc::new(StaticResolver::new()), tx);

        let mut msg = options();
        let mut target = Tuple::new("192.0.2.10:5060".parse().unwrap(), TransportType::Tcp)
            .with_connection_id(rvoip_stack_transport::ConnectionId(4))
            .with_only_existing_connection(true);
        assert!(selector.transmit(&mut msg, &mut target, &"z9hG4bK1".into(), true).is_none());

        match rx.try_recv() {
            Some(TransactionMessage::TransportFailure(f)) => {
                assert_eq!(f.reason, FailureReason::TransportNoExistConn);
                assert!(f.is_client);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_find_transport_by_key_then_type() {
        let (tx, _rx) = fifo::channel(FifoLimits::default());
        let mut selector = TransportSelector::new(Arc::new(StaticResolver::new()), tx);
        selector.add_transport(recorder("10.1.1.1:5060", TransportType::Udp, 1));
        selector.add_transport(recorder("10.1.1.1:5060", TransportType::Tcp, 2));

        let tcp = Tuple::new("192.0.2.1:5060".parse().unwrap(), TransportType::Tcp);
        assert_eq!(selector.find_transport(&tcp).unwrap().key(), TransportKey(2));

        let pinned = tcp.clone().with_transport_key(TransportKey(1));
        assert_eq!(selector.find_transport(&pinned).unwrap().key(), TransportKey(1));

        let v6 = Tuple::new("[2001:db8::1]:5060".parse().unwrap(), TransportType::Udp);
        assert!(selector.find_transport(&v6).is_none());

        assert!(selector.remove_transport(TransportKey(2)));
        assert!(selector.find_transport(&tcp).is_none());
    }

    #[test]
    fn test_route_becomes_forced_target() {
        let mut msg = options();
        msg.routes.push(NameAddr::new("sip:proxy.example;lr".parse().unwrap()));
        let target = TransportSelector::dns_target(&mut msg).unwrap();
        assert_eq!(target.host, "proxy.example");
        assert_eq!(msg.force_target.as_ref().unwrap().host, "proxy.example");
    }

    #[test]
    fn test_dns_completion_is_queued() {
        let (tx, mut rx) = fifo::channel(FifoLimits::default());
        let selector = TransportSelector::new(Arc::new(StaticResolver::new()), tx);
        let mut msg = options();
        let result = selector.dns_resolve(&mut msg, &"z9hG4bK1".into(), true).unwrap();
        assert_eq!(result.target().host, "192.0.2.10");

        match rx.try_recv() {
            Some(TransactionMessage::DnsResult { outcome, is_client, .. }) => {
                assert!(is_client);
                assert_eq!(outcome.unwrap().len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_simple_tuple_for_uri() {
        let tuple = TransportSelector::simple_tuple_for_uri(&"sip:10.0.0.1;transport=tcp".parse().unwrap()).unwrap();
        assert_eq!(tuple.transport_type(), TransportType::Tcp);
        assert_eq!(tuple.port(), 5060);
        assert!(TransportSelector::simple_tuple_for_uri(&"sip:example.com".parse().unwrap()).is_none());
    }
}
