//! Shared test harness: a controller driven by hand with a manual clock and
//! a recording transport.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use rvoip_stack_transaction::fifo::{self, FifoLimits, FifoReceiver, FifoSender};
use rvoip_stack_transaction::{StackConfig, TransactionController, TransactionMessage, TuMessage};
use rvoip_stack_transport::message::{decode, generate_branch, NameAddr, SipMessage, Via};
use rvoip_stack_transport::{
    DnsResolver, FailureReason, Method, SendData, StaticResolver, Transport, TransportEvent, TransportFailure,
    TransportKey, TransportSink, TransportType, Tuple,
};

pub const LOCAL: &str = "127.0.0.1:5060";
pub const PEER: &str = "127.0.0.1:5070";

/// Transport that records what it is asked to send. Sends to a failing
/// address are reported back as transport failures.
#[derive(Debug)]
pub struct MockTransport {
    local: Tuple,
    sink: FifoSender<TransactionMessage>,
    sent: Mutex<Vec<SendData>>,
    failing: Mutex<HashSet<SocketAddr>>,
}

impl MockTransport {
    pub fn fail_sends_to(&self, addr: &str) {
        self.failing.lock().insert(addr.parse().unwrap());
    }

    /// Everything sent so far, decoded
    pub fn sent(&self) -> Vec<(Tuple, SipMessage)> {
        self.sent
            .lock()
            .iter()
            .filter(|d| !d.data.is_empty())
            .map(|d| (d.destination.clone(), decode(&d.data).unwrap()))
            .collect()
    }

    /// Drain and decode everything sent so far
    pub fn take_sent(&self) -> Vec<(Tuple, SipMessage)> {
        let sent = self.sent();
        self.sent.lock().clear();
        sent
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Transport for MockTransport {
    fn key(&self) -> TransportKey {
        self.local.transport_key()
    }

    fn local_tuple(&self) -> Tuple {
        self.local.clone()
    }

    fn send(&self, data: SendData) {
        if self.failing.lock().contains(&data.destination.addr()) {
            self.sink
                .deliver(TransportEvent::Failure(TransportFailure::for_send(&data, FailureReason::TransportBadConnect)));
            return;
        }
        self.sent.lock().push(data);
    }

    fn shutdown(&self) {}

    fn is_closed(&self) -> bool {
        false
    }
}

pub struct Harness {
    pub controller: TransactionController,
    pub fifo: FifoSender<TransactionMessage>,
    queue: FifoReceiver<TransactionMessage>,
    pub tu: FifoReceiver<TuMessage>,
    pub wire: Arc<MockTransport>,
    pub now: Instant,
    start: Instant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(StackConfig::default())
    }

    pub fn with_config(config: StackConfig) -> Self {
        Self::build(config, Arc::new(StaticResolver::new()), TransportType::Udp)
    }

    /// Harness whose only transport is connection oriented
    pub fn reliable() -> Self {
        Self::build(StackConfig::default(), Arc::new(StaticResolver::new()), TransportType::Tcp)
    }

    pub fn build(config: StackConfig, resolver: Arc<dyn DnsResolver>, transport: TransportType) -> Self {
        let (fifo, queue) = fifo::channel(config.fifo);
        let (fallback, tu) = fifo::channel(FifoLimits::unlimited());
        let mut controller = TransactionController::new(config, resolver, fifo.clone(), fallback);

        let wire = Arc::new(MockTransport {
            local: Tuple::new(LOCAL.parse().unwrap(), transport).with_transport_key(TransportKey(1)),
            sink: fifo.clone(),
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        });
        let now = Instant::now();
        controller.process(TransactionMessage::AddTransport(wire.clone()), now);

        Self {
            controller,
            fifo,
            queue,
            tu,
            wire,
            now,
            start: now,
        }
    }

    /// Process everything queued for the controller
    pub fn pump(&mut self) {
        while let Some(msg) = self.queue.try_recv() {
            self.controller.process(msg, self.now);
        }
    }

    /// A TU hands a message to the stack
    pub fn send(&mut self, mut msg: SipMessage) {
        msg.external = false;
        self.controller.process(TransactionMessage::Sip(msg), self.now);
        self.pump();
    }

    /// A message arrives from `from` over the mock transport
    pub fn receive(&mut self, msg: SipMessage, from: &str) {
        let source = Tuple::new(from.parse().unwrap(), self.wire.local.transport_type())
            .with_transport_key(self.wire.key());
        self.controller.process(TransactionMessage::Sip(msg.received_from(source)), self.now);
        self.pump();
    }

    /// Move the clock forward, firing every timer at its own deadline
    pub fn advance(&mut self, by: Duration) {
        let until = self.now + by;
        while let Some(deadline) = self.controller.next_timer_deadline() {
            if deadline > until {
                break;
            }
            self.now = self.now.max(deadline);
            self.controller.process_expired_timers(self.now);
            self.pump();
        }
        self.now = until;
    }

    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    /// Everything the TU received so far
    pub fn tu_messages(&mut self) -> Vec<TuMessage> {
        self.tu.drain()
    }

    /// SIP messages the TU received so far
    pub fn tu_sip(&mut self) -> Vec<SipMessage> {
        self.tu_messages()
            .into_iter()
            .filter_map(|m| match m {
                TuMessage::Sip(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }
}

pub fn peer_tuple() -> Tuple {
    Tuple::new(PEER.parse().unwrap(), TransportType::Udp)
}

pub fn tcp_peer_tuple() -> Tuple {
    Tuple::new(PEER.parse().unwrap(), TransportType::Tcp)
}

/// A request as a TU would build it: unfilled Via with a fresh branch
pub fn tu_request(method: Method, target: &str) -> SipMessage {
    SipMessage::request(
        method,
        target.parse().unwrap(),
        NameAddr::new("sip:alice@example.com".parse().unwrap()).with_tag(&generate_branch()[7..]),
        NameAddr::new("sip:bob@example.com".parse().unwrap()),
        format!("call-{}", generate_branch()),
        1,
    )
    .with_via(Via::unfilled(generate_branch()))
}

/// A request as it would arrive from the peer
pub fn wire_request(method: Method, branch: &str) -> SipMessage {
    SipMessage::request(
        method,
        "sip:alice@127.0.0.1:5060".parse().unwrap(),
        NameAddr::new("sip:bob@example.com".parse().unwrap()).with_tag("peer-tag"),
        NameAddr::new("sip:alice@example.com".parse().unwrap()),
        "wire-call",
        7,
    )
    .with_via(Via::new(TransportType::Udp, "127.0.0.1", Some(5070), branch))
}

/// Response to `request` as the peer would send it
pub fn peer_response(request: &SipMessage, code: u16) -> SipMessage {
    let mut response = rvoip_stack_transport::message::make_response(request, code, None);
    response.to.tag = if code > 100 { Some("remote".to_string()) } else { None };
    response
}
