//! Transport abstraction
//!
//! A [`Transport`] accepts encoded messages through a non-blocking
//! [`Transport::send`] and reports everything that happens on the network
//! (received messages, failed sends, lost connections) to a
//! [`TransportSink`]. The transaction layer implements the sink by
//! enqueueing onto its single event queue, so transports never call into
//! transaction state directly.
//!
//! Before queueing a decoded message a transport asks the sink to
//! [`TransportSink::admit`] it. A loaded sink refuses; the transport then
//! answers a refused request with a 503 itself and drops anything else.

pub mod tcp;
pub mod udp;

use std::fmt;

use bytes::Bytes;
use tracing::debug;

use crate::message::{encode, make_try_later, SipMessage};
use crate::tuple::{TransportKey, TransportType, Tuple};

/// Why a send failed. Ordered by severity: a transaction keeps the highest
/// reason it has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum FailureReason {
    #[default]
    None,
    Failure,
    TransportNoSocket,
    TransportBadConnect,
    ConnectionUnknown,
    ConnectionException,
    TransportNoExistConn,
    NoTransport,
    NoRoute,
    CertNameMismatch,
    CertValidationFailure,
    TransportShutdown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a [`SendData`] asks the transport to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCommand {
    /// Write the bytes to the destination
    Message,
    /// Close the connection to the destination
    CloseConnection,
}

/// An encoded message addressed to a tuple, tagged with its transaction
#[derive(Debug, Clone)]
pub struct SendData {
    pub destination: Tuple,
    pub data: Bytes,
    pub transaction_id: String,
    pub is_client: bool,
    pub command: SendCommand,
}

impl SendData {
    pub fn message(destination: Tuple, data: Bytes, transaction_id: impl Into<String>, is_client: bool) -> Self {
        Self {
            destination,
            data,
            transaction_id: transaction_id.into(),
            is_client,
            command: SendCommand::Message,
        }
    }

    pub fn close_connection(destination: Tuple) -> Self {
        Self {
            destination,
            data: Bytes::new(),
            transaction_id: String::new(),
            is_client: false,
            command: SendCommand::CloseConnection,
        }
    }
}

/// A failed send, reported back to the owning transaction
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub transaction_id: String,
    pub is_client: bool,
    pub reason: FailureReason,
    pub subcode: i32,
}

impl TransportFailure {
    pub fn for_send(data: &SendData, reason: FailureReason) -> Self {
        Self {
            transaction_id: data.transaction_id.clone(),
            is_client: data.is_client,
            reason,
            subcode: 0,
        }
    }
}

/// Events raised by transports
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded message arrived; `source` and `external` are set
    MessageReceived(SipMessage),
    /// A send failed
    Failure(TransportFailure),
    /// A connection closed or was garbage collected
    ConnectionTerminated(Tuple),
}

/// Whether a sink takes an incoming message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Shed the message. Requests other than ACK are answered with a 503
    /// carrying this Retry-After in seconds.
    Reject { retry_after: u32 },
}

/// Receiver of transport events
pub trait TransportSink: Send + Sync {
    fn deliver(&self, event: TransportEvent);

    /// Asked for every decoded message before it is delivered
    fn admit(&self, _msg: &SipMessage) -> Admission {
        Admission::Accept
    }
}

/// Deliver a received message unless the sink refuses it.
///
/// Returns the encoded 503 to send back to the source when a request was
/// refused.
pub(crate) fn deliver_incoming(sink: &dyn TransportSink, msg: SipMessage) -> Option<Bytes> {
    match sink.admit(&msg) {
        Admission::Accept => {
            sink.deliver(TransportEvent::MessageReceived(msg));
            None
        }
        Admission::Reject { retry_after } => {
            debug!("Shedding {} under load", msg.brief());
            make_try_later(&msg, retry_after).map(|response| encode(&response))
        }
    }
}

/// A network transport registered with the stack
pub trait Transport: Send + Sync + fmt::Debug {
    /// Key assigned at registration
    fn key(&self) -> TransportKey;

    /// Local address this transport is bound to
    fn local_tuple(&self) -> Tuple;

    fn transport_type(&self) -> TransportType {
        self.local_tuple().transport_type()
    }

    fn is_reliable(&self) -> bool {
        self.transport_type().is_reliable()
    }

    /// Queue data for transmission. Never blocks; failures are reported
    /// to the sink as [`TransportEvent::Failure`].
    fn send(&self, data: SendData);

    /// Stop I/O. Pending sends are dropped.
    fn shutdown(&self);

    fn is_closed(&self) -> bool;
}

/// Channel sink, handy when a transport is used without a transaction layer
impl TransportSink for tokio::sync::mpsc::UnboundedSender<TransportEvent> {
    fn deliver(&self, event: TransportEvent) {
        let _ = self.send(event);
    }
}
