//! SIP transport layer for the rvoip stack
//!
//! This crate provides the pieces underneath the transaction layer:
//! endpoint tuples, the SIP message model and wire codec, RFC 3263 target
//! iteration, connection bookkeeping and UDP/TCP transports.

pub mod connection;
pub mod dns;
pub mod error;
pub mod message;
pub mod transport;
pub mod tuple;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

pub use connection::{Connection, ConnectionManager, WriteOutcome};
pub use dns::{DnsAvailability, DnsResolver, DnsResult, HickoryResolver, StaticResolver, TargetMarks};
pub use error::{Error, Result};
pub use message::{Method, SipMessage, Uri};
pub use transport::tcp::{TcpConfig, TcpTransport};
pub use transport::udp::UdpTransport;
pub use transport::{
    Admission, FailureReason, SendData, Transport, TransportEvent, TransportFailure, TransportSink,
};
pub use tuple::{ConnectionId, TransportKey, TransportType, Tuple};

/// Bind a UDP transport to the specified address
pub async fn bind_udp(addr: SocketAddr) -> Result<(UdpTransport, mpsc::UnboundedReceiver<TransportEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = UdpTransport::bind(addr, TransportKey::ANY, Arc::new(tx)).await?;
    Ok((transport, rx))
}

/// Bind a TCP transport to the specified address
pub async fn bind_tcp(addr: SocketAddr) -> Result<(TcpTransport, mpsc::UnboundedReceiver<TransportEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = TcpTransport::bind(addr, TransportKey::ANY, TcpConfig::default(), Arc::new(tx)).await?;
    Ok((transport, rx))
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        bind_tcp, bind_udp, message::builders::*, Error, Method, Result, SendData, SipMessage, TcpTransport,
        Transport, TransportEvent, TransportType, Tuple, UdpTransport, Uri,
    };
}
