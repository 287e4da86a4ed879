//! Network endpoint descriptors
//!
//! A [`Tuple`] names one end of a SIP hop: an IP address, a port, a
//! transport type and, for connection oriented transports, optionally the
//! specific connection the hop is bound to. Tuples are plain values; they
//! are cloned freely and used as map keys throughout the stack.
//!
//! Exact equality, hashing and ordering consider the transport type, the
//! address and the port only. The connection id and the target domain are
//! deliberately left out so that a tuple received on a connection still
//! matches the address it was resolved from. Looser comparisons are
//! available through [`TupleMatch`] and [`Tuple::key`].

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default port for SIP over UDP/TCP
pub const DEFAULT_SIP_PORT: u16 = 5060;
/// Default port for SIP over TLS
pub const DEFAULT_SIPS_PORT: u16 = 5061;

/// Transport protocol of a SIP hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum TransportType {
    /// Not yet decided (requires DNS resolution)
    #[default]
    Unknown,
    Udp,
    Tcp,
    Tls,
    Sctp,
    Dccp,
    Dtls,
    Ws,
    Wss,
}

impl TransportType {
    /// Whether the transport delivers messages reliably.
    ///
    /// Only datagram transports without their own retransmission are
    /// unreliable; for those the transaction layer retransmits.
    pub fn is_reliable(self) -> bool {
        !matches!(self, TransportType::Udp | TransportType::Dccp)
    }

    /// Whether the transport runs over a connection
    pub fn is_connection_oriented(self) -> bool {
        matches!(
            self,
            TransportType::Tcp
                | TransportType::Tls
                | TransportType::Sctp
                | TransportType::Ws
                | TransportType::Wss
        )
    }

    /// Whether the transport is secured
    pub fn is_secure(self) -> bool {
        matches!(self, TransportType::Tls | TransportType::Dtls | TransportType::Wss)
    }

    /// Default port for this transport
    pub fn default_port(self) -> u16 {
        if self.is_secure() {
            DEFAULT_SIPS_PORT
        } else {
            DEFAULT_SIP_PORT
        }
    }

    /// Token used in the Via header
    pub fn as_str(self) -> &'static str {
        match self {
            TransportType::Unknown => "UNKNOWN",
            TransportType::Udp => "UDP",
            TransportType::Tcp => "TCP",
            TransportType::Tls => "TLS",
            TransportType::Sctp => "SCTP",
            TransportType::Dccp => "DCCP",
            TransportType::Dtls => "DTLS",
            TransportType::Ws => "WS",
            TransportType::Wss => "WSS",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let transport = match s.to_ascii_uppercase().as_str() {
            "UDP" => TransportType::Udp,
            "TCP" => TransportType::Tcp,
            "TLS" => TransportType::Tls,
            "SCTP" => TransportType::Sctp,
            "DCCP" => TransportType::Dccp,
            "DTLS" => TransportType::Dtls,
            "WS" => TransportType::Ws,
            "WSS" => TransportType::Wss,
            other => return Err(Error::parse(format!("unknown transport '{}'", other))),
        };
        Ok(transport)
    }
}

/// Identifier of a live connection. Zero means "no specific connection".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub const NONE: ConnectionId = ConnectionId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a transport instance registered with the stack. Zero means
/// "any transport of the right type".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TransportKey(pub u32);

impl TransportKey {
    pub const ANY: TransportKey = TransportKey(0);

    pub fn is_any(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// IP family of a tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V4,
    V6,
}

/// Comparison policies for tuples used as lookup keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleMatch {
    /// Transport, address and port
    Exact,
    /// Transport, IP family and port (the local interface is ignored)
    AnyInterface,
    /// Transport and address (the port is ignored)
    AnyPort,
    /// Transport and IP family
    AnyPortAnyInterface,
}

/// Hashable projection of a tuple under a [`TupleMatch`] policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleKey {
    transport: TransportType,
    version: IpVersion,
    ip: Option<IpAddr>,
    port: Option<u16>,
}

/// A network endpoint: address, port, transport and optional connection
#[derive(Debug, Clone)]
pub struct Tuple {
    addr: SocketAddr,
    transport: TransportType,
    connection_id: ConnectionId,
    transport_key: TransportKey,
    only_use_existing_connection: bool,
    target_domain: Option<String>,
}

impl Tuple {
    pub fn new(addr: SocketAddr, transport: TransportType) -> Self {
        Self {
            addr,
            transport,
            connection_id: ConnectionId::NONE,
            transport_key: TransportKey::ANY,
            only_use_existing_connection: false,
            target_domain: None,
        }
    }

    /// Build a tuple from an IP and port
    pub fn from_ip(ip: IpAddr, port: u16, transport: TransportType) -> Self {
        Self::new(SocketAddr::new(ip, port), transport)
    }

    /// Bind the tuple to an existing connection
    pub fn with_connection_id(mut self, id: ConnectionId) -> Self {
        self.connection_id = id;
        self
    }

    /// Bind the tuple to a specific transport instance
    pub fn with_transport_key(mut self, key: TransportKey) -> Self {
        self.transport_key = key;
        self
    }

    /// Never open a new connection for this tuple
    pub fn with_only_existing_connection(mut self, only: bool) -> Self {
        self.only_use_existing_connection = only;
        self
    }

    /// Record the domain name the tuple was resolved from
    pub fn with_target_domain(mut self, domain: impl Into<String>) -> Self {
        self.target_domain = Some(domain.into());
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_port(&mut self, port: u16) {
        self.addr.set_port(port);
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport
    }

    pub fn ip_version(&self) -> IpVersion {
        if self.addr.is_ipv4() {
            IpVersion::V4
        } else {
            IpVersion::V6
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn set_connection_id(&mut self, id: ConnectionId) {
        self.connection_id = id;
    }

    pub fn transport_key(&self) -> TransportKey {
        self.transport_key
    }

    pub fn set_transport_key(&mut self, key: TransportKey) {
        self.transport_key = key;
    }

    pub fn only_use_existing_connection(&self) -> bool {
        self.only_use_existing_connection
    }

    pub fn target_domain(&self) -> Option<&str> {
        self.target_domain.as_deref()
    }

    /// True when the address is the unspecified address (0.0.0.0 / ::)
    pub fn is_any_interface(&self) -> bool {
        self.addr.ip().is_unspecified()
    }

    pub fn is_reliable(&self) -> bool {
        self.transport.is_reliable()
    }

    /// Project the tuple onto a key under the given comparison policy
    pub fn key(&self, policy: TupleMatch) -> TupleKey {
        let (ip, port) = match policy {
            TupleMatch::Exact => (Some(self.ip()), Some(self.port())),
            TupleMatch::AnyInterface => (None, Some(self.port())),
            TupleMatch::AnyPort => (Some(self.ip()), None),
            TupleMatch::AnyPortAnyInterface => (None, None),
        };
        TupleKey {
            transport: self.transport,
            version: self.ip_version(),
            ip,
            port,
        }
    }

    /// Compare two tuples under a policy
    pub fn matches(&self, other: &Tuple, policy: TupleMatch) -> bool {
        self.key(policy) == other.key(policy)
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport && self.addr == other.addr
    }
}

impl Eq for Tuple {}

impl Hash for Tuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport.hash(state);
        self.addr.ip().hash(state);
        self.addr.port().hash(state);
    }
}

impl PartialOrd for Tuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.transport
            .cmp(&other.transport)
            .then_with(|| self.addr.ip().cmp(&other.addr.ip()))
            .then_with(|| self.addr.port().cmp(&other.addr.port()))
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.transport, self.addr)?;
        if !self.connection_id.is_none() {
            write!(f, " conn={}", self.connection_id)?;
        }
        if let Some(domain) = &self.target_domain {
            write!(f, " ({})", domain)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn tuple(s: &str, transport: TransportType) -> Tuple {
        Tuple::new(s.parse().unwrap(), transport)
    }

    #[test]
    fn test_equality_ignores_connection_id() {
        let a = tuple("10.0.0.1:5060", TransportType::Tcp);
        let b = a.clone().with_connection_id(ConnectionId(7));
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_transport_distinguishes_tuples() {
        let udp = tuple("10.0.0.1:5060", TransportType::Udp);
        let tcp = tuple("10.0.0.1:5060", TransportType::Tcp);
        assert_ne!(udp, tcp);
        assert!(udp < tcp);
    }

    #[test]
    fn test_ordering_transport_then_address_then_port() {
        let a = tuple("10.0.0.1:5070", TransportType::Udp);
        let b = tuple("10.0.0.2:5060", TransportType::Udp);
        let c = tuple("10.0.0.2:5061", TransportType::Udp);
        let mut v = vec![c.clone(), a.clone(), b.clone()];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }

    #[test]
    fn test_match_policies() {
        let a = tuple("10.0.0.1:5060", TransportType::Udp);
        let other_port = tuple("10.0.0.1:6000", TransportType::Udp);
        let other_if = tuple("192.168.1.1:5060", TransportType::Udp);
        let v6 = tuple("[::1]:5060", TransportType::Udp);

        assert!(!a.matches(&other_port, TupleMatch::Exact));
        assert!(a.matches(&other_port, TupleMatch::AnyPort));
        assert!(a.matches(&other_if, TupleMatch::AnyInterface));
        assert!(!a.matches(&other_if, TupleMatch::AnyPort));
        assert!(a.matches(&other_if, TupleMatch::AnyPortAnyInterface));
        assert!(!a.matches(&v6, TupleMatch::AnyPortAnyInterface));
    }

    #[test]
    fn test_reliability_by_transport() {
        assert!(!TransportType::Udp.is_reliable());
        assert!(!TransportType::Dccp.is_reliable());
        assert!(TransportType::Tcp.is_reliable());
        assert!(TransportType::Tls.is_reliable());
        assert!(TransportType::Sctp.is_reliable());
        assert_eq!(TransportType::Tls.default_port(), DEFAULT_SIPS_PORT);
        assert_eq!("tcp".parse::<TransportType>().unwrap(), TransportType::Tcp);
    }
}
