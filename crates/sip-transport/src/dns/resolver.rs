use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::Uri;
use crate::tuple::{TransportType, Tuple};

/// Outcome of resolving one destination
pub type DnsOutcome = Result<Vec<Tuple>>;

/// Completion callback for [`DnsResolver::lookup`].
///
/// Implementations may invoke it from any thread; the transaction layer
/// only uses it to enqueue an event.
pub type DnsCallback = Box<dyn FnOnce(DnsOutcome) + Send>;

/// Turns a SIP URI into an ordered list of candidate tuples
pub trait DnsResolver: Send + Sync {
    fn lookup(&self, target: &Uri, done: DnsCallback);
}

/// Transport implied by a URI: the `transport` parameter, else TLS for
/// `sips:`, else UDP.
pub fn target_transport(uri: &Uri) -> TransportType {
    uri.transport_param().unwrap_or(if uri.secure {
        TransportType::Tls
    } else {
        TransportType::Udp
    })
}

fn port_for(uri: &Uri, transport: TransportType) -> u16 {
    uri.port.unwrap_or_else(|| transport.default_port())
}

fn numeric_target(uri: &Uri) -> Option<Tuple> {
    let ip: IpAddr = uri.host_unbracketed().parse().ok()?;
    let transport = target_transport(uri);
    Some(Tuple::from_ip(ip, port_for(uri, transport), transport))
}

/// Resolver backed by a fixed host table.
///
/// Numeric hosts resolve to themselves. Completion is immediate.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register candidate addresses for a host name, in preference order
    pub fn with_host(mut self, host: impl Into<String>, addrs: Vec<SocketAddr>) -> Self {
        self.hosts.insert(host.into().to_ascii_lowercase(), addrs);
        self
    }

    pub fn resolve(&self, target: &Uri) -> DnsOutcome {
        if let Some(tuple) = numeric_target(target) {
            return Ok(vec![tuple]);
        }
        let transport = target_transport(target);
        let addrs = self
            .hosts
            .get(&target.host.to_ascii_lowercase())
            .ok_or_else(|| Error::dns(target.to_string(), "unknown host"))?;
        Ok(addrs
            .iter()
            .map(|addr| {
                let port = target.port.unwrap_or(addr.port());
                Tuple::from_ip(addr.ip(), port, transport).with_target_domain(target.host.clone())
            })
            .collect())
    }
}

impl DnsResolver for StaticResolver {
    fn lookup(&self, target: &Uri, done: DnsCallback) {
        done(self.resolve(target));
    }
}

/// RFC 3263 style resolver on top of hickory-resolver.
///
/// Numeric hosts are used directly. A host with an explicit port is looked
/// up with A/AAAA. Otherwise the SRV record for the target transport is
/// tried first, falling back to A/AAAA on the default port.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
    runtime: Handle,
}

impl HickoryResolver {
    /// Use the system resolver configuration. Must be called inside a tokio runtime.
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::dns("system configuration", e.to_string()))?;
        Self::with_resolver(resolver)
    }

    /// Use an explicit configuration. Must be called inside a tokio runtime.
    pub fn new(config: ResolverConfig, opts: ResolverOpts) -> Result<Self> {
        Self::with_resolver(TokioAsyncResolver::tokio(config, opts))
    }

    fn with_resolver(resolver: TokioAsyncResolver) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::dns("runtime", e.to_string()))?;
        Ok(Self { resolver, runtime })
    }
}

impl std::fmt::Debug for HickoryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HickoryResolver")
    }
}

impl DnsResolver for HickoryResolver {
    fn lookup(&self, target: &Uri, done: DnsCallback) {
        if let Some(tuple) = numeric_target(target) {
            done(Ok(vec![tuple]));
            return;
        }
        let resolver = self.resolver.clone();
        let target = target.clone();
        self.runtime.spawn(async move {
            let outcome = resolve_uri(&resolver, &target).await;
            if let Err(e) = &outcome {
                warn!(uri = %target, error = %e, "DNS lookup failed");
            }
            done(outcome);
        });
    }
}

fn srv_prefix(transport: TransportType) -> &'static str {
    match transport {
        TransportType::Tls => "_sips._tcp",
        TransportType::Tcp => "_sip._tcp",
        TransportType::Sctp => "_sip._sctp",
        _ => "_sip._udp",
    }
}

async fn lookup_host(resolver: &TokioAsyncResolver, host: &str, port: u16, transport: TransportType, domain: &str) -> Vec<Tuple> {
    match resolver.lookup_ip(host).await {
        Ok(ips) => ips
            .iter()
            .map(|ip| Tuple::from_ip(ip, port, transport).with_target_domain(domain.to_string()))
            .collect(),
        Err(e) => {
            debug!(host, error = %e, "A/AAAA lookup failed");
            Vec::new()
        }
    }
}

async fn resolve_uri(resolver: &TokioAsyncResolver, target: &Uri) -> DnsOutcome {
    let transport = target_transport(target);
    let host = target.host_unbracketed();

    if let Some(port) = target.port {
        let tuples = lookup_host(resolver, host, port, transport, host).await;
        return non_empty(tuples, target);
    }

    let srv_name = format!("{}.{}.", srv_prefix(transport), host.trim_end_matches('.'));
    let mut tuples = Vec::new();
    match resolver.srv_lookup(srv_name.as_str()).await {
        Ok(srv) => {
            let mut records: Vec<_> = srv.iter().collect();
            // lower priority first, heavier weight first within a priority
            records.sort_by(|a, b| a.priority().cmp(&b.priority()).then(b.weight().cmp(&a.weight())));
            for record in records {
                let srv_host = record.target().to_utf8();
                tuples.extend(lookup_host(resolver, srv_host.trim_end_matches('.'), record.port(), transport, host).await);
            }
        }
        Err(e) => debug!(name = %srv_name, error = %e, "SRV lookup failed, falling back to A/AAAA"),
    }

    if tuples.is_empty() {
        tuples = lookup_host(resolver, host, transport.default_port(), transport, host).await;
    }
    non_empty(tuples, target)
}

fn non_empty(tuples: Vec<Tuple>, target: &Uri) -> DnsOutcome {
    if tuples.is_empty() {
        Err(Error::dns(target.to_string(), "no records"))
    } else {
        Ok(tuples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver_numeric_host() {
        let resolver = StaticResolver::new();
        let tuples = resolver.resolve(&"sip:10.1.2.3;transport=tcp".parse().unwrap()).unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].port(), 5060);
        assert_eq!(tuples[0].transport_type(), TransportType::Tcp);

        let tuples = resolver.resolve(&"sips:[::1]".parse().unwrap()).unwrap();
        assert_eq!(tuples[0].port(), 5061);
        assert_eq!(tuples[0].transport_type(), TransportType::Tls);
    }

    #[test]
    fn test_static_resolver_host_table() {
        let resolver = StaticResolver::new().with_host(
            "example.com",
            vec!["10.0.0.1:5060".parse().unwrap(), "10.0.0.2:5080".parse().unwrap()],
        );
        let tuples = resolver.resolve(&"sip:bob@Example.com".parse().unwrap()).unwrap();
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[1].port(), 5080);
        assert_eq!(tuples[0].target_domain(), Some("Example.com"));

        assert!(resolver.resolve(&"sip:unknown.example.org".parse().unwrap()).is_err());
    }

    #[test]
    fn test_static_resolver_callback_is_immediate() {
        let resolver = StaticResolver::new();
        let (tx, rx) = std::sync::mpsc::channel();
        resolver.lookup(
            &"sip:127.0.0.1:5070".parse().unwrap(),
            Box::new(move |outcome| {
                tx.send(outcome.map(|t| t.len())).unwrap();
            }),
        );
        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
    }
}
