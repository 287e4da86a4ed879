use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::message::decode;
use crate::transport::{
    deliver_incoming, FailureReason, SendCommand, SendData, Transport, TransportEvent, TransportFailure, TransportSink,
};
use crate::tuple::{TransportKey, TransportType, Tuple};

// Largest datagram we accept
const MAX_DATAGRAM: usize = 65_535;

/// UDP transport for SIP messages
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    local: Tuple,
    closed: AtomicBool,
    outbound: mpsc::UnboundedSender<SendData>,
    sink: Arc<dyn TransportSink>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Creates a new UDP transport bound to the specified address
    pub async fn bind(addr: SocketAddr, key: TransportKey, sink: Arc<dyn TransportSink>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| Error::BindFailed { addr, source })?;
        let local_addr = socket.local_addr()?;
        info!("SIP UDP transport bound to {}", local_addr);

        let socket = Arc::new(socket);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let local = Tuple::new(local_addr, TransportType::Udp).with_transport_key(key);

        let transport = UdpTransport {
            inner: Arc::new(UdpTransportInner {
                local,
                closed: AtomicBool::new(false),
                outbound,
                sink,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let receive = transport.spawn_receive_loop(socket.clone());
        let send = transport.spawn_send_loop(socket, outbound_rx);
        transport.inner.tasks.lock().extend([receive, send]);

        Ok(transport)
    }

    // Spawns a task to receive packets from the UDP socket
    fn spawn_receive_loop(&self, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            while !inner.closed.load(Ordering::Relaxed) {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        // ICMP errors surface here on some platforms
                        debug!("Error receiving UDP packet: {}", e);
                        continue;
                    }
                };

                let packet = &buf[..len];
                if packet.iter().all(|b| b.is_ascii_whitespace()) {
                    trace!("keep-alive from {}", src);
                    continue;
                }

                match decode(packet) {
                    Ok(mut message) => {
                        debug!("Received {} from {}", message.brief(), src);
                        let source = Tuple::new(src, TransportType::Udp).with_transport_key(inner.local.transport_key());
                        message.source = Some(source);
                        message.external = true;
                        if let Some(busy) = deliver_incoming(inner.sink.as_ref(), message) {
                            if let Err(e) = socket.send_to(&busy, src).await {
                                debug!("Failed to send 503 to {}: {}", src, e);
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Dropping malformed datagram from {}: {}", src, e);
                    }
                }
            }
            info!("UDP receive loop terminated");
        })
    }

    // Spawns a task draining the outbound queue onto the socket
    fn spawn_send_loop(&self, socket: Arc<UdpSocket>, mut outbound: mpsc::UnboundedReceiver<SendData>) -> JoinHandle<()> {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            while let Some(data) = outbound.recv().await {
                if data.command == SendCommand::CloseConnection {
                    continue;
                }
                let destination = data.destination.addr();
                trace!("Sending {} bytes to {}", data.data.len(), destination);
                if let Err(e) = socket.send_to(&data.data, destination).await {
                    warn!("UDP send to {} failed: {}", destination, e);
                    let reason = failure_reason(&e);
                    inner
                        .sink
                        .deliver(TransportEvent::Failure(TransportFailure::for_send(&data, reason)));
                }
            }
        })
    }
}

fn failure_reason(e: &io::Error) -> FailureReason {
    match e.kind() {
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => FailureReason::NoRoute,
        io::ErrorKind::AddrNotAvailable => FailureReason::TransportNoSocket,
        _ => FailureReason::Failure,
    }
}

impl Transport for UdpTransport {
    fn key(&self) -> TransportKey {
        self.inner.local.transport_key()
    }

    fn local_tuple(&self) -> Tuple {
        self.inner.local.clone()
    }

    fn send(&self, data: SendData) {
        if self.is_closed() {
            self.inner.sink.deliver(TransportEvent::Failure(TransportFailure::for_send(
                &data,
                FailureReason::TransportShutdown,
            )));
            return;
        }
        if let Err(mpsc::error::SendError(data)) = self.inner.outbound.send(data) {
            error!("UDP send loop is gone");
            self.inner.sink.deliver(TransportEvent::Failure(TransportFailure::for_send(
                &data,
                FailureReason::TransportShutdown,
            )));
        }
    }

    fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpTransport({})", self.inner.local.addr())
    }
}
