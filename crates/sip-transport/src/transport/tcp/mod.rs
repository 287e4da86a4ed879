//! TCP transport
//!
//! A single worker task owns the [`ConnectionManager`] and is its only
//! mutator. Socket reads and writes happen in small per-connection tasks
//! that report back to the worker over a channel; connects are spawned so
//! the worker never waits on the network.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, WriteOutcome};
use crate::error::{Error, Result};
use crate::message::{decode, drain_frames};
use crate::transport::{
    deliver_incoming, FailureReason, SendCommand, SendData, Transport, TransportEvent, TransportFailure, TransportSink,
};
use crate::tuple::{ConnectionId, TransportKey, TransportType, Tuple};

/// Connection management settings for stream transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// How often idle connections are collected
    pub gc_interval_ms: u64,
    /// Idle time after which a connection is closed
    pub max_idle_ms: u64,
    /// Cap on connections closed per collection pass (0 = no cap)
    pub max_gc_per_pass: usize,
    /// Connect timeout for outbound connections
    pub connect_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: 30_000,
            max_idle_ms: 2 * 60 * 60 * 1000,
            max_gc_per_pass: 0,
            connect_timeout_ms: 8_000,
        }
    }
}

/// TCP transport for SIP messages
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpTransportInner>,
}

struct TcpTransportInner {
    local: Tuple,
    closed: AtomicBool,
    commands: mpsc::UnboundedSender<Command>,
    sink: Arc<dyn TransportSink>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

enum Command {
    Send(SendData),
    Shutdown,
}

/// Reports from socket tasks to the worker
enum IoEvent {
    Connected { stream: TcpStream, peer: Tuple },
    ConnectFailed { peer: Tuple, reason: FailureReason },
    Frame { id: ConnectionId, frame: Bytes },
    /// A write failed; carries the failed send and everything queued behind it
    WriteFailed { id: ConnectionId, failed: Vec<SendData> },
    Closed { id: ConnectionId },
}

/// Per-connection I/O handle stored in the manager
struct StreamIo {
    writer: mpsc::UnboundedSender<SendData>,
    tasks: [JoinHandle<()>; 2],
}

impl Drop for StreamIo {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl TcpTransport {
    /// Creates a new TCP transport listening on the specified address
    pub async fn bind(addr: SocketAddr, key: TransportKey, config: TcpConfig, sink: Arc<dyn TransportSink>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::BindFailed { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("SIP TCP transport bound to {}", local_addr);

        let local = Tuple::new(local_addr, TransportType::Tcp).with_transport_key(key);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            manager: ConnectionManager::new(),
            local: local.clone(),
            sink: sink.clone(),
            io_tx,
            config,
            connecting: HashMap::new(),
        };
        let handle = tokio::spawn(worker.run(listener, commands_rx, io_rx));

        Ok(TcpTransport {
            inner: Arc::new(TcpTransportInner {
                local,
                closed: AtomicBool::new(false),
                commands,
                sink,
                worker: Mutex::new(Some(handle)),
            }),
        })
    }

    fn report_failure(&self, data: &SendData, reason: FailureReason) {
        self.inner
            .sink
            .deliver(TransportEvent::Failure(TransportFailure::for_send(data, reason)));
    }
}

impl Transport for TcpTransport {
    fn key(&self) -> TransportKey {
        self.inner.local.transport_key()
    }

    fn local_tuple(&self) -> Tuple {
        self.inner.local.clone()
    }

    fn send(&self, data: SendData) {
        if self.is_closed() {
            self.report_failure(&data, FailureReason::TransportShutdown);
            return;
        }
        if let Err(mpsc::error::SendError(Command::Send(data))) = self.inner.commands.send(Command::Send(data)) {
            self.report_failure(&data, FailureReason::TransportShutdown);
        }
    }

    fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        let _ = self.inner.commands.send(Command::Shutdown);
        if let Some(worker) = self.inner.worker.lock().take() {
            // the worker drops every connection on its way out
            tokio::spawn(async move {
                if tokio::time::timeout(Duration::from_secs(1), worker).await.is_err() {
                    warn!("TCP worker did not stop in time");
                }
            });
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpTransport({})", self.inner.local.addr())
    }
}

struct Worker {
    manager: ConnectionManager<StreamIo>,
    local: Tuple,
    sink: Arc<dyn TransportSink>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    config: TcpConfig,
    /// Sends waiting for an outbound connect, keyed by peer
    connecting: HashMap<Tuple, Vec<SendData>>,
}

impl Worker {
    async fn run(
        mut self,
        listener: TcpListener,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut io_rx: mpsc::UnboundedReceiver<IoEvent>,
    ) {
        let mut gc = tokio::time::interval(Duration::from_millis(self.config.gc_interval_ms.max(1)));
        gc.tick().await;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let peer = Tuple::new(addr, TransportType::Tcp);
                        self.register(stream, peer);
                    }
                    Err(e) => warn!("TCP accept failed: {}", e),
                },
                command = commands.recv() => match command {
                    Some(Command::Send(data)) => self.send(data),
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = io_rx.recv() => self.on_io(event),
                _ = gc.tick() => self.collect_garbage(),
            }
        }

        let closed = self.manager.drain();
        info!("TCP transport {} stopped, closed {} connections", self.local.addr(), closed.len());
    }

    fn register(&mut self, stream: TcpStream, peer: Tuple) -> ConnectionId {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();
        let io_tx = self.io_tx.clone();
        let key = self.local.transport_key();

        self.manager.add_connection(peer.with_transport_key(key), Instant::now(), |id| {
            let (writer, mut writer_rx) = mpsc::unbounded_channel::<SendData>();

            let writer_events = io_tx.clone();
            let write_task = tokio::spawn(async move {
                while let Some(data) = writer_rx.recv().await {
                    if let Err(e) = write_half.write_all(&data.data).await {
                        debug!("TCP write on connection {} failed: {}", id, e);
                        let mut failed = vec![data];
                        while let Ok(queued) = writer_rx.try_recv() {
                            failed.push(queued);
                        }
                        let _ = writer_events.send(IoEvent::WriteFailed { id, failed });
                        break;
                    }
                }
            });

            let read_task = tokio::spawn(async move {
                let mut buf = BytesMut::with_capacity(8192);
                loop {
                    match read_half.read_buf(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => match drain_frames(&mut buf) {
                            Ok(frames) => {
                                for frame in frames {
                                    let _ = io_tx.send(IoEvent::Frame { id, frame });
                                }
                            }
                            Err(e) => {
                                warn!("Closing connection {}: {}", id, e);
                                break;
                            }
                        },
                    }
                }
                let _ = io_tx.send(IoEvent::Closed { id });
            });

            StreamIo {
                writer,
                tasks: [read_task, write_task],
            }
        })
    }

    fn send(&mut self, data: SendData) {
        let destination = data.destination.clone();
        let existing = self.manager.find_connection(&destination);

        if data.command == SendCommand::CloseConnection {
            if let Some(id) = existing {
                self.terminate(id);
            }
            return;
        }

        if let Some(id) = existing {
            self.manager.touch(id, Instant::now());
            self.manager.queue_write(id, data);
            self.flush();
            return;
        }

        if !destination.connection_id().is_none() && destination.only_use_existing_connection() {
            debug!("No connection {} to {}", destination.connection_id(), destination);
            self.fail(&data, FailureReason::TransportNoExistConn);
            return;
        }

        let peer = Tuple::new(destination.addr(), TransportType::Tcp);
        if let Some(waiting) = self.connecting.get_mut(&peer) {
            waiting.push(data);
            return;
        }
        self.connecting.insert(peer.clone(), vec![data]);

        let io_tx = self.io_tx.clone();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, TcpStream::connect(peer.addr())).await {
                Ok(Ok(stream)) => IoEvent::Connected { stream, peer },
                Ok(Err(e)) => {
                    debug!("TCP connect to {} failed: {}", peer, e);
                    IoEvent::ConnectFailed {
                        peer,
                        reason: FailureReason::TransportBadConnect,
                    }
                }
                Err(_) => IoEvent::ConnectFailed {
                    peer,
                    reason: FailureReason::TransportBadConnect,
                },
            };
            let _ = io_tx.send(event);
        });
    }

    fn on_io(&mut self, event: IoEvent) {
        match event {
            IoEvent::Connected { stream, peer } => {
                let id = self.register(stream, peer.clone());
                for data in self.connecting.remove(&peer).unwrap_or_default() {
                    self.manager.queue_write(id, data);
                }
                self.flush();
            }
            IoEvent::ConnectFailed { peer, reason } => {
                for data in self.connecting.remove(&peer).unwrap_or_default() {
                    self.fail(&data, reason);
                }
            }
            IoEvent::Frame { id, frame } => {
                let Some(conn) = self.manager.get(id) else {
                    return;
                };
                let source = conn.peer().clone();
                self.manager.touch(id, Instant::now());
                match decode(&frame) {
                    Ok(mut message) => {
                        debug!("Received {} from {}", message.brief(), source);
                        message.source = Some(source.clone());
                        message.external = true;
                        if let Some(busy) = deliver_incoming(self.sink.as_ref(), message) {
                            self.manager.queue_write(id, SendData::message(source, busy, "", false));
                            self.flush();
                        }
                    }
                    Err(e) => debug!("Dropping malformed message from {}: {}", source, e),
                }
            }
            IoEvent::WriteFailed { id, failed } => {
                for data in &failed {
                    self.fail(data, FailureReason::ConnectionException);
                }
                self.terminate(id);
            }
            IoEvent::Closed { id } => self.terminate(id),
        }
    }

    fn flush(&mut self) {
        let failed = self.manager.drain_writes(|io, data| {
            if io.writer.send(data).is_ok() {
                WriteOutcome::Written
            } else {
                WriteOutcome::Failed
            }
        });
        for id in failed {
            self.terminate(id);
        }
    }

    fn terminate(&mut self, id: ConnectionId) {
        if let Some(mut conn) = self.manager.remove_connection(id) {
            for data in conn.take_pending_writes() {
                self.fail(&data, FailureReason::ConnectionException);
            }
            self.sink
                .deliver(TransportEvent::ConnectionTerminated(conn.peer().clone()));
        }
    }

    fn collect_garbage(&mut self) {
        let removed = self.manager.gc(
            Duration::from_millis(self.config.max_idle_ms),
            self.config.max_gc_per_pass,
            Instant::now(),
        );
        for mut conn in removed {
            for data in conn.take_pending_writes() {
                self.fail(&data, FailureReason::ConnectionException);
            }
            self.sink
                .deliver(TransportEvent::ConnectionTerminated(conn.peer().clone()));
        }
    }

    fn fail(&self, data: &SendData, reason: FailureReason) {
        self.sink
            .deliver(TransportEvent::Failure(TransportFailure::for_send(data, reason)));
    }
}
