//! The async face of the transaction layer.
//!
//! [`SipStack`] spawns one tokio task that owns a [`TransactionController`]
//! and feeds it from the controller queue and the timer queue. Everything
//! else (TUs, transports, DNS completions) talks to that task by posting
//! [`TransactionMessage`]s, so no transaction is ever touched by two tasks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rvoip_stack_transaction::{SipStack, StackConfig, TuRegistration};
//! use rvoip_stack_transport::StaticResolver;
//!
//! # async fn run() -> rvoip_stack_transaction::Result<()> {
//! let (stack, _unclaimed) = SipStack::new(StackConfig::default(), Arc::new(StaticResolver::new()))?;
//! let local = stack.bind_udp("0.0.0.0:5060".parse().unwrap()).await?;
//! let (_tu, mut messages) = stack.register_transaction_user(TuRegistration::new("uas"))?;
//! while let Some(msg) = messages.recv().await {
//!     println!("{:?} on {}", msg, local);
//! }
//! stack.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rvoip_stack_transport::message::{SipMessage, TuId};
use rvoip_stack_transport::{DnsResolver, TcpTransport, Transport, TransportKey, TransportSink, Tuple, UdpTransport};

use crate::config::StackConfig;
use crate::controller::TransactionController;
use crate::error::{Error, Result};
use crate::fifo::{self, FifoLimits, FifoReceiver, FifoSender};
use crate::message::TransactionMessage;
use crate::transaction::TransactionId;
use crate::tu::{TuMessage, TuRegistration};

/// Handle to a running transaction layer. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SipStack {
    fifo: FifoSender<TransactionMessage>,
    config: Arc<StackConfig>,
    next_tu: Arc<AtomicU32>,
    next_transport_key: Arc<AtomicU32>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SipStack {
    /// Validate `config` and start the controller task.
    ///
    /// The returned receiver gets everything addressed to no registered TU:
    /// messages arriving while no TU is registered, and stray responses.
    /// Must be called from within a tokio runtime.
    pub fn new(config: StackConfig, resolver: Arc<dyn DnsResolver>) -> Result<(Self, FifoReceiver<TuMessage>)> {
        config.validate()?;
        let (fifo, receiver) = fifo::channel(config.fifo);
        let (fallback, unclaimed) = fifo::channel(FifoLimits::unlimited());

        let controller = TransactionController::new(config.clone(), resolver, fifo.clone(), fallback);
        let task = tokio::spawn(run_controller(controller, receiver));
        info!(hostname = %config.hostname, "SIP stack started");

        let stack = Self {
            fifo,
            config: Arc::new(config),
            next_tu: Arc::new(AtomicU32::new(1)),
            next_transport_key: Arc::new(AtomicU32::new(1)),
            task: Arc::new(Mutex::new(Some(task))),
        };
        Ok((stack, unclaimed))
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Hand a request or response from a TU to the transaction layer
    pub fn send(&self, mut msg: SipMessage) -> Result<()> {
        if msg.top_via().is_none() {
            return Err(Error::invalid_message(format!("no Via in {}", msg.brief())));
        }
        msg.external = false;
        self.post(TransactionMessage::Sip(msg))
    }

    /// Register a TU; messages matching its filter arrive on the receiver
    pub fn register_transaction_user(&self, registration: TuRegistration) -> Result<(TuId, FifoReceiver<TuMessage>)> {
        let id = TuId(self.next_tu.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = fifo::channel(registration.limits);
        debug!(tu = %id, name = %registration.name, "registering TU");
        self.post(TransactionMessage::RegisterTu {
            id,
            registration,
            sender,
        })?;
        Ok((id, receiver))
    }

    pub fn unregister_transaction_user(&self, id: TuId) -> Result<()> {
        self.post(TransactionMessage::UnregisterTu(id))
    }

    /// Add a transport that was bound elsewhere. Its sink must deliver into
    /// [`SipStack::transport_sink`].
    pub fn add_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.post(TransactionMessage::AddTransport(transport))
    }

    pub fn remove_transport(&self, key: TransportKey) -> Result<()> {
        self.post(TransactionMessage::RemoveTransport(key))
    }

    /// The sink transports deliver received messages and failures into
    pub fn transport_sink(&self) -> Arc<dyn TransportSink> {
        Arc::new(self.fifo.clone())
    }

    /// A fresh key for a transport about to be added
    pub fn allocate_transport_key(&self) -> TransportKey {
        TransportKey(self.next_transport_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind a UDP transport and add it. Returns the bound local tuple.
    pub async fn bind_udp(&self, addr: SocketAddr) -> Result<Tuple> {
        let key = self.allocate_transport_key();
        let transport = UdpTransport::bind(addr, key, self.transport_sink()).await?;
        let local = transport.local_tuple();
        self.add_transport(Arc::new(transport))?;
        info!(tuple = %local, "UDP transport added");
        Ok(local)
    }

    /// Bind a TCP listener and add it. Returns the bound local tuple.
    pub async fn bind_tcp(&self, addr: SocketAddr) -> Result<Tuple> {
        let key = self.allocate_transport_key();
        let transport = TcpTransport::bind(addr, key, self.config.tcp.clone(), self.transport_sink()).await?;
        let local = transport.local_tuple();
        self.add_transport(Arc::new(transport))?;
        info!(tuple = %local, "TCP transport added");
        Ok(local)
    }

    /// The TU will not answer this server transaction
    pub fn abandon_server_transaction(&self, id: TransactionId) -> Result<()> {
        self.post(TransactionMessage::AbandonServerTransaction(id))
    }

    /// Cancel a client INVITE; the stack generates the CANCEL
    pub fn cancel_client_invite_transaction(&self, id: TransactionId) -> Result<()> {
        self.post(TransactionMessage::CancelClientInviteTransaction(id))
    }

    pub fn close_connection(&self, peer: Tuple) -> Result<()> {
        self.post(TransactionMessage::CloseConnection(peer))
    }

    /// Stop the controller and its transports, then wait for the task
    pub async fn shutdown(&self) {
        if self.post(TransactionMessage::Shutdown).is_err() {
            debug!("controller already gone");
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "controller task ended abnormally");
            }
        }
    }

    fn post(&self, msg: TransactionMessage) -> Result<()> {
        self.fifo.add(msg).map_err(|_| Error::Shutdown)
    }
}

/// Controller loop: fire due timers first, then take the next message
async fn run_controller(mut controller: TransactionController, mut receiver: FifoReceiver<TransactionMessage>) {
    loop {
        let deadline = controller.next_timer_deadline();
        tokio::select! {
            biased;
            _ = sleep_until(deadline) => {
                controller.process_expired_timers(now());
            }
            msg = receiver.recv() => match msg {
                Some(msg) => {
                    controller.process(msg, now());
                    if controller.is_shutdown() {
                        break;
                    }
                }
                None => {
                    controller.shutdown();
                    break;
                }
            },
        }
    }
    debug!("controller task finished");
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_stack_transport::StaticResolver;

    #[tokio::test]
    async fn test_send_requires_via() {
        let (stack, _unclaimed) = SipStack::new(StackConfig::default(), Arc::new(StaticResolver::new())).unwrap();
        let msg = SipMessage::request(
            rvoip_stack_transport::Method::Options,
            "sip:bob@example.com".parse().unwrap(),
            rvoip_stack_transport::message::NameAddr::new("sip:alice@example.com".parse().unwrap()),
            rvoip_stack_transport::message::NameAddr::new("sip:bob@example.com".parse().unwrap()),
            "call",
            1,
        );
        assert!(matches!(stack.send(msg), Err(Error::InvalidMessage { .. })));
        stack.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_further_work() {
        let (stack, _unclaimed) = SipStack::new(StackConfig::default(), Arc::new(StaticResolver::new())).unwrap();
        stack.shutdown().await;
        assert!(matches!(
            stack.register_transaction_user(TuRegistration::new("late")),
            Err(Error::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_tu_ids_are_distinct() {
        let (stack, _unclaimed) = SipStack::new(StackConfig::default(), Arc::new(StaticResolver::new())).unwrap();
        let (a, _ra) = stack.register_transaction_user(TuRegistration::new("a")).unwrap();
        let (b, _rb) = stack.register_transaction_user(TuRegistration::new("b")).unwrap();
        assert_ne!(a, b);
        stack.shutdown().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut config = StackConfig::default();
            config.hostname.clear();
            let result = SipStack::new(config, Arc::new(StaticResolver::new()));
            assert!(result.is_err());
        });
    }
}
