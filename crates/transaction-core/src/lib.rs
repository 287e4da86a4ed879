//! # Transaction layer for the rvoip SIP stack
//!
//! This crate implements the RFC 3261 transaction layer: the client and
//! server INVITE and non-INVITE state machines, their timers, matching of
//! requests and responses to transactions, CANCEL handling and failover
//! across the targets of an RFC 3263 lookup.
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------+
//! |          Transaction Users (TUs)              |
//! +-----------------------------------------------+
//!         | SipStack::send        ^ TuMessage
//!         v                       |
//! +-----------------------------------------------+
//! |  controller queue  ->  TransactionController  |
//! |                        client / server maps   |
//! |                        timer queue            |
//! +-----------------------------------------------+
//!         | SendData              ^ TransportEvent
//!         v                       |
//! +-----------------------------------------------+
//! |  TransportSelector  ->  UDP / TCP transports  |
//! +-----------------------------------------------+
//! ```
//!
//! A single task owns every transaction. Transports, DNS completions and
//! TUs only post [`TransactionMessage`]s into the controller queue, so the
//! state machines need no locking.
//!
//! [`TransactionController`] is sans-io and can be driven by hand with an
//! explicit clock; [`SipStack`] runs it on tokio.
//!
//! ## Transaction identifiers
//!
//! A transaction is keyed by the branch of the top Via when it carries the
//! RFC 3261 magic cookie, otherwise by the RFC 2543 matching fields
//! (Call-ID, From tag, CSeq number and the top Via). A CANCEL lives next
//! to the INVITE it cancels under the same key with a `cancel` suffix.

pub mod config;
pub mod controller;
pub mod error;
pub mod fifo;
pub mod logging;
pub mod message;
pub mod selector;
pub mod stack;
pub mod timer;
pub mod transaction;
pub mod tu;

pub use config::StackConfig;
pub use controller::TransactionController;
pub use error::{Error, Result};
pub use fifo::{FifoLimits, FifoReceiver, FifoSender, RejectionBehavior};
pub use logging::{setup_logging, LoggingConfig};
pub use message::TransactionMessage;
pub use selector::TransportSelector;
pub use stack::SipStack;
pub use timer::{TimerKind, TimerMessage, TimerSettings};
pub use transaction::{Disposition, Machine, State, TransactionId, TransactionMap, TransactionState};
pub use tu::{MessageFilter, TuMessage, TuRegistration, TuSelector};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Error, Result, SipStack, StackConfig, TimerSettings, TransactionController, TransactionId,
        TransactionMessage, TuMessage, TuRegistration, MessageFilter, State, Machine,
    };
    pub use rvoip_stack_transport::message::{NameAddr, SipMessage, TuId, Via};
    pub use rvoip_stack_transport::{Method, TransportType, Tuple, Uri};
}
