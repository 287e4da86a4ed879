//! # Transactions
//!
//! One [`TransactionState`] drives one RFC 3261 transaction. The four
//! machines of RFC 3261 section 17 are joined by three bookkeeping ones:
//!
//! - `Stateless`: ACKs for 2xx sent by the TU, and stray responses passed up
//!   to the TU, are kept only long enough to survive a DNS lookup.
//! - `ClientStale`: a client INVITE that saw a 2xx stays around to pass
//!   retransmitted 2xx responses to the TU.
//! - `ServerStale`: a server INVITE that sent a 2xx stays around so that
//!   late INVITE retransmissions still match and later 2xx retransmissions
//!   from the TU still reach the right source tuple.
//!
//! Transactions live in two [`TransactionMap`]s (client and server) owned
//! by the controller. Handlers return a [`Disposition`]; the controller
//! removes a transaction that reports [`Disposition::Terminate`].

mod client;
mod failover;
mod server;
mod state;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use rvoip_stack_transport::message::SipMessage;
use rvoip_stack_transport::Method;

pub use state::TransactionState;
pub(crate) use state::{Context, Event};

/// Suffix that gives a CANCEL its own slot next to the INVITE it cancels
pub const CANCEL_SUFFIX: &str = "cancel";

/// Transaction identifier. Comparison ignores ASCII case.
#[derive(Debug, Clone)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier of the transaction a message belongs to.
    ///
    /// CANCEL requests and responses get the `cancel` suffix. `None` when
    /// the message carries no Via.
    pub fn of(msg: &SipMessage) -> Option<Self> {
        let id = msg.transaction_id()?;
        if *msg.method() == Method::Cancel {
            Some(Self(id + CANCEL_SUFFIX))
        } else {
            Some(Self(id))
        }
    }

    /// The id of the CANCEL transaction for this INVITE id
    pub fn cancel_id(&self) -> Self {
        Self(format!("{}{}", self.0, CANCEL_SUFFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for TransactionId {}

impl Hash for TransactionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_usize(self.0.len());
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which state machine a transaction runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    ClientNonInvite,
    ClientInvite,
    ServerNonInvite,
    ServerInvite,
    Stateless,
    ClientStale,
    ServerStale,
}

impl Machine {
    /// Whether transactions of this machine live in the client map
    pub fn is_client(self) -> bool {
        match self {
            Machine::ClientNonInvite | Machine::ClientInvite | Machine::ClientStale | Machine::Stateless => true,
            Machine::ServerNonInvite | Machine::ServerInvite | Machine::ServerStale => false,
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Protocol state, shared by all machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
    /// Never observable: a removed transaction is dropped
    Bogus,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the controller does with a transaction after a handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Disposition {
    Continue,
    Terminate,
}

/// Live transactions of one direction, keyed by id
#[derive(Debug, Default)]
pub struct TransactionMap {
    map: HashMap<TransactionId, TransactionState>,
}

impl TransactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, id: &TransactionId) -> Option<&TransactionState> {
        self.map.get(id)
    }

    pub fn find_mut(&mut self, id: &TransactionId) -> Option<&mut TransactionState> {
        self.map.get_mut(id)
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.map.contains_key(id)
    }

    /// Insert a transaction under its own id.
    ///
    /// A live transaction with the same id is never replaced: the newcomer
    /// is handed back in `Err` and the existing entry stays.
    pub fn add(&mut self, state: TransactionState) -> Result<(), TransactionState> {
        match self.map.entry(state.id().clone()) {
            Entry::Occupied(_) => Err(state),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(())
            }
        }
    }

    /// Remove and return a transaction
    pub fn take(&mut self, id: &TransactionId) -> Option<TransactionState> {
        self.map.remove(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransactionState> {
        self.map.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_ignore_case() {
        let a = TransactionId::from("z9hG4bKAbC");
        let b = TransactionId::from("Z9HG4BKabc");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_cancel_id_is_distinct() {
        let invite = TransactionId::from("z9hG4bK1");
        let cancel = invite.cancel_id();
        assert_ne!(invite, cancel);
        assert_eq!(cancel.as_str(), "z9hG4bK1cancel");
    }

    #[test]
    fn test_add_keeps_live_transaction() {
        let mut map = TransactionMap::new();
        let first = TransactionState::new("z9hG4bK1".into(), Machine::ClientInvite, State::Calling, Method::Invite, None);
        assert!(map.add(first).is_ok());

        let second = TransactionState::new("Z9HG4BK1".into(), Machine::Stateless, State::Calling, Method::Ack, None);
        let rejected = map.add(second).unwrap_err();
        assert_eq!(rejected.machine(), Machine::Stateless);
        assert_eq!(map.len(), 1);
        assert_eq!(map.find(&"z9hG4bK1".into()).unwrap().machine(), Machine::ClientInvite);
    }

    #[test]
    fn test_machine_direction() {
        assert!(Machine::Stateless.is_client());
        assert!(Machine::ClientStale.is_client());
        assert!(!Machine::ServerStale.is_client());
    }
}
