//! Connection bookkeeping for connection oriented transports
//!
//! The [`ConnectionManager`] owns every connection of one transport. Each
//! connection lives in an id-keyed table and is referenced from a few
//! ordered collections:
//!
//! - the address index (exact peer tuple to id),
//! - the read set (every live connection),
//! - the write set (connections with queued output, transient),
//! - the LRU list (ordered by last activity, oldest first).
//!
//! Because the collections hold ids rather than references, removing a
//! connection while walking any of them never invalidates the walk.
//!
//! The manager is generic over the I/O handle `C` stored with each
//! connection, so the bookkeeping can be exercised without sockets.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::transport::SendData;
use crate::tuple::{ConnectionId, Tuple};

/// One managed connection
#[derive(Debug)]
pub struct Connection<C> {
    id: ConnectionId,
    peer: Tuple,
    last_used: Instant,
    lru_seq: u64,
    outgoing: VecDeque<SendData>,
    io: C,
}

impl<C> Connection<C> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer tuple, carrying this connection's id
    pub fn peer(&self) -> &Tuple {
        &self.peer
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn io(&self) -> &C {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut C {
        &mut self.io
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Take every queued write, oldest first
    pub fn take_pending_writes(&mut self) -> Vec<SendData> {
        self.outgoing.drain(..).collect()
    }

    pub fn into_io(self) -> C {
        self.io
    }
}

/// Result of handing one buffer to a connection's writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    WouldBlock,
    Failed,
}

/// Index of live connections for one transport
#[derive(Debug)]
pub struct ConnectionManager<C> {
    connections: HashMap<ConnectionId, Connection<C>>,
    by_addr: HashMap<Tuple, ConnectionId>,
    lru: BTreeMap<u64, ConnectionId>,
    read_set: BTreeSet<ConnectionId>,
    write_set: BTreeSet<ConnectionId>,
    next_id: u64,
    next_seq: u64,
}

impl<C> Default for ConnectionManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ConnectionManager<C> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            by_addr: HashMap::new(),
            lru: BTreeMap::new(),
            read_set: BTreeSet::new(),
            write_set: BTreeSet::new(),
            next_id: 1,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Add a connection to `peer`; `make_io` receives the assigned id.
    ///
    /// A later connection to the same address replaces the earlier one in
    /// the address index; the earlier one stays reachable by id.
    pub fn add_connection(&mut self, peer: Tuple, now: Instant, make_io: impl FnOnce(ConnectionId) -> C) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        let seq = self.bump_seq();

        let peer = peer.with_connection_id(id);
        debug!(connection = %id, peer = %peer, "adding connection");

        self.by_addr.insert(peer.clone(), id);
        self.lru.insert(seq, id);
        self.read_set.insert(id);
        self.connections.insert(
            id,
            Connection {
                id,
                peer,
                last_used: now,
                lru_seq: seq,
                outgoing: VecDeque::new(),
                io: make_io(id),
            },
        );
        id
    }

    /// Look up the connection for a destination.
    ///
    /// A tuple naming a connection id is matched by id first. The id match
    /// is accepted when the address agrees, or when the tuple's address or
    /// port was left defaulted. Unless the tuple insists on an existing
    /// connection, the exact address index is consulted next.
    pub fn find_connection(&self, target: &Tuple) -> Option<ConnectionId> {
        let id = target.connection_id();
        if !id.is_none() {
            if let Some(conn) = self.connections.get(&id) {
                let defaulted = target.port() == 0 || target.is_any_interface();
                if conn.peer == *target
                    || (defaulted && conn.peer.transport_type() == target.transport_type())
                {
                    return Some(id);
                }
            }
            if target.only_use_existing_connection() {
                return None;
            }
        }
        self.by_addr.get(target).copied()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<C>> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<C>> {
        self.connections.get_mut(&id)
    }

    /// Remove a connection from every index
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection<C>> {
        let conn = self.connections.remove(&id)?;
        debug!(connection = %id, peer = %conn.peer, "removing connection");
        if self.by_addr.get(&conn.peer) == Some(&id) {
            self.by_addr.remove(&conn.peer);
        }
        self.lru.remove(&conn.lru_seq);
        self.read_set.remove(&id);
        self.write_set.remove(&id);
        Some(conn)
    }

    /// Record activity: reset the idle clock and move to the LRU tail
    pub fn touch(&mut self, id: ConnectionId, now: Instant) -> bool {
        let seq = self.bump_seq();
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        self.lru.remove(&conn.lru_seq);
        conn.lru_seq = seq;
        conn.last_used = now;
        self.lru.insert(seq, id);
        true
    }

    /// Queue output on a connection, putting it in the write set
    pub fn queue_write(&mut self, id: ConnectionId, data: SendData) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        conn.outgoing.push_back(data);
        self.write_set.insert(id);
        true
    }

    /// Connections with queued output
    pub fn writable(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.write_set.iter().copied()
    }

    /// All live connections
    pub fn readable(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.read_set.iter().copied()
    }

    /// Hand queued output to `write`, oldest first per connection.
    ///
    /// A connection leaves the write set once its queue is empty. A buffer
    /// refused with [`WriteOutcome::WouldBlock`] stays queued. Connections
    /// whose writer reports [`WriteOutcome::Failed`] are returned so the
    /// caller can remove them; the refused buffer stays at the head of the
    /// queue so it can be reported with the rest.
    pub fn drain_writes(&mut self, mut write: impl FnMut(&C, SendData) -> WriteOutcome) -> Vec<ConnectionId> {
        let mut failed = Vec::new();
        let ids: Vec<ConnectionId> = self.write_set.iter().copied().collect();
        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else {
                self.write_set.remove(&id);
                continue;
            };
            while let Some(data) = conn.outgoing.pop_front() {
                match write(&conn.io, data.clone()) {
                    WriteOutcome::Written => {}
                    WriteOutcome::WouldBlock => {
                        conn.outgoing.push_front(data);
                        break;
                    }
                    WriteOutcome::Failed => {
                        conn.outgoing.push_front(data);
                        failed.push(id);
                        break;
                    }
                }
            }
            if conn.outgoing.is_empty() {
                self.write_set.remove(&id);
            }
        }
        failed
    }

    /// Oldest connection by last activity
    pub fn oldest(&self) -> Option<&Connection<C>> {
        self.lru.values().next().and_then(|id| self.connections.get(id))
    }

    /// Remove connections idle for longer than `max_age`.
    ///
    /// Walks the LRU list from the oldest entry and stops at the first
    /// connection used within `max_age`. `max_to_remove` caps the number of
    /// removals, zero meaning no cap.
    pub fn gc(&mut self, max_age: Duration, max_to_remove: usize, now: Instant) -> Vec<Connection<C>> {
        let threshold = now.checked_sub(max_age);
        let mut victims = Vec::new();
        for id in self.lru.values() {
            if max_to_remove != 0 && victims.len() >= max_to_remove {
                break;
            }
            let Some(conn) = self.connections.get(id) else {
                continue;
            };
            match threshold {
                Some(threshold) if conn.last_used < threshold => victims.push(*id),
                _ => break,
            }
        }

        if !victims.is_empty() {
            debug!(count = victims.len(), "garbage collecting idle connections");
        }
        victims
            .into_iter()
            .filter_map(|id| self.remove_connection(id))
            .collect()
    }

    /// Remove every connection
    pub fn drain(&mut self) -> Vec<Connection<C>> {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.remove_connection(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::TransportType;
    use bytes::Bytes;

    fn peer(s: &str) -> Tuple {
        Tuple::new(s.parse().unwrap(), TransportType::Tcp)
    }

    fn data(payload: &'static [u8], tid: &str) -> SendData {
        SendData::message(peer("10.0.0.1:5060"), Bytes::from_static(payload), tid, true)
    }

    fn manager_with_ages(base: Instant, ages_ms: &[u64]) -> (ConnectionManager<()>, Vec<ConnectionId>) {
        let mut mgr = ConnectionManager::new();
        let ids = ages_ms
            .iter()
            .enumerate()
            .map(|(i, offset)| {
                mgr.add_connection(
                    peer(&format!("10.0.0.{}:5060", i + 1)),
                    base + Duration::from_millis(*offset),
                    |_| (),
                )
            })
            .collect();
        (mgr, ids)
    }

    #[test]
    fn test_lookup_by_address_and_id() {
        let now = Instant::now();
        let mut mgr = ConnectionManager::new();
        let id = mgr.add_connection(peer("10.0.0.1:5060"), now, |_| ());

        assert_eq!(mgr.find_connection(&peer("10.0.0.1:5060")), Some(id));
        assert_eq!(mgr.find_connection(&peer("10.0.0.1:5060").with_connection_id(id)), Some(id));
        assert_eq!(mgr.get(id).unwrap().peer().connection_id(), id);
        assert_eq!(mgr.find_connection(&peer("10.0.0.2:5060")), None);
    }

    #[test]
    fn test_id_match_with_defaulted_port() {
        let now = Instant::now();
        let mut mgr = ConnectionManager::new();
        let id = mgr.add_connection(peer("10.0.0.1:40000"), now, |_| ());

        let defaulted = peer("10.0.0.1:0").with_connection_id(id);
        assert_eq!(mgr.find_connection(&defaulted), Some(id));

        let wrong = peer("10.0.0.9:5060")
            .with_connection_id(id)
            .with_only_existing_connection(true);
        assert_eq!(mgr.find_connection(&wrong), None);
    }

    #[test]
    fn test_only_existing_connection_with_stale_id() {
        let now = Instant::now();
        let mut mgr = ConnectionManager::new();
        let id = mgr.add_connection(peer("10.0.0.1:5060"), now, |_| ());
        mgr.remove_connection(id);

        let stale = peer("10.0.0.1:5060")
            .with_connection_id(id)
            .with_only_existing_connection(true);
        assert_eq!(mgr.find_connection(&stale), None);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_gc_removes_exact_idle_prefix() {
        let base = Instant::now();
        let (mut mgr, ids) = manager_with_ages(base, &[0, 10, 20, 30, 40]);
        let now = base + Duration::from_millis(125);

        // threshold = now - 100ms = base + 25ms
        let removed = mgr.gc(Duration::from_millis(100), 0, now);
        let removed_ids: Vec<_> = removed.iter().map(|c| c.id()).collect();
        assert_eq!(removed_ids, ids[..3].to_vec());
        assert_eq!(mgr.len(), 2);
        assert_eq!(mgr.oldest().unwrap().id(), ids[3]);
    }

    #[test]
    fn test_gc_stops_at_first_recent_entry() {
        let base = Instant::now();
        let (mut mgr, ids) = manager_with_ages(base, &[0, 10, 20]);
        // refresh the oldest: LRU order becomes ids[1], ids[2], ids[0]
        mgr.touch(ids[0], base + Duration::from_millis(500));

        let removed = mgr.gc(Duration::from_millis(100), 0, base + Duration::from_millis(200));
        let removed_ids: Vec<_> = removed.iter().map(|c| c.id()).collect();
        assert_eq!(removed_ids, vec![ids[1], ids[2]]);
        assert!(mgr.get(ids[0]).is_some());
    }

    #[test]
    fn test_gc_respects_cap() {
        let base = Instant::now();
        let (mut mgr, ids) = manager_with_ages(base, &[0, 1, 2, 3]);
        let removed = mgr.gc(Duration::from_millis(10), 2, base + Duration::from_secs(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(mgr.oldest().unwrap().id(), ids[2]);
    }

    #[test]
    fn test_write_set_is_transient() {
        let now = Instant::now();
        let mut mgr = ConnectionManager::new();
        let a = mgr.add_connection(peer("10.0.0.1:5060"), now, |_| ());
        let b = mgr.add_connection(peer("10.0.0.2:5060"), now, |_| ());

        assert!(mgr.queue_write(a, data(b"one", "t1")));
        assert!(mgr.queue_write(b, data(b"two", "t2")));
        assert_eq!(mgr.writable().count(), 2);

        let mut written = Vec::new();
        let failed = mgr.drain_writes(|_, data| {
            written.push(data);
            WriteOutcome::Written
        });
        assert!(failed.is_empty());
        assert_eq!(written.len(), 2);
        assert_eq!(mgr.writable().count(), 0);
        assert_eq!(mgr.readable().count(), 2);
    }

    #[test]
    fn test_would_block_keeps_connection_writable() {
        let now = Instant::now();
        let mut mgr = ConnectionManager::new();
        let a = mgr.add_connection(peer("10.0.0.1:5060"), now, |_| ());
        mgr.queue_write(a, data(b"one", "t1"));

        mgr.drain_writes(|_, _| WriteOutcome::WouldBlock);
        assert!(mgr.get(a).unwrap().has_pending_writes());
        assert_eq!(mgr.writable().collect::<Vec<_>>(), vec![a]);

        let failed = mgr.drain_writes(|_, _| WriteOutcome::Failed);
        assert_eq!(failed, vec![a]);
    }

    #[test]
    fn test_failed_write_stays_queued_for_reporting() {
        let now = Instant::now();
        let mut mgr = ConnectionManager::new();
        let a = mgr.add_connection(peer("10.0.0.1:5060"), now, |_| ());
        mgr.queue_write(a, data(b"one", "t1"));
        mgr.queue_write(a, data(b"two", "t2"));

        let failed = mgr.drain_writes(|_, _| WriteOutcome::Failed);
        assert_eq!(failed, vec![a]);

        let mut conn = mgr.remove_connection(a).unwrap();
        let pending: Vec<String> = conn
            .take_pending_writes()
            .into_iter()
            .map(|d| d.transaction_id)
            .collect();
        assert_eq!(pending, vec!["t1".to_string(), "t2".to_string()]);
        assert!(!conn.has_pending_writes());
    }

    #[test]
    fn test_removal_clears_every_index() {
        let now = Instant::now();
        let mut mgr = ConnectionManager::new();
        let a = mgr.add_connection(peer("10.0.0.1:5060"), now, |_| ());
        mgr.queue_write(a, data(b"x", "t1"));
        assert!(mgr.remove_connection(a).is_some());
        assert_eq!(mgr.readable().count(), 0);
        assert_eq!(mgr.writable().count(), 0);
        assert!(mgr.oldest().is_none());
        assert!(mgr.find_connection(&peer("10.0.0.1:5060")).is_none());
    }
}
