use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use tracing::trace;

use super::{TimerKind, TimerMessage};
use crate::transaction::TransactionId;

#[derive(Debug)]
struct Entry {
    when: Instant,
    // insertion order breaks ties so equal deadlines fire FIFO
    seq: u64,
    message: TimerMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.when.cmp(&other.when).then(self.seq.cmp(&other.seq))
    }
}

/// Delay queue of armed transaction timers.
///
/// The queue knows nothing about time passing: callers hand in `now` when
/// arming and when collecting, which keeps the transaction layer
/// deterministic under test.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` for `transaction_id`, firing `duration` after `now`
    pub fn add(&mut self, kind: TimerKind, transaction_id: TransactionId, duration: Duration, now: Instant) {
        trace!(tid = %transaction_id, timer = %kind, ms = duration.as_millis() as u64, "arming timer");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            when: now + duration,
            seq,
            message: TimerMessage {
                transaction_id,
                kind,
                duration,
            },
        }));
    }

    /// Deadline of the earliest armed timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.when)
    }

    /// Time until the earliest timer fires, zero if one is already due
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.next_deadline().map(|when| when.saturating_duration_since(now))
    }

    /// Remove the earliest timer if it is due at `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerMessage> {
        if self.next_deadline()? > now {
            return None;
        }
        self.heap.pop().map(|Reverse(e)| e.message)
    }

    /// Remove every timer due at `now`, in firing order
    pub fn drain_expired(&mut self, now: Instant) -> Vec<TimerMessage> {
        let mut fired = Vec::new();
        while let Some(message) = self.pop_expired(now) {
            fired.push(message);
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Armed timers for one transaction, earliest first. Used by tests and
    /// diagnostics.
    pub fn pending_for(&self, transaction_id: &TransactionId) -> Vec<(TimerKind, Instant)> {
        let mut entries: Vec<_> = self
            .heap
            .iter()
            .filter(|Reverse(e)| e.message.transaction_id == *transaction_id)
            .map(|Reverse(e)| (e.when, e.seq, e.message.kind))
            .collect();
        entries.sort_by_key(|(when, seq, _)| (*when, *seq));
        entries.into_iter().map(|(when, _, kind)| (kind, when)).collect()
    }
}
