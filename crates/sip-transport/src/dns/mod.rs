//! DNS target iteration
//!
//! A [`DnsResult`] is the per-transaction view of a resolved destination:
//! an ordered list of candidate [`Tuple`]s that the owning transaction
//! walks with [`DnsResult::next`], feeding back what happened to the last
//! candidate it used (grey/black/white listing). Marks are stored in a
//! shared [`TargetMarks`] table so that later transactions to the same
//! destination benefit from them.
//!
//! Resolution itself is delegated to a [`DnsResolver`]; its completion is
//! handed to the transaction layer, which serializes it through its event
//! queue before calling [`DnsResult::resolved`].

mod resolver;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

pub use resolver::{target_transport, DnsCallback, DnsOutcome, DnsResolver, HickoryResolver, StaticResolver};

use crate::message::Uri;
use crate::tuple::Tuple;

/// What a [`DnsResult`] can offer right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsAvailability {
    /// A candidate can be taken with `next()`
    Available,
    /// Resolution is still in progress
    Pending,
    /// No candidates are left
    Finished,
    /// The result was destroyed by its owner
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkKind {
    Grey,
    Black,
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    kind: MarkKind,
    expires: Instant,
}

// Hosts remembered with a preferred target
const MAX_PREFERRED_TARGETS: usize = 1024;

/// Shared grey/black/white list of resolved targets.
///
/// Expired grey and black marks are dropped whenever a new mark is made,
/// and the preferred-target table is capped, so neither grows without
/// bound.
#[derive(Debug, Clone, Default)]
pub struct TargetMarks {
    marks: Arc<DashMap<Tuple, Mark>>,
    preferred: Arc<DashMap<String, Tuple>>,
}

impl TargetMarks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark(&self, tuple: &Tuple, kind: MarkKind, now: Instant, expires: Instant) {
        self.purge_expired(now);
        self.marks.insert(tuple.clone(), Mark { kind, expires });
    }

    /// Drop marks that expired by `now`, returning how many were dropped
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.marks.len();
        self.marks.retain(|_, mark| mark.expires > now);
        before - self.marks.len()
    }

    /// Number of live grey and black marks
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    fn status(&self, tuple: &Tuple, now: Instant) -> Option<MarkKind> {
        let mark = *self.marks.get(tuple)?;
        if mark.expires <= now {
            self.marks.remove_if(tuple, |_, m| m.expires <= now);
            return None;
        }
        Some(mark.kind)
    }

    /// Whether `tuple` is currently greylisted
    pub fn is_greylisted(&self, tuple: &Tuple, now: Instant) -> bool {
        self.status(tuple, now) == Some(MarkKind::Grey)
    }

    /// Whether `tuple` is currently blacklisted
    pub fn is_blacklisted(&self, tuple: &Tuple, now: Instant) -> bool {
        self.status(tuple, now) == Some(MarkKind::Black)
    }

    fn prefer(&self, target: &str, tuple: &Tuple) {
        self.marks.remove(tuple);
        let key = target.to_ascii_lowercase();
        if !self.preferred.contains_key(&key) && self.preferred.len() >= MAX_PREFERRED_TARGETS {
            let victim = self.preferred.iter().next().map(|entry| entry.key().clone());
            if let Some(victim) = victim {
                self.preferred.remove(&victim);
            }
        }
        self.preferred.insert(key, tuple.clone());
    }

    fn preferred(&self, target: &str) -> Option<Tuple> {
        self.preferred.get(&target.to_ascii_lowercase()).map(|t| t.clone())
    }
}

/// Candidate targets for one destination, consumed by one transaction
#[derive(Debug)]
pub struct DnsResult {
    target: Uri,
    marks: TargetMarks,
    candidates: VecDeque<Tuple>,
    last: Option<Tuple>,
    pending: bool,
    destroyed: bool,
}

impl DnsResult {
    /// A result waiting for resolution of `target`
    pub fn new(target: Uri, marks: TargetMarks) -> Self {
        Self {
            target,
            marks,
            candidates: VecDeque::new(),
            last: None,
            pending: true,
            destroyed: false,
        }
    }

    pub fn target(&self) -> &Uri {
        &self.target
    }

    /// Install the resolved candidates, ending the pending phase.
    ///
    /// A candidate previously whitelisted for this target moves to the front.
    pub fn resolved(&mut self, mut candidates: Vec<Tuple>) {
        self.pending = false;
        if let Some(preferred) = self.marks.preferred(&self.target.host) {
            if let Some(pos) = candidates.iter().position(|c| *c == preferred) {
                let tuple = candidates.remove(pos);
                candidates.insert(0, tuple);
            }
        }
        debug!(uri = %self.target, count = candidates.len(), "DNS candidates installed");
        self.candidates = candidates.into();
    }

    pub fn available(&self, now: Instant) -> DnsAvailability {
        if self.destroyed {
            DnsAvailability::Destroyed
        } else if self.pending {
            DnsAvailability::Pending
        } else if self.candidates.iter().any(|c| !self.marks.is_blacklisted(c, now)) {
            DnsAvailability::Available
        } else {
            DnsAvailability::Finished
        }
    }

    /// Take the next candidate.
    ///
    /// Unmarked candidates come first in resolution order, then greylisted
    /// ones; blacklisted candidates are skipped. Returns `None` once the
    /// result is no longer [`DnsAvailability::Available`].
    pub fn next(&mut self, now: Instant) -> Option<Tuple> {
        if self.available(now) != DnsAvailability::Available {
            return None;
        }
        self.candidates.retain(|c| !self.marks.is_blacklisted(c, now));
        let pos = self
            .candidates
            .iter()
            .position(|c| !self.marks.is_greylisted(c, now))
            .unwrap_or(0);
        let tuple = self.candidates.remove(pos)?;
        self.last = Some(tuple.clone());
        Some(tuple)
    }

    /// Blacklist the last returned candidate for `duration`
    pub fn blacklist_last(&mut self, now: Instant, duration: Duration) -> bool {
        match &self.last {
            Some(last) => {
                debug!(tuple = %last, "blacklisting target");
                self.marks.mark(last, MarkKind::Black, now, now + duration);
                true
            }
            None => false,
        }
    }

    /// Greylist the last returned candidate for `duration`
    pub fn greylist_last(&mut self, now: Instant, duration: Duration) -> bool {
        match &self.last {
            Some(last) => {
                debug!(tuple = %last, "greylisting target");
                self.marks.mark(last, MarkKind::Grey, now, now + duration);
                true
            }
            None => false,
        }
    }

    /// Record that the last returned candidate worked
    pub fn whitelist_last(&mut self) {
        if let Some(last) = &self.last {
            self.marks.prefer(&self.target.host, last);
        }
    }

    pub fn destroy(&mut self) {
        self.destroyed = true;
        self.candidates.clear();
    }
}
