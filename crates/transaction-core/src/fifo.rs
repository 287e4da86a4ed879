//! Depth-tracked queues with load shedding hints.
//!
//! Producers never block. Instead both ends can ask the queue how loaded
//! it is ([`RejectionBehavior`]) and shed work accordingly: the controller
//! refuses new requests when its own queue or the target TU's queue is
//! rejecting new work, and stops retransmitting when it is rejecting
//! non-essential work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Depth thresholds. Zero disables a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FifoLimits {
    /// Depth from which new requests are refused
    pub reject_new_work_depth: usize,
    /// Depth from which retransmissions and other optional work are skipped
    pub reject_non_essential_depth: usize,
}

impl Default for FifoLimits {
    fn default() -> Self {
        Self {
            reject_new_work_depth: 10_000,
            reject_non_essential_depth: 20_000,
        }
    }
}

impl FifoLimits {
    /// Limits that never reject
    pub fn unlimited() -> Self {
        Self {
            reject_new_work_depth: 0,
            reject_non_essential_depth: 0,
        }
    }

    pub fn behavior_at(&self, depth: usize) -> RejectionBehavior {
        if self.reject_non_essential_depth > 0 && depth >= self.reject_non_essential_depth {
            RejectionBehavior::RejectingNonEssential
        } else if self.reject_new_work_depth > 0 && depth >= self.reject_new_work_depth {
            RejectionBehavior::RejectingNewWork
        } else {
            RejectionBehavior::Normal
        }
    }
}

/// How loaded a queue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RejectionBehavior {
    #[default]
    Normal,
    RejectingNewWork,
    RejectingNonEssential,
}

/// Create a queue with the given limits
pub fn channel<T>(limits: FifoLimits) -> (FifoSender<T>, FifoReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        FifoSender {
            tx,
            depth: depth.clone(),
            limits,
        },
        FifoReceiver { rx, depth, limits },
    )
}

/// Producer side
#[derive(Debug)]
pub struct FifoSender<T> {
    tx: mpsc::UnboundedSender<T>,
    depth: Arc<AtomicUsize>,
    limits: FifoLimits,
}

impl<T> Clone for FifoSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
            limits: self.limits,
        }
    }
}

impl<T> FifoSender<T> {
    pub fn add(&self, item: T) -> Result<()> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.tx.send(item).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            Error::Shutdown
        })
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rejection_behavior(&self) -> RejectionBehavior {
        self.limits.behavior_at(self.len())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side
#[derive(Debug)]
pub struct FifoReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    depth: Arc<AtomicUsize>,
    limits: FifoLimits,
}

impl<T> FifoReceiver<T> {
    /// Wait for the next item; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    /// Take the next item if one is queued
    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    /// Take everything currently queued
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rejection_behavior(&self) -> RejectionBehavior {
        self.limits.behavior_at(self.len())
    }
}
