//! Transaction timers.
//!
//! This module provides:
//! - [`TimerKind`]: the timers a transaction can arm. Their names ("TimerA",
//!   "TimerE1", "TimerStaleServer", ...) show up in logs and are stable.
//! - [`TimerMessage`]: a fired timer, delivered back into the transaction
//!   event queue.
//! - [`TimerSettings`]: the RFC 3261 base values and the durations derived
//!   from them.
//! - [`TimerQueue`]: the delay queue holding armed timers.
//!
//! # SIP Timer Protocol Requirements
//!
//! - **Retransmission timers** (A, E1/E2, G) resend the last message over
//!   unreliable transports, doubling from T1 (A without bound, E and G up
//!   to T2).
//! - **Timeout timers** (B, F, H) bound the lifetime of a transaction.
//! - **Wait timers** (D, I, J, K) keep a finished transaction around long
//!   enough to absorb retransmissions.
//!
//! Timers are never cancelled. A timer that fires after its transaction
//! moved on is simply ignored by the state machine, so a transaction can
//! have several entries of the same kind outstanding.

mod queue;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use queue::TimerQueue;

use crate::transaction::TransactionId;

/// Timers armed by transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Client INVITE retransmission, doubling every fire while Calling
    A,
    /// Client INVITE timeout
    B,
    /// Client INVITE wait for response retransmissions after a failure
    D,
    /// Client non-INVITE retransmission while Trying
    E1,
    /// Client non-INVITE retransmission while Proceeding
    E2,
    /// Client non-INVITE timeout
    F,
    /// Server INVITE final response retransmission
    G,
    /// Server INVITE wait for ACK
    H,
    /// Server INVITE wait for ACK retransmissions
    I,
    /// Server non-INVITE wait for request retransmissions
    J,
    /// Client non-INVITE wait for response retransmissions
    K,
    /// Delayed 100 Trying for server transactions
    Trying,
    /// Client INVITE that was cancelled but never saw a final response
    CleanUp,
    /// Lifetime of a stateless transaction
    Stateless,
    /// Lifetime of a client INVITE after a 2xx
    StaleClient,
    /// Lifetime of a server INVITE after a 2xx
    StaleServer,
}

impl TimerKind {
    /// Whether the timer belongs to a client transaction.
    ///
    /// Stateless transactions live in the client map.
    pub fn is_client(self) -> bool {
        match self {
            TimerKind::A
            | TimerKind::B
            | TimerKind::D
            | TimerKind::E1
            | TimerKind::E2
            | TimerKind::F
            | TimerKind::K
            | TimerKind::CleanUp
            | TimerKind::Stateless
            | TimerKind::StaleClient => true,
            TimerKind::G
            | TimerKind::H
            | TimerKind::I
            | TimerKind::J
            | TimerKind::Trying
            | TimerKind::StaleServer => false,
        }
    }

    /// Retransmission timers, which may be postponed under load
    pub fn is_retransmission(self) -> bool {
        matches!(self, TimerKind::A | TimerKind::E1 | TimerKind::E2 | TimerKind::G)
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerKind::A => "TimerA",
            TimerKind::B => "TimerB",
            TimerKind::D => "TimerD",
            TimerKind::E1 => "TimerE1",
            TimerKind::E2 => "TimerE2",
            TimerKind::F => "TimerF",
            TimerKind::G => "TimerG",
            TimerKind::H => "TimerH",
            TimerKind::I => "TimerI",
            TimerKind::J => "TimerJ",
            TimerKind::K => "TimerK",
            TimerKind::Trying => "TimerTrying",
            TimerKind::CleanUp => "TimerCleanUp",
            TimerKind::Stateless => "TimerStateless",
            TimerKind::StaleClient => "TimerStaleClient",
            TimerKind::StaleServer => "TimerStaleServer",
        };
        f.write_str(name)
    }
}

/// A fired timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerMessage {
    pub transaction_id: TransactionId,
    pub kind: TimerKind,
    /// The duration the timer was armed with
    pub duration: Duration,
}

impl TimerMessage {
    pub fn is_client(&self) -> bool {
        self.kind.is_client()
    }
}

impl fmt::Display for TimerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tid={} {}ms", self.kind, self.transaction_id, self.duration.as_millis())
    }
}

/// RFC 3261 timer values.
///
/// Only the base values are configurable; everything else is derived the
/// way RFC 3261 section 17 and RFC 4320 describe.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rvoip_stack_transaction::timer::TimerSettings;
///
/// let settings = TimerSettings::default();
/// assert_eq!(settings.timer_b(), Duration::from_secs(32));
/// assert_eq!(settings.nit_100(), Duration::from_millis(3500));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    /// **T1: RTT estimate (default 500 ms).** First retransmission interval.
    #[serde(with = "duration_ms")]
    pub t1: Duration,
    /// **T2: maximum retransmission interval (default 4 s)** for non-INVITE
    /// requests and INVITE responses.
    #[serde(with = "duration_ms")]
    pub t2: Duration,
    /// **T4: maximum time a message stays in the network (default 5 s).**
    #[serde(with = "duration_ms")]
    pub t4: Duration,
    /// Timer D (default 32 s)
    #[serde(with = "duration_ms")]
    pub td: Duration,
    /// Delay before a 100 Trying is sent for an INVITE (default 80 ms).
    /// Zero sends it as soon as the INVITE arrives.
    #[serde(with = "duration_ms")]
    pub t100: Duration,
    /// Lifetime of stateless and stale transactions (default 32 s)
    #[serde(with = "duration_ms")]
    pub ts: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            td: Duration::from_secs(32),
            t100: Duration::from_millis(80),
            ts: Duration::from_secs(32),
        }
    }
}

impl TimerSettings {
    /// Timer B, 64*T1
    pub fn timer_b(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer F, 64*T1
    pub fn timer_f(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer H, 64*T1
    pub fn timer_h(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer J, 64*T1
    pub fn timer_j(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer I, T4
    pub fn timer_i(&self) -> Duration {
        self.t4
    }

    /// Timer K, T4
    pub fn timer_k(&self) -> Duration {
        self.t4
    }

    /// Cleanup delay for a cancelled client INVITE, 128*T1
    pub fn timer_cleanup(&self) -> Duration {
        self.t1 * 128
    }

    /// When a non-INVITE server transaction sends its 100 Trying (RFC 4320):
    /// the time Timer E needs to reach T2, i.e. the sum of the doubling
    /// intervals while they stay below T2.
    pub fn nit_100(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut interval = self.t1;
        while !interval.is_zero() && interval < self.t2 {
            total += interval;
            interval *= 2;
        }
        total
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.t1.is_zero() {
            return Err(crate::Error::config("T1 must be non-zero"));
        }
        if self.t2 < self.t1 {
            return Err(crate::Error::config("T2 must not be smaller than T1"));
        }
        Ok(())
    }
}

/// Serde helper storing a [`Duration`] as integer milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_names() {
        assert_eq!(TimerKind::A.to_string(), "TimerA");
        assert_eq!(TimerKind::E1.to_string(), "TimerE1");
        assert_eq!(TimerKind::CleanUp.to_string(), "TimerCleanUp");
        assert_eq!(TimerKind::StaleServer.to_string(), "TimerStaleServer");
    }

    #[test]
    fn test_timer_ownership() {
        assert!(TimerKind::A.is_client());
        assert!(TimerKind::Stateless.is_client());
        assert!(!TimerKind::Trying.is_client());
        assert!(!TimerKind::G.is_client());
    }

    #[test]
    fn test_default_durations() {
        let s = TimerSettings::default();
        assert_eq!(s.timer_b(), Duration::from_secs(32));
        assert_eq!(s.timer_h(), Duration::from_secs(32));
        assert_eq!(s.timer_k(), Duration::from_secs(5));
        assert_eq!(s.timer_cleanup(), Duration::from_secs(64));
        assert_eq!(s.nit_100(), Duration::from_millis(3500));
    }

    #[test]
    fn test_nit_100_tracks_t1() {
        let s = TimerSettings {
            t1: Duration::from_millis(100),
            t2: Duration::from_millis(1000),
            ..Default::default()
        };
        // 100 + 200 + 400 + 800
        assert_eq!(s.nit_100(), Duration::from_millis(1500));
    }

    #[test]
    fn test_settings_json() {
        let s: TimerSettings = serde_json::from_str(r#"{"t1": 250, "t100": 0}"#).unwrap();
        assert_eq!(s.t1, Duration::from_millis(250));
        assert!(s.t100.is_zero());
        assert_eq!(s.t2, Duration::from_secs(4));
        assert!(s.validate().is_ok());

        let bad = TimerSettings {
            t1: Duration::ZERO,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
