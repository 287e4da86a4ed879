//! Stack configuration.
//!
//! Every field has a default, so a JSON document only needs the values it
//! changes:
//!
//! ```
//! use rvoip_stack_transaction::config::StackConfig;
//!
//! let config = StackConfig::from_json(r#"{"timers": {"t1": 250}, "discard_stray_responses": false}"#).unwrap();
//! assert_eq!(config.timers.t1.as_millis(), 250);
//! assert!(!config.discard_stray_responses);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use rvoip_stack_transport::TcpConfig;

use crate::error::{Error, Result};
use crate::fifo::FifoLimits;
use crate::timer::{duration_ms, TimerSettings};

/// Configuration of a transaction stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub timers: TimerSettings,
    /// Drop responses that match no client transaction instead of passing
    /// them to the TU
    pub discard_stray_responses: bool,
    /// Rewrite Call-ID and From/To tags of responses that disagree with the
    /// request they answer
    pub fix_bad_dialog_identifiers: bool,
    /// Rewrite the CSeq number of responses that disagree with the request
    pub fix_bad_cseq_numbers: bool,
    /// Load thresholds of the controller queue
    pub fifo: FifoLimits,
    /// How long a failed target is tried last
    #[serde(with = "duration_ms")]
    pub greylist_duration: Duration,
    /// Agent name placed in Warning headers
    pub hostname: String,
    /// Connection management of TCP transports created by the stack
    pub tcp: TcpConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            timers: TimerSettings::default(),
            discard_stray_responses: true,
            fix_bad_dialog_identifiers: true,
            fix_bad_cseq_numbers: true,
            fifo: FifoLimits::default(),
            greylist_duration: Duration::from_secs(32),
            hostname: "rvoip".to_string(),
            tcp: TcpConfig::default(),
        }
    }
}

impl StackConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StackConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.timers.validate()?;
        if self.hostname.trim().is_empty() {
            return Err(Error::config("hostname must not be empty"));
        }
        let fifo = self.fifo;
        if fifo.reject_non_essential_depth > 0 && fifo.reject_new_work_depth > fifo.reject_non_essential_depth {
            return Err(Error::config("FIFO new-work limit must not exceed the non-essential limit"));
        }
        Ok(())
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_discard_stray_responses(mut self, discard: bool) -> Self {
        self.discard_stray_responses = discard;
        self
    }

    pub fn with_fix_bad_dialog_identifiers(mut self, fix: bool) -> Self {
        self.fix_bad_dialog_identifiers = fix;
        self
    }

    pub fn with_fix_bad_cseq_numbers(mut self, fix: bool) -> Self {
        self.fix_bad_cseq_numbers = fix;
        self
    }

    pub fn with_fifo_limits(mut self, limits: FifoLimits) -> Self {
        self.fifo = limits;
        self
    }

    pub fn with_greylist_duration(mut self, duration: Duration) -> Self {
        self.greylist_duration = duration;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_tcp(mut self, tcp: TcpConfig) -> Self {
        self.tcp = tcp;
        self
    }
}
