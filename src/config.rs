//! Link timing configuration
//!
//! All bounds used by the connection manager and protocol engine live here so
//! they can be tuned per deployment. Durations are stored in milliseconds to
//! keep the JSON form readable.

use crate::types::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the link and protocol engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// How long one attempt waits for the transport to report "connected"
    pub connect_timeout_ms: u64,

    /// Delay between "connected" and service discovery
    pub settle_delay_ms: u64,

    /// Backoff before retry `n` is `n * backoff_step`
    pub backoff_step_ms: u64,

    pub max_connect_attempts: u32,

    /// Attempts per characteristic when enabling notifications
    pub subscribe_attempts: u32,

    pub subscribe_retry_delay_ms: u64,

    /// Pause between consecutive chunks of one message
    pub chunk_pause_ms: u64,

    /// Attempts per chunk write before the send is abandoned
    pub write_attempts: u32,

    /// Bound on a companion scan session
    pub scan_timeout_ms: u64,

    /// Duration of a scan on the local radio
    pub local_scan_timeout_ms: u64,

    /// Time without inbound traffic before the link counts as stalled
    pub stall_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            settle_delay_ms: 500,
            backoff_step_ms: 2_000,
            max_connect_attempts: 3,
            subscribe_attempts: 3,
            subscribe_retry_delay_ms: 200,
            chunk_pause_ms: 50,
            write_attempts: 2,
            scan_timeout_ms: 30_000,
            local_scan_timeout_ms: 15_000,
            stall_timeout_ms: 120_000,
        }
    }
}

impl LinkConfig {
    /// Load a configuration file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: LinkConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connect_attempts == 0 {
            return Err(LinkError::Config(
                "max_connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.subscribe_attempts == 0 {
            return Err(LinkError::Config(
                "subscribe_attempts must be at least 1".to_string(),
            ));
        }
        if self.write_attempts == 0 {
            return Err(LinkError::Config(
                "write_attempts must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(LinkError::Config(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }

    /// Wait before the retry that follows failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(attempt as u64))
    }

    pub fn subscribe_retry_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_retry_delay_ms)
    }

    pub fn chunk_pause(&self) -> Duration {
        Duration::from_millis(self.chunk_pause_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn local_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.local_scan_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}
