//! Reconnect backoff policy.
//!
//! Exponential backoff with a hard cap and optional jitter. The attempt
//! counter is owned by the transport and reset after every successful
//! handshake.

use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for reconnecting a lost session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum reconnect attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on a single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Add up to half the base delay of random jitter.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_true(),
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Whether attempt number `attempt` (1-based) is still allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Delay to wait before attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);

        // 2^(attempt-1), saturating for absurd attempt counts.
        let multiplier = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let capped = base.checked_mul(multiplier).unwrap_or(max).min(max);

        if !self.jitter {
            return capped;
        }

        let jitter_limit_ms = (self.base_delay_ms / 2)
            .min(u64::try_from(max.saturating_sub(capped).as_millis()).unwrap_or(0));
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(max)
    }
}
