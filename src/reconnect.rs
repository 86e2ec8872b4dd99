use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::types::{DisconnectReason, ReconnectConfig};

/// Reconnect attempts made for one device since its last successful connect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectAttemptRecord {
    /// Attempts made so far
    pub count: u32,
    /// When the last attempt started
    pub last_attempt: Option<SystemTime>,
}

impl ReconnectAttemptRecord {
    /// Count a new attempt
    pub fn record_attempt(&mut self, at: SystemTime) {
        self.count = self.count.saturating_add(1);
        self.last_attempt = Some(at);
    }

    /// Forget previous attempts after a successful connect
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What to do after a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reconnect immediately
    RetryNow,
    /// Reconnect once the delay has passed
    RetryAfter(Duration),
    /// Stop trying
    GiveUp,
}

/// Decides whether and when to reconnect after a disconnect
///
/// The policy is a pure function of its inputs:
/// - user-initiated disconnects are never retried
/// - a foreground signal from the host app retries link loss right away
/// - the first `immediate_attempts` retries happen immediately
/// - later retries back off exponentially from `base_delay_ms`, capped at
///   `max_delay_ms`
/// - after `max_attempts` the policy gives up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    /// Create a policy from configuration
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Decide the next step for a device
    #[must_use]
    pub fn decide(
        &self,
        record: &ReconnectAttemptRecord,
        reason: DisconnectReason,
        foreground: bool,
    ) -> ReconnectDecision {
        match reason {
            DisconnectReason::UserInitiated => ReconnectDecision::GiveUp,
            DisconnectReason::LinkLoss if foreground => ReconnectDecision::RetryNow,
            DisconnectReason::LinkLoss if record.count < self.config.immediate_attempts => {
                ReconnectDecision::RetryNow
            }
            DisconnectReason::LinkLoss if record.count < self.config.max_attempts => {
                ReconnectDecision::RetryAfter(self.backoff(record.count))
            }
            DisconnectReason::LinkLoss => ReconnectDecision::GiveUp,
        }
    }

    /// Backoff delay for an attempt count past the immediate retries
    #[must_use]
    pub fn backoff(&self, count: u32) -> Duration {
        let exponent = count.saturating_sub(self.config.immediate_attempts);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay_ms = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}
