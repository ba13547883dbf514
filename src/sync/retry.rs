//! Retry policy and outcome for multi-pass syncs.

use serde::Serialize;
use std::time::Duration;

use super::GuardFailure;

/// Bounded exponential backoff between drain passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(60),
    }
  }
}

impl RetryPolicy {
  /// Delay after a failed `attempt` (1-based): `base * 2^(attempt-1)`, capped.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    self
      .base_delay
      .saturating_mul(1u32 << exponent)
      .min(self.max_delay)
  }

  /// Fast retry for tests
  #[cfg(test)]
  pub fn test() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(10),
    }
  }
}

/// Summary of a `sync_with_retry` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
  /// True when a pass left nothing failed
  pub success: bool,
  /// Drain passes that actually ran
  pub attempts: u32,
  /// Items applied across all passes
  pub synced: usize,
  /// Items still failing after the last pass
  pub failed: usize,
  pub last_error: Option<String>,
  /// Set when a precondition stopped the loop
  pub guard: Option<GuardFailure>,
}
