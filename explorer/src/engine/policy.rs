//! Transition policy: retry with capped exponential backoff, then optionally
//! backtrack to an earlier node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use shared_types::NodeName;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let scaled = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(scaled.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPolicy {
    pub retry: RetryPolicy,
    pub backtrack_to: Option<NodeName>,
}

impl TransitionPolicy {
    pub fn retry(retry: RetryPolicy) -> Self {
        Self {
            retry,
            backtrack_to: None,
        }
    }

    pub fn with_backtrack(retry: RetryPolicy, to: NodeName) -> Self {
        Self {
            retry,
            backtrack_to: Some(to),
        }
    }

    /// Single attempt, never backtracks. Any failure ends the run.
    pub fn terminal() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay_ms: 0,
                max_delay_ms: 0,
            },
            backtrack_to: None,
        }
    }
}

/// What the engine does after a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry { delay: Duration },
    Backtrack { to: NodeName },
    Fail,
}

/// Decide the reaction to the `attempt`-th consecutive failure of a node.
///
/// `backtracks_left` is false once the run has used its backtrack ceiling.
pub fn on_failure(
    policy: &TransitionPolicy,
    attempt: u32,
    retryable: bool,
    backtracks_left: bool,
) -> FailureAction {
    if !retryable {
        return FailureAction::Fail;
    }
    if attempt < policy.retry.max_attempts {
        return FailureAction::Retry {
            delay: policy.retry.backoff(attempt),
        };
    }
    match policy.backtrack_to {
        Some(to) if backtracks_left => FailureAction::Backtrack { to },
        _ => FailureAction::Fail,
    }
}
