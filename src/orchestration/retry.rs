//! Retry policy for failed transfers.
//!
//! A failed task is requeued automatically by the next scheduler run while
//! its retry budget lasts. The budget is counted from the task's own
//! `attempts`, so it survives restarts and stays scoped to the campaign the
//! task belongs to. Each retried transfer waits an exponentially growing
//! backoff first.

use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::core::{Task, TaskStatus};

/// Default maximum number of automatic retries per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound on a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Decides when a failed task may be retried and how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum automatic retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each later one.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: Duration::from_millis(500),
        }
    }
}

impl From<&SchedulerConfig> for RetryPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: config.retry_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
        }
    }

    /// Retries already spent on a task.
    pub fn retries_used(&self, task: &Task) -> u32 {
        task.attempts.saturating_sub(1)
    }

    /// Whether a failed task has used up its automatic retries.
    pub fn is_exhausted(&self, task: &Task) -> bool {
        task.status == TaskStatus::Failed && self.retries_used(task) >= self.max_retries
    }

    /// Whether the scheduler may requeue this task on its own.
    pub fn should_retry(&self, task: &Task) -> bool {
        task.status == TaskStatus::Failed && !self.is_exhausted(task)
    }

    /// Delay before the given retry (1-based), capped at `MAX_BACKOFF`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}
