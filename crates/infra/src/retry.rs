//! Retry/Backoff Handler.
//!
//! Decides, for a failed record, whether the logical job is re-dispatched and
//! after how long. The dispatch itself happens later, through the Job
//! Dispatcher, once the delay has passed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use jobctl_core::{FailureKind, JobRecord, UnitFailure};

use crate::config::ControlConfig;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// `base * 2^retry_count`
    #[default]
    Exponential,
    /// `base * retry_count`
    Linear,
}

/// Retry delay policy. Every strategy is capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    pub fn from_config(config: &ControlConfig) -> Self {
        Self::exponential(config.backoff_base(), config.backoff_cap())
    }

    /// Delay before the retry that will carry `retry_count`.
    ///
    /// The first retry (`retry_count = 1`) of an exponential policy waits
    /// `base * 2`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi(retry_count.min(62) as i32),
            BackoffStrategy::Linear => base_ms * f64::from(retry_count.max(1)),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }
}

/// What to do with a failed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-dispatch after `delay`, carrying `retry_count`.
    Retry { delay: Duration, retry_count: u32 },
    /// Terminal failure.
    GiveUp { reason: String },
}

/// Retry/backoff decisions for failed units.
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide for a record that ended in `Failed` with `failure`.
    ///
    /// Non-retryable failures give up regardless of the remaining budget; a
    /// record whose `retry_count` already equals `max_retries` always gives up.
    pub fn on_unit_failed(&self, record: &JobRecord, failure: &UnitFailure) -> RetryDecision {
        if !failure.kind.is_retryable() {
            warn!(
                job_id = %record.id,
                logical_name = %record.logical_name,
                kind = ?failure.kind,
                "non-retryable failure, giving up"
            );
            return RetryDecision::GiveUp {
                reason: format!("{} failure is not retryable: {}", kind_name(failure.kind), failure.message),
            };
        }

        if record.retry_count >= record.max_retries {
            warn!(
                job_id = %record.id,
                logical_name = %record.logical_name,
                retry_count = record.retry_count,
                max_retries = record.max_retries,
                "retry budget exhausted"
            );
            return RetryDecision::GiveUp {
                reason: format!(
                    "retry budget exhausted after {} of {} retries: {}",
                    record.retry_count, record.max_retries, failure.message
                ),
            };
        }

        let retry_count = record.retry_count + 1;
        let delay = self.policy.delay_for_retry(retry_count);
        info!(
            job_id = %record.id,
            logical_name = %record.logical_name,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        RetryDecision::Retry { delay, retry_count }
    }
}

fn kind_name(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Validation => "validation",
        FailureKind::Runtime => "runtime",
        FailureKind::Timeout => "timeout",
        FailureKind::RateLimited => "rate-limit",
        FailureKind::Engine => "engine",
        FailureKind::Rejected => "rejected",
    }
}
