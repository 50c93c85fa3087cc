//! Bounded polling, the single primitive behind every wait in the crate.
//!
//! A poll repeatedly evaluates a predicate until it reports
//! [`PollStatus::Ready`], the [`PollBudget`] runs out, or the predicate returns
//! an error. "Not found" and "not yet" are both [`PollStatus::Pending`];
//! only genuinely fatal conditions should be returned as `Err`.
//!
//! The first attempt runs immediately and the poller sleeps *between*
//! attempts only, so a budget of 30 attempts at 2s gives up after 29 sleeps.
//!
//! # Example
//!
//! ```ignore
//! let outcome = poll(&PollBudget::attempts(30, Duration::from_secs(2)), "pod deletion", |_| async {
//!     Ok(if cluster.get_pod(ns, "crdb-2").await?.is_none() {
//!         PollStatus::Ready
//!     } else {
//!         PollStatus::Pending
//!     })
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Error;

/// How long a poll may keep trying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollLimit {
    /// Give up after this many attempts
    Attempts(u32),
    /// Give up once the next attempt would start past this much elapsed time
    Timeout(Duration),
}

/// Interval and limit for a bounded poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollBudget {
    /// Sleep between consecutive attempts
    pub interval: Duration,
    /// When to stop
    pub limit: PollLimit,
}

impl PollBudget {
    /// A budget of at most `max_attempts` attempts, `interval` apart
    pub const fn attempts(max_attempts: u32, interval: Duration) -> Self {
        Self {
            interval,
            limit: PollLimit::Attempts(max_attempts),
        }
    }

    /// A budget bounded by wall-clock time, polling every `interval`
    pub const fn timeout(timeout: Duration, interval: Duration) -> Self {
        Self {
            interval,
            limit: PollLimit::Timeout(timeout),
        }
    }

    fn is_final(&self, attempt: u32, elapsed: Duration) -> bool {
        match self.limit {
            PollLimit::Attempts(max) => attempt >= max,
            PollLimit::Timeout(timeout) => elapsed + self.interval > timeout,
        }
    }
}

/// Attempt metadata handed to the predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number
    pub number: u32,
    /// True when the budget will be exhausted if this attempt is not ready
    pub is_final: bool,
}

/// What a predicate observed on one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// The condition holds
    Ready,
    /// Not yet; try again after the interval
    Pending,
}

impl From<bool> for PollStatus {
    fn from(ready: bool) -> Self {
        if ready {
            PollStatus::Ready
        } else {
            PollStatus::Pending
        }
    }
}

/// Terminal result of a poll that did not error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate reported ready
    Satisfied {
        /// Attempts made, including the successful one
        attempts: u32,
        /// Time spent polling
        elapsed: Duration,
    },
    /// The budget ran out before the predicate reported ready
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Time spent polling
        elapsed: Duration,
    },
}

impl PollOutcome {
    /// Whether the condition was reached
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PollOutcome::Satisfied { .. })
    }

    /// Number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Satisfied { attempts, .. } | PollOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Time spent polling
    pub fn elapsed(&self) -> Duration {
        match self {
            PollOutcome::Satisfied { elapsed, .. } | PollOutcome::Exhausted { elapsed, .. } => {
                *elapsed
            }
        }
    }

    /// Turn exhaustion into [`Error::Timeout`] for callers that treat it as fatal
    pub fn into_result(self, operation: &str, resource: &str) -> Result<(), Error> {
        match self {
            PollOutcome::Satisfied { .. } => Ok(()),
            PollOutcome::Exhausted { attempts, elapsed } => Err(Error::Timeout {
                operation: operation.to_string(),
                resource: resource.to_string(),
                attempts,
                elapsed,
            }),
        }
    }
}

/// Evaluate `predicate` until it is ready or `budget` runs out.
///
/// Retryable predicate errors (API server unavailable, throttling, transport)
/// count as a pending attempt and spend the budget. Any other error is
/// returned immediately without further attempts.
pub async fn poll<F, Fut>(
    budget: &PollBudget,
    operation: &str,
    mut predicate: F,
) -> Result<PollOutcome, Error>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<PollStatus, Error>>,
{
    let start = Instant::now();
    let mut number = 0u32;

    loop {
        number += 1;
        let attempt = Attempt {
            number,
            is_final: budget.is_final(number, start.elapsed()),
        };

        let status = match predicate(attempt).await {
            Ok(status) => status,
            Err(e) if e.is_retryable() => {
                warn!(
                    operation = %operation,
                    attempt = number,
                    error = %e,
                    "Transient error while polling"
                );
                PollStatus::Pending
            }
            Err(e) => return Err(e),
        };

        match status {
            PollStatus::Ready => {
                let elapsed = start.elapsed();
                debug!(
                    operation = %operation,
                    attempt = number,
                    elapsed_ms = elapsed.as_millis(),
                    "Condition satisfied"
                );
                return Ok(PollOutcome::Satisfied {
                    attempts: number,
                    elapsed,
                });
            }
            PollStatus::Pending if attempt.is_final => {
                let elapsed = start.elapsed();
                warn!(
                    operation = %operation,
                    attempts = number,
                    elapsed_ms = elapsed.as_millis(),
                    "Poll budget exhausted"
                );
                return Ok(PollOutcome::Exhausted {
                    attempts: number,
                    elapsed,
                });
            }
            PollStatus::Pending => {
                debug!(operation = %operation, attempt = number, "Waiting for {}...", operation);
                tokio::time::sleep(budget.interval).await;
            }
        }
    }
}
