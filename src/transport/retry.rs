//! Bounded retry around the transport.
//!
//! The [`RetryPolicy`] decides, from the status code of an attempt, whether
//! the loop stops, sleeps and tries again, or gives up. The
//! [`RetryController`] drives that loop against any [`Transport`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use netupdate_core::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default().with_delay(Duration::from_millis(10));
//!
//! match policy.decide(503, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::Stop => println!("accepted"),
//!     RetryDecision::GiveUp { reason } => println!("giving up: {}", reason),
//! }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::client::Transport;
use super::constants::DEFAULT_RETRY_DELAY;
use super::executor::{TaskHandle, submit};
use super::request::{Payload, RequestOutcome, RequestSpec};

/// Default maximum attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What to do after an attempt completed with a given status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The status is acceptable; return the outcome as succeeded.
    Stop,

    /// Try again after the delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Attempts are exhausted.
    GiveUp {
        /// Human-readable reason.
        reason: String,
    },
}

/// Retry configuration: attempt bound, fixed delay, and the statuses that
/// end the loop successfully.
///
/// Defaults: 3 attempts, 1 second, `{200}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    acceptable_status_codes: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
            acceptable_status_codes: BTreeSet::from([200]),
        }
    }
}

impl RetryPolicy {
    /// Sets the attempt bound (clamped to at least 1).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the delay between attempts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replaces the acceptable status codes.
    #[must_use]
    pub fn accepting(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.acceptable_status_codes = codes.into_iter().collect();
        self
    }

    /// Maximum number of attempts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay between attempts.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether `status` ends the loop as a success.
    #[must_use]
    pub fn accepts(&self, status: u16) -> bool {
        self.acceptable_status_codes.contains(&status)
    }

    /// Decides what follows attempt number `attempt` (1-indexed) that
    /// completed with `status` (0 for transport failures).
    #[must_use]
    pub fn decide(&self, status: u16, attempt: u32) -> RetryDecision {
        if self.accepts(status) {
            return RetryDecision::Stop;
        }
        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::GiveUp {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }
        RetryDecision::Retry {
            delay: self.delay,
            attempt: attempt + 1,
        }
    }
}

/// Runs requests through a [`Transport`] under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryController {
    transport: Arc<dyn Transport>,
}

impl RetryController {
    /// Creates a controller over `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// The wrapped transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Executes `spec` until an acceptable status or the attempt bound.
    ///
    /// The returned outcome is the last attempt's; it is marked succeeded when
    /// its status is acceptable, even outside 2xx. On exhaustion its summary
    /// lists every attempt.
    #[instrument(skip(self, spec, policy), fields(correlation_id = spec.id(), url = spec.url(), max_attempts = policy.max_attempts()))]
    pub async fn execute_with_retry<T: Payload>(
        &self,
        spec: &RequestSpec,
        policy: &RetryPolicy,
    ) -> RequestOutcome<T> {
        let mut failures: Vec<String> = Vec::new();
        let mut attempt: u32 = 1;

        loop {
            let mut outcome = self.transport.execute_raw(spec).await;

            match policy.decide(outcome.status_code, attempt) {
                RetryDecision::Stop => {
                    if attempt > 1 {
                        info!(attempt, status = outcome.status_code, "succeeded after retry");
                    }
                    outcome.succeeded = true;
                    outcome.error_summary.clear();
                    return outcome.into_payload();
                }
                RetryDecision::Retry { delay, attempt: next } => {
                    failures.push(attempt_summary(attempt, &outcome));
                    debug!(
                        attempt,
                        next_attempt = next,
                        status = outcome.status_code,
                        delay_ms = delay.as_millis(),
                        "will retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::GiveUp { reason } => {
                    failures.push(attempt_summary(attempt, &outcome));
                    warn!(attempts = attempt, %reason, "request failed after all attempts");
                    outcome.succeeded = false;
                    outcome.error_summary =
                        format!("{} attempts failed: [{}]", attempt, failures.join("; "));
                    return outcome.into_payload();
                }
            }
        }
    }

    /// Submits [`execute_with_retry`](Self::execute_with_retry) through the executor.
    pub fn execute_with_retry_async<T: Payload>(
        &self,
        spec: RequestSpec,
        policy: RetryPolicy,
    ) -> TaskHandle<RequestOutcome<T>> {
        let controller = self.clone();
        let executor = self.transport.executor();
        submit(executor.as_ref(), async move {
            controller.execute_with_retry(&spec, &policy).await
        })
    }
}

fn attempt_summary<T>(attempt: u32, outcome: &RequestOutcome<T>) -> String {
    if outcome.status_code == 0 {
        format!("#{attempt}: {}", outcome.error_summary)
    } else {
        format!("#{attempt}: HTTP {}", outcome.status_code)
    }
}
