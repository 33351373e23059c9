//! Bounded fixed-interval polling.
//!
//! [`poll_until`] repeatedly runs a probe until it reports
//! [`Attempt::Ready`], sleeping a fixed interval between attempts. The probe
//! decides what "ready" means, so the same primitive waits for existence,
//! state membership, and structural status matches.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Default delay between poll attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of attempts before a wait times out.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 180;

/// Interval and attempt ceiling applied to a wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Delay between consecutive attempts.
    pub interval: Duration,
    /// Maximum number of probe invocations.
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Creates a policy with the given interval and attempt ceiling.
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Returns a policy that never sleeps between attempts.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(Duration::ZERO, max_attempts)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_ATTEMPTS)
    }
}

/// Outcome of a single probe invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attempt<T> {
    /// The awaited condition holds; polling stops with this value.
    Ready(T),
    /// The condition does not hold yet. The description of what was
    /// observed is reported if the wait times out.
    Pending(String),
}

/// Errors raised by [`poll_until`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when every attempt completed without the condition holding.
    #[error("timed out waiting for {condition} after {attempts} attempts; last observed: {last_observed}")]
    Timeout {
        /// Description of the awaited condition.
        condition: String,
        /// Number of probe invocations made.
        attempts: u32,
        /// Description reported by the final pending attempt.
        last_observed: String,
    },
    /// Raised when the probe itself fails. Probe failures are not retried.
    #[error(transparent)]
    Probe(E),
}

/// Runs `probe` until it reports [`Attempt::Ready`] or the policy's attempt
/// ceiling is reached.
///
/// The interval is slept between attempts only, never after the final one.
///
/// # Errors
///
/// Returns [`PollError::Timeout`] when no attempt succeeds and
/// [`PollError::Probe`] as soon as the probe fails.
pub async fn poll_until<T, E, F, Fut>(
    policy: PollPolicy,
    condition: &str,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    let mut last_observed = String::from("nothing observed");

    for attempt in 1..=policy.max_attempts {
        match probe().await.map_err(PollError::Probe)? {
            Attempt::Ready(value) => return Ok(value),
            Attempt::Pending(observed) => {
                debug!(condition, attempt, observed = %observed, "condition not met yet");
                last_observed = observed;
            }
        }

        if attempt < policy.max_attempts {
            sleep(policy.interval).await;
        }
    }

    Err(PollError::Timeout {
        condition: condition.to_owned(),
        attempts: policy.max_attempts,
        last_observed,
    })
}
