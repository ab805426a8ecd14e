//! Bounded exponential backoff for polling chain state.

use core::future::Future;
use core::time::Duration;

use tracing::trace;

use crate::error::{HarnessError, Phase, Result};

/// Initial delay between two polls.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(200);
/// Upper bound for a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
/// Hard ceiling on the number of polls before a liveness failure.
pub const DEFAULT_RETRY_CEILING: u32 = 30;

/// What a single poll saw.
#[derive(Debug)]
pub enum Observation<T> {
    /// The awaited condition holds.
    Ready(T),
    /// Not there yet; the string describes the observed state.
    Pending(String),
}

#[derive(Clone, Debug, PartialEq, Eq, bon::Builder)]
pub struct RetryPolicy {
    #[builder(default = DEFAULT_INITIAL_DELAY)]
    pub initial_delay: Duration,
    #[builder(default = DEFAULT_MAX_DELAY)]
    pub max_delay: Duration,
    #[builder(default = DEFAULT_RETRY_CEILING)]
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Delay before poll number `attempt` (1-based); the first poll is immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = (attempt - 2).min(31);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Worst-case total time spent sleeping before giving up.
    pub fn budget(&self) -> Duration {
        (1..=self.max_attempts.max(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }

    /// Polls `check` until it reports [`Observation::Ready`], an error, or the
    /// retry ceiling is hit. Errors from `check` abort immediately.
    pub async fn poll_until<T, F, Fut>(
        &self,
        phase: Phase,
        waiting_for: &str,
        mut check: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Observation<T>>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_observed = String::from("nothing");

        for attempt in 1..=attempts {
            let delay = self.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match check().await? {
                Observation::Ready(value) => {
                    trace!(%phase, waiting_for, attempt, "condition reached");
                    return Ok(value);
                }
                Observation::Pending(observed) => {
                    trace!(%phase, waiting_for, attempt, %observed, "still waiting");
                    last_observed = observed;
                }
            }
        }

        Err(HarnessError::LivenessBoundExceeded {
            phase,
            waiting_for: waiting_for.to_string(),
            attempts,
            last_observed,
        })
    }
}
