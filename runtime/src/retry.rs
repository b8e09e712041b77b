//! Backoff for handlers that fail transiently.
//!
//! A delivery is re-run in place while its handler reports a retryable error.
//! Sleeps grow geometrically from `initial_delay` and never exceed
//! `max_delay`. When the budget runs out the caller gets the final error and
//! the attempt count, which is what ends up in the dead-letter record.
//!
//! ```rust
//! use std::time::Duration;
//! use tickets_runtime::retry::{RetryPolicy, retry_with_predicate};
//!
//! # async fn run() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(50))
//!     .build();
//!
//! let seats = retry_with_predicate(
//!     &policy,
//!     || async { Ok::<u32, String>(2) },
//!     |reason: &String| reason.starts_with("unavailable"),
//! )
//! .await
//! .map_err(|gave_up| gave_up.error)?;
//!
//! assert_eq!(seats, 2);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

/// How many times a failing handler is re-run, and how long it sleeps between
/// runs.
///
/// The default suits broker redelivery: 10 retries, 100ms first, doubling, at
/// most 1s apart.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Sleep before the first retry
    pub initial_delay: Duration,
    /// Ceiling for any one sleep
    pub max_delay: Duration,
    /// Factor between one sleep and the next
    pub multiplier: f64,
}

impl RetryPolicy {
    const DEFAULT: Self = Self {
        max_retries: 10,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
    };

    /// Starts from the default policy.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder(Self::DEFAULT)
    }

    /// Gives up on the first failure.
    #[must_use]
    pub const fn no_retries() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Sleep taken after failed attempt number `failures`, counting from zero.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let growth = self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * growth)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Adjusts a [`RetryPolicy`] field by field.
#[derive(Clone, Debug)]
pub struct RetryPolicyBuilder(RetryPolicy);

impl RetryPolicyBuilder {
    /// Retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.0.max_retries = retries;
        self
    }

    /// Sleep before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, first: Duration) -> Self {
        self.0.initial_delay = first;
        self
    }

    /// Ceiling for any one sleep.
    #[must_use]
    pub const fn max_delay(mut self, ceiling: Duration) -> Self {
        self.0.max_delay = ceiling;
        self
    }

    /// Factor between one sleep and the next.
    #[must_use]
    pub const fn multiplier(mut self, factor: f64) -> Self {
        self.0.multiplier = factor;
        self
    }

    /// The finished policy.
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        self.0
    }
}

/// Final error of an operation that never succeeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exhausted<E> {
    /// Error of the last run
    pub error: E,
    /// Runs made, the first one included
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy allows no more retries.
///
/// # Errors
///
/// Returns [`Exhausted`] carrying the last error and the number of runs.
pub async fn retry_with_predicate<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut failures = 0;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    tracing::info!(failures, "Recovered after retrying");
                }
                return Ok(value);
            },
            Err(error) => error,
        };

        let attempts = failures + 1;
        if !is_retryable(&error) {
            tracing::warn!(attempts, error = %error, "Permanent failure, not retrying");
            return Err(Exhausted { error, attempts });
        }
        if failures == policy.max_retries {
            tracing::error!(attempts, error = %error, "Retry budget spent");
            return Err(Exhausted { error, attempts });
        }

        let pause = policy.backoff(failures);
        tracing::warn!(attempts, pause_ms = pause.as_millis(), error = %error, "Transient failure, will retry");
        tokio::time::sleep(pause).await;
        failures += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(4))
            .build()
    }

    #[test]
    fn backoff_doubles_until_the_ceiling() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(50))
            .max_delay(Duration::from_millis(300))
            .build();

        let pauses: Vec<_> = (0..5).map(|n| policy.backoff(n).as_millis()).collect();
        assert_eq!(pauses, [50, 100, 200, 300, 300]);
    }

    #[test]
    fn default_policy_stays_under_a_second() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_retries, 10);
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(9), Duration::from_secs(1));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let runs = AtomicU32::new(0);

        let outcome = retry_with_predicate(
            &quick(5),
            || async {
                match runs.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err("unavailable".to_string()),
                    _ => Ok("booked"),
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(outcome, Ok("booked"));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_runs_out_with_the_last_error() {
        let runs = AtomicU32::new(0);

        let outcome = retry_with_predicate(
            &quick(2),
            || async {
                let run = runs.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(format!("timeout on run {run}"))
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(
            outcome,
            Err(Exhausted {
                error: "timeout on run 2".to_string(),
                attempts: 3,
            })
        );
    }

    #[tokio::test]
    async fn permanent_failure_runs_once() {
        let runs = AtomicU32::new(0);

        let outcome = retry_with_predicate(
            &RetryPolicy::default(),
            || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("invalid saga state")
            },
            |reason: &&str| reason.starts_with("unavailable"),
        )
        .await;

        assert_eq!(outcome.map_err(|gave_up| gave_up.attempts), Err(1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
