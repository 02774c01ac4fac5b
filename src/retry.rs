//! Retry policy and exponential backoff.
//!
//! This module provides the [`RetryPolicy`] type and the [`retry_with_backoff`]
//! combinator used by the connection manager (connect), the publisher (each
//! publish) and the subscriber (subscription setup).
//!
//! # Retry Strategy
//!
//! - The operation runs once, then is retried up to `max_attempts` more times
//! - The wait before retry `n` is `base_delay * multiplier^(n-1)`, optionally
//!   capped at `max_delay`
//! - An observer callback sees every failure together with the upcoming wait
//! - Attempts in flight and backoff sleeps both end early when the
//!   cancellation token fires
//! - The combinator never swallows: exhaustion returns the last error

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::BrokerSettings;

/// Retry policy with exponential backoff.
///
/// # Example
///
/// ```
/// use mom_bus::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(3, Duration::from_secs(2));
/// assert_eq!(policy.delay_for(1), Duration::from_secs(2));
/// assert_eq!(policy.delay_for(3), Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt (0 = run exactly once).
    pub max_attempts: u32,

    /// Wait before the first retry.
    pub base_delay: Duration,

    /// Factor applied to the wait after each retry.
    pub multiplier: f64,

    /// Upper bound for a single wait.
    pub max_delay: Option<Duration>,
}

impl RetryPolicy {
    /// Doubling backoff starting at `base_delay`.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        // ---
        Self {
            max_attempts,
            base_delay,
            multiplier: 2.0,
            max_delay: None,
        }
    }

    /// A policy that runs the operation exactly once.
    pub fn none() -> Self {
        Self::exponential(0, Duration::ZERO)
    }

    /// Connect policy derived from broker settings.
    ///
    /// `settings.max_retry_attempts` retries, waiting
    /// `retry_interval_ms * 2^(attempt-1)` between them.
    pub fn connect(settings: &BrokerSettings) -> Self {
        Self::exponential(settings.max_retry_attempts, settings.retry_interval())
    }

    /// Policy for individual publish / subscribe-setup operations.
    ///
    /// Three retries, waiting `2^attempt` seconds: 2s, 4s, 8s.
    pub fn operation() -> Self {
        Self::exponential(3, Duration::from_secs(2))
    }

    /// Cap every single wait at `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // ---
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let delay = if secs.is_finite() && secs < u64::MAX as f64 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::MAX
        };

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::operation()
    }
}

/// Why a retried operation did not produce a value.
#[derive(Error, Debug)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed; `source` is the error of the last one.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// Total number of calls made, including the initial one.
        attempts: u32,
        /// Error returned by the final attempt.
        #[source]
        source: E,
    },

    /// The cancellation token fired while waiting to retry.
    #[error("cancelled while waiting to retry")]
    Cancelled,
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The last operation error, if the retries ran out.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } => Some(source),
            RetryError::Cancelled => None,
        }
    }
}

impl From<RetryError<crate::BusError>> for crate::BusError {
    fn from(err: RetryError<crate::BusError>) -> Self {
        match err {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Cancelled => crate::BusError::Cancelled,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Runs `operation`; on failure calls `on_retry(&error, delay, attempt)`,
/// sleeps `policy.delay_for(attempt)` and tries again, until it succeeds or
/// `policy.max_attempts` retries have failed.
///
/// # Returns
///
/// - `Ok(T)` if any attempt succeeds
/// - `Err(RetryError::Exhausted)` with the last error once retries run out
/// - `Err(RetryError::Cancelled)` if `cancel` fires during an attempt or a
///   backoff wait; the attempt in flight is dropped
///
/// # Example
///
/// ```ignore
/// let conn = retry_with_backoff(&policy, &cancel, |err, delay, attempt| {
///     log_warn!("attempt {attempt} failed, waiting {delay:?}: {err}");
/// }, || connector.connect()).await?;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + 'static,
    R: FnMut(&E, Duration, u32),
{
    let mut attempt: u32 = 0;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = operation() => outcome,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= policy.max_attempts {
            crate::log_debug!(
                "retry exhausted after {} attempts, last error: {}",
                attempt + 1,
                err
            );
            return Err(RetryError::Exhausted {
                attempts: attempt + 1,
                source: err,
            });
        }

        attempt += 1;
        let delay = policy.delay_for(attempt);
        on_retry(&err, delay, attempt);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::BusError;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(10))
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        // ---
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1000));

        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(16000));
    }

    #[test]
    fn test_operation_policy_is_two_to_the_attempt_seconds() {
        // ---
        let policy = RetryPolicy::operation();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_connect_policy_follows_settings() {
        // ---
        let settings = BrokerSettings::default()
            .with_max_retry_attempts(7)
            .with_retry_interval_ms(250);
        let policy = RetryPolicy::connect(&settings);

        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_max_delay_cap() {
        // ---
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300));

        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for(9), Duration::from_millis(300));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        // ---
        let policy = RetryPolicy::exponential(u32::MAX, Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn test_no_retry_on_success() {
        // ---
        let cancel = CancellationToken::new();
        let call_count = Arc::new(Mutex::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(
            &fast(3),
            &cancel,
            |_: &BusError, _, _| panic!("on_retry must not run"),
            || {
                let count = call_count_clone.clone();
                async move {
                    *count.lock().unwrap() += 1;
                    Ok::<i32, BusError>(42)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*call_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        // ---
        let cancel = CancellationToken::new();
        let call_count = Arc::new(Mutex::new(0));
        let call_count_clone = call_count.clone();

        let result = retry_with_backoff(
            &RetryPolicy::none(),
            &cancel,
            |_, _, _| {},
            || {
                let count = call_count_clone.clone();
                async move {
                    *count.lock().unwrap() += 1;
                    Err::<i32, _>(BusError::Transport("fail".into()))
                }
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 1, .. })
        ));
        assert_eq!(*call_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        // ---
        let cancel = CancellationToken::new();
        let call_count = Arc::new(Mutex::new(0));
        let call_count_clone = call_count.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_clone = observed.clone();

        let result = retry_with_backoff(
            &fast(3),
            &cancel,
            move |_: &BusError, delay, attempt| {
                observed_clone.lock().unwrap().push((attempt, delay));
            },
            || {
                let count = call_count_clone.clone();
                async move {
                    let mut c = count.lock().unwrap();
                    *c += 1;
                    if *c < 3 {
                        Err(BusError::Transport("simulated failure".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*call_count.lock().unwrap(), 3);
        assert_eq!(
            *observed.lock().unwrap(),
            vec![
                (1, Duration::from_millis(10)),
                (2, Duration::from_millis(20))
            ]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        // ---
        let cancel = CancellationToken::new();
        let call_count = Arc::new(Mutex::new(0));
        let call_count_clone = call_count.clone();
        let retries = Arc::new(Mutex::new(0));
        let retries_clone = retries.clone();

        let result = retry_with_backoff(
            &fast(2),
            &cancel,
            move |_: &BusError, _, _| *retries_clone.lock().unwrap() += 1,
            || {
                let count = call_count_clone.clone();
                async move {
                    let mut c = count.lock().unwrap();
                    *c += 1;
                    Err::<i32, _>(BusError::Transport(format!("failure #{}", *c)))
                }
            },
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "transport error: failure #3");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // Initial attempt + 2 retries = 3 calls, 2 notifications
        assert_eq!(*call_count.lock().unwrap(), 3);
        assert_eq!(*retries.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_timing_is_exponential() {
        // ---
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let _ = retry_with_backoff(
            &RetryPolicy::operation(),
            &cancel,
            |_, _, _| {},
            || async { Err::<(), _>(BusError::Transport("down".into())) },
        )
        .await;

        // 2s + 4s + 8s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(14), "elapsed too short: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(15), "elapsed too long: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        // ---
        let cancel = CancellationToken::new();
        let call_count = Arc::new(Mutex::new(0));
        let call_count_clone = call_count.clone();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = retry_with_backoff(
            &RetryPolicy::operation(),
            &cancel,
            |_, _, _| {},
            || {
                let count = call_count_clone.clone();
                async move {
                    *count.lock().unwrap() += 1;
                    Err::<(), _>(BusError::Transport("down".into()))
                }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(*call_count.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_attempt_drops_it() {
        // ---
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = retry_with_backoff(
            &RetryPolicy::operation(),
            &cancel,
            |_, _, _| {},
            || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<(), BusError>(())
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_retry_error_converts_to_bus_error() {
        // ---
        let exhausted: RetryError<BusError> = RetryError::Exhausted {
            attempts: 4,
            source: BusError::NoConnection,
        };
        assert!(matches!(BusError::from(exhausted), BusError::NoConnection));

        let cancelled: RetryError<BusError> = RetryError::Cancelled;
        assert!(matches!(BusError::from(cancelled), BusError::Cancelled));
    }
}
