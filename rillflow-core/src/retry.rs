//! Retry strategies, delay sequences and the retry wrapper.
//!
//! A [`RetryStrategy`] is a configuration value chosen at construction time.
//! [`RetryStrategy::delays`] turns it into a lazy, unbounded sequence of
//! delay durations; [`retry`] wraps a fallible operation with that sequence
//! and a caller-supplied predicate deciding which failures are worth
//! retrying.

use std::{fmt, future::Future, time::Duration};

/// Retry behavior applied to change-feed workers and consumer dispatch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryStrategy {
    /// No retries; any failure propagates immediately.
    None,
    /// Retry after a constant delay, indefinitely.
    Fixed(Duration),
    /// Retry with exponentially growing delays capped at `max`,
    /// indefinitely.
    Backoff {
        /// First delay.
        initial: Duration,
        /// Upper bound every subsequent delay is clamped to.
        max: Duration,
        /// Growth factor applied to the previous delay.
        multiplier: f64,
    },
}

impl RetryStrategy {
    /// Constant-delay strategy.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self::Fixed(delay)
    }

    /// Exponential-backoff strategy with a cap.
    #[must_use]
    pub const fn backoff(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self::Backoff {
            initial,
            max,
            multiplier,
        }
    }

    /// Produce the delay sequence for this strategy.
    ///
    /// Returns `None` for [`RetryStrategy::None`] (failures are not
    /// retried). Otherwise the sequence is infinite: it never terminates and
    /// is not restartable; retries end only through caller-level
    /// cancellation.
    #[must_use]
    pub fn delays(&self) -> Option<Delays> {
        match *self {
            Self::None => None,
            Self::Fixed(delay) => Some(Delays(DelayState::Fixed(delay))),
            Self::Backoff {
                initial,
                max,
                multiplier,
            } => Some(Delays(DelayState::Backoff {
                next: initial,
                max,
                multiplier,
            })),
        }
    }
}

/// Lazy, unbounded sequence of retry delays.
///
/// Pull-based: the next delay is computed on demand. For
/// [`RetryStrategy::Backoff`] the first value is `initial` and each
/// subsequent value is `min(max, round(previous * multiplier))`, so the
/// sequence never exceeds `max` and never decreases.
#[derive(Clone, Debug)]
pub struct Delays(DelayState);

#[derive(Clone, Debug)]
enum DelayState {
    Fixed(Duration),
    Backoff {
        next: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Iterator for Delays {
    type Item = Duration;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    #[allow(clippy::cast_sign_loss)] // multiplier is a growth factor, delays stay non-negative
    fn next(&mut self) -> Option<Duration> {
        match &mut self.0 {
            DelayState::Fixed(delay) => Some(*delay),
            DelayState::Backoff {
                next,
                max,
                multiplier,
            } => {
                let current = *next;
                let scaled = (current.as_millis() as f64 * *multiplier).round() as u64;
                *next = Duration::from_millis(scaled).min(*max);
                Some(current)
            }
        }
    }
}

/// Run `operation`, retrying failures according to `retry_if` and `delays`.
///
/// On failure: when the predicate holds and a delay sequence is configured,
/// the next delay is pulled, logged and slept, then the operation runs
/// again; otherwise the failure propagates to the caller. The predicate is
/// re-evaluated on every failure, so cooperative cancellation flags are
/// observed between iterations rather than only at entry.
///
/// The sequence is taken by mutable reference so one sequence can govern
/// several dispatches: delays consumed by an earlier failure are not handed
/// out again.
///
/// # Errors
///
/// Returns the operation's error once it is no longer retriable.
pub async fn retry<T, E, F, Fut, P>(
    mut operation: F,
    mut retry_if: P,
    delays: &mut Option<Delays>,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: fmt::Display,
{
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let delay = match delays.as_mut() {
                    Some(sequence) if retry_if(&error) => sequence.next(),
                    _ => None,
                };
                let Some(delay) = delay else {
                    return Err(error);
                };
                tracing::error!(
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "caught failure, will retry after delay"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
