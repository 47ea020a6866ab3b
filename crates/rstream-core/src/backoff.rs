//! Backoff policies for reconnect scheduling
//!
//! A [`BackoffPolicy`] produces successive wait intervals and can be reset to
//! its initial state. Policies take `&self` and keep their progression behind
//! a lock, so one instance can be shared between controllers; the progression
//! is then shared as well.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;

/// Stateful producer of reconnect wait intervals
pub trait BackoffPolicy: Send + Sync {
    /// Advance the progression and return the interval to wait
    ///
    /// `None` means the policy is exhausted and no further attempt should be
    /// made.
    fn next(&self) -> Option<Duration>;

    /// Revert the progression to its initial state
    fn reset(&self);
}

/// Exponential backoff with an upper bound and optional jitter
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: Duration,
    max_attempts: Option<u32>,
    attempt: Mutex<u32>,
}

impl ExponentialBackoff {
    /// Doubling backoff from `initial` up to `max`, no jitter, unlimited attempts
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
            jitter: Duration::ZERO,
            max_attempts: None,
            attempt: Mutex::new(0),
        }
    }

    /// Growth factor between attempts (values below 1.0 are treated as 1.0)
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Maximum random jitter added to each interval
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Number of intervals produced before the policy is exhausted
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Un-jittered delay for the given 0-based attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial.as_nanos() as f64 * self.multiplier.powi(exponent);
        let max_nanos = self.max.as_nanos() as f64;
        if scaled.is_finite() && scaled < max_nanos {
            Duration::from_nanos(scaled as u64)
        } else {
            self.max
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next(&self) -> Option<Duration> {
        let mut attempt = self.attempt.lock();
        if let Some(max) = self.max_attempts {
            if *attempt >= max {
                return None;
            }
        }
        let delay = self.delay_for_attempt(*attempt) + jitter_duration(self.jitter);
        *attempt = attempt.saturating_add(1);
        trace!(attempt = *attempt, delay_ms = delay.as_millis() as u64, "Backoff advanced");
        Some(delay)
    }

    fn reset(&self) {
        *self.attempt.lock() = 0;
    }
}

/// Fixed interval between attempts
#[derive(Debug)]
pub struct ConstantBackoff {
    interval: Duration,
    max_attempts: Option<u32>,
    attempt: Mutex<u32>,
}

impl ConstantBackoff {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            attempt: Mutex::new(0),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl BackoffPolicy for ConstantBackoff {
    fn next(&self) -> Option<Duration> {
        let mut attempt = self.attempt.lock();
        if self.max_attempts.is_some_and(|max| *attempt >= max) {
            return None;
        }
        *attempt = attempt.saturating_add(1);
        Some(self.interval)
    }

    fn reset(&self) {
        *self.attempt.lock() = 0;
    }
}

fn jitter_duration(max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = u64::try_from(max_jitter.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rand::thread_rng().gen_range(0..=limit_nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_exponential_doubles_until_capped() {
        let backoff = ExponentialBackoff::new(ms(100), ms(1000));
        let delays: Vec<_> = (0..6).filter_map(|_| backoff.next()).collect();
        assert_eq!(delays, vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000)]);
    }

    #[test]
    fn test_exponential_reset_restarts_progression() {
        let backoff = ExponentialBackoff::new(ms(50), ms(10_000));
        backoff.next();
        backoff.next();
        assert_eq!(backoff.next(), Some(ms(200)));

        backoff.reset();
        assert_eq!(backoff.next(), Some(ms(50)));
    }

    #[test]
    fn test_exponential_exhausts_after_max_attempts() {
        let backoff = ExponentialBackoff::new(ms(10), ms(100)).with_max_attempts(2);
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert_eq!(backoff.next(), None);

        backoff.reset();
        assert_eq!(backoff.next(), Some(ms(10)));
    }

    #[rstest]
    #[case(0, ms(100))]
    #[case(1, ms(300))]
    #[case(2, ms(900))]
    #[case(3, ms(2000))]
    #[case(u32::MAX, ms(2000))]
    fn test_delay_for_attempt_with_multiplier(#[case] attempt: u32, #[case] expected: Duration) {
        let backoff = ExponentialBackoff::new(ms(100), ms(2000)).with_multiplier(3.0);
        let delay = backoff.delay_for_attempt(attempt);
        let diff = delay.as_secs_f64() - expected.as_secs_f64();
        assert!(diff.abs() < 1e-6, "attempt {attempt}: {delay:?} != {expected:?}");
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let backoff = ExponentialBackoff::new(ms(100), ms(100)).with_jitter(ms(25));
        for _ in 0..20 {
            let delay = backoff.next().unwrap();
            assert!(delay >= ms(100) && delay <= ms(125), "{delay:?}");
        }
    }

    #[test]
    fn test_jitter_is_not_shared_between_policies() {
        // same attempt, same instant: jitter must still differ across instances
        let delays: Vec<_> = (0..32)
            .map(|_| {
                ExponentialBackoff::new(ms(100), ms(100))
                    .with_jitter(Duration::from_secs(1))
                    .next()
                    .unwrap()
            })
            .collect();
        assert!(delays.iter().any(|delay| *delay != delays[0]), "{delays:?}");
    }

    #[test]
    fn test_constant_backoff() {
        let backoff = ConstantBackoff::new(ms(250)).with_max_attempts(3);
        assert_eq!(backoff.next(), Some(ms(250)));
        assert_eq!(backoff.next(), Some(ms(250)));
        assert_eq!(backoff.next(), Some(ms(250)));
        assert_eq!(backoff.next(), None);
        backoff.reset();
        assert_eq!(backoff.next(), Some(ms(250)));
    }
}
