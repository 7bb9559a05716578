//! Retry with exponential backoff
//!
//! Used by the embedded backend for lock contention. Attempt `k` (1-based)
//! that fails with a retryable error is followed by a delay of
//! `base * multiplier^(k-1)`; no delay follows the last attempt.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Waits between attempts; may return early once `stop` holds
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration, stop: &dyn Fn() -> bool);
}

/// Sleeps the current thread in short steps, polling `stop`
#[derive(Debug, Default)]
pub struct ThreadSleeper;

const SLEEP_STEP: Duration = Duration::from_millis(10);

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, stop: &dyn Fn() -> bool) {
        let mut left = duration;
        while !left.is_zero() && !stop() {
            let nap = left.min(SLEEP_STEP);
            std::thread::sleep(nap);
            left -= nap;
        }
    }
}

/// Records requested delays without sleeping
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.delays().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, _stop: &dyn Fn() -> bool) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
    }
}

/// Why a retried operation gave up
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error stopped the loop
    Fatal(E),
    /// The stop check fired between attempts
    Canceled,
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: u32,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: 2,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay following failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. `stop` is checked before
    /// every attempt and polled during backoff.
    pub fn run<T, E>(
        &self,
        stop: impl Fn() -> bool,
        retryable: impl Fn(&E) -> bool,
        mut op: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<T, RetryError<E>> {
        let mut attempt = 1;
        loop {
            if stop() {
                return Err(RetryError::Canceled);
            }
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) => return Err(RetryError::Fatal(e)),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    })
                }
                Err(_) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "storage busy, retrying"
                    );
                    self.sleeper.sleep(delay, &stop);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    fn policy(sleeper: &Arc<RecordingSleeper>) -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(10)).with_sleeper(sleeper.clone())
    }

    #[test]
    fn test_succeeds_after_four_failures() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let result: Result<u32, RetryError<&str>> =
            policy(&sleeper).run(|| false, |_| true, |attempt| {
                if attempt < 5 {
                    Err("locked")
                } else {
                    Ok(attempt)
                }
            });
        assert_eq!(result, Ok(5));
        assert_eq!(sleeper.total(), Duration::from_millis(10 * (1 + 2 + 4 + 8)));
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut calls = 0;
        let result: Result<(), RetryError<&str>> = policy(&sleeper).run(
            || false,
            |_| true,
            |_| {
                calls += 1;
                Err("locked")
            },
        );
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 5,
                last: "locked"
            })
        );
        assert_eq!(calls, 5);
        assert_eq!(sleeper.delays().len(), 4);
    }

    #[test]
    fn test_fatal_error_stops_immediately() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let result: Result<(), RetryError<&str>> =
            policy(&sleeper).run(|| false, |e| *e == "locked", |_| Err("syntax"));
        assert_eq!(result, Err(RetryError::Fatal("syntax")));
        assert!(sleeper.delays().is_empty());
    }

    #[test]
    fn test_stop_check() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let result: Result<(), RetryError<&str>> =
            policy(&sleeper).run(|| true, |_| true, |_| Ok(()));
        assert_eq!(result, Err(RetryError::Canceled));
    }

    #[test]
    fn test_stop_interrupts_backoff() {
        let canceled = AtomicBool::new(false);
        let policy = RetryPolicy::new(3, Duration::from_secs(30));
        let started = Instant::now();
        let result: Result<(), RetryError<&str>> = policy.run(
            || canceled.load(Ordering::SeqCst),
            |_| true,
            |_| {
                canceled.store(true, Ordering::SeqCst);
                Err("locked")
            },
        );
        assert_eq!(result, Err(RetryError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_multiplier() {
        let p = RetryPolicy::new(4, Duration::from_millis(5)).with_multiplier(3);
        assert_eq!(p.delay_after(1), Duration::from_millis(5));
        assert_eq!(p.delay_after(3), Duration::from_millis(45));
    }
}
