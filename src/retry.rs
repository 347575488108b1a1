// Backoff schedule and cancellation for the upload retry loop.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff.
///
/// The delay before retry `n` (1-based) is `initial_backoff * 2^(n-1)`,
/// capped at `max_backoff`, so the sequence never decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// No retries at all; the first transient failure is final.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay to wait before retry number `retry` (starting at 1).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let initial = self.initial_backoff_ms.min(self.max_backoff_ms);
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(initial.saturating_mul(factor).min(self.max_backoff_ms))
    }

    /// Every delay this policy will ever ask for, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_retries).map(move |n| self.delay_for(n))
    }
}

/// Shared flag used to abandon a running pipeline from another thread.
///
/// Waiting on the token (`wait_timeout`) returns early as soon as it is
/// cancelled, so a backoff sleep never outlives a cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        let mut cancelled = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        match flag.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleep for `timeout` unless cancelled first. Returns `true` when the
    /// token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cancelled = match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn delays_double_then_cap() {
        let policy = RetryPolicy {
            max_retries: 6,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn delays_never_decrease_and_never_exceed_the_limit() {
        for max_retries in 0..40 {
            let bounds = [(0, 0), (1, 1), (7, 3), (250, 10_000), (u64::MAX / 2, u64::MAX)];
            for (initial, max) in bounds {
                let policy = RetryPolicy {
                    max_retries,
                    initial_backoff_ms: initial,
                    max_backoff_ms: max,
                };
                let delays: Vec<Duration> = policy.delays().collect();
                assert_eq!(delays.len(), max_retries as usize);
                assert!(delays.windows(2).all(|w| w[0] <= w[1]));
                assert!(delays.iter().all(|d| *d <= Duration::from_millis(max)));
            }
        }
    }

    #[test]
    fn none_policy_has_no_delays() {
        assert_eq!(RetryPolicy::none().delays().count(), 0);
    }

    #[test]
    fn wait_returns_false_on_timeout() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_wakes_a_waiting_thread() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let cancelled = token.wait_timeout(Duration::from_secs(30));
                (cancelled, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(30));
    }
}
