//! Exponential backoff with random jitter. Safe for concurrent use.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Maximum random offset applied to each wait (plus or minus 25%).
const JITTER_FRACTION: f64 = 0.25;

/// Tracks exponential backoff state: start 2 s, max 5 m, factor 2.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Mutex<Duration>,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            initial: DEFAULT_INITIAL,
            max: DEFAULT_MAX,
            factor: DEFAULT_FACTOR,
            current: Mutex::new(DEFAULT_INITIAL),
        }
    }

    /// Returns the next wait duration (with jitter applied) and advances the
    /// internal counter for the subsequent call. Always strictly positive.
    pub fn next(&self) -> Duration {
        let mut current = self.current.lock().unwrap();
        let base = *current;

        let max_jitter = base.as_secs_f64() * JITTER_FRACTION;
        let jitter = rand::rng().random_range(-1.0..=1.0) * max_jitter;
        let mut wait = base.as_secs_f64() + jitter;
        if wait <= 0.0 {
            wait = self.initial.as_secs_f64();
        }

        *current = base.mul_f64(self.factor).min(self.max);

        Duration::from_secs_f64(wait)
    }

    /// Restores the backoff to its initial value. Call after a connection has
    /// been stable long enough to be considered healthy.
    pub fn reset(&self) {
        *self.current.lock().unwrap() = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn current(b: &Backoff) -> Duration {
        *b.current.lock().unwrap()
    }

    #[test]
    fn initial_state() {
        let b = Backoff::new();
        assert_eq!(current(&b), DEFAULT_INITIAL);
        assert_eq!(b.max, DEFAULT_MAX);
        assert_eq!(b.factor, DEFAULT_FACTOR);
    }

    #[test]
    fn next_is_strictly_positive() {
        let b = Backoff::new();
        for i in 0..20 {
            let d = b.next();
            assert!(d > Duration::ZERO, "iteration {i}: {d:?}");
        }
    }

    #[test]
    fn first_next_is_near_initial() {
        let b = Backoff::new();
        let d = b.next();
        let lower = DEFAULT_INITIAL.mul_f64(1.0 - JITTER_FRACTION);
        let upper = DEFAULT_INITIAL.mul_f64(1.0 + JITTER_FRACTION);
        assert!(d >= lower && d <= upper, "{d:?} not in [{lower:?}, {upper:?}]");
    }

    #[test]
    fn next_advances_internal_counter() {
        let b = Backoff::new();
        let _ = b.next();
        assert_eq!(current(&b), DEFAULT_INITIAL.mul_f64(DEFAULT_FACTOR));
    }

    #[test]
    fn counter_capped_at_max() {
        let b = Backoff::new();
        for _ in 0..30 {
            b.next();
        }
        assert_eq!(current(&b), DEFAULT_MAX);
    }

    #[test]
    fn values_never_exceed_max_plus_jitter() {
        let b = Backoff::new();
        let upper = DEFAULT_MAX.mul_f64(1.0 + JITTER_FRACTION + 0.01);
        for i in 0..50 {
            let d = b.next();
            assert!(d <= upper, "iteration {i}: {d:?} exceeds {upper:?}");
        }
    }

    #[test]
    fn reset_restores_initial() {
        let b = Backoff::new();
        for _ in 0..8 {
            b.next();
        }
        b.reset();
        assert_eq!(current(&b), DEFAULT_INITIAL);

        let d = b.next();
        let lower = DEFAULT_INITIAL.mul_f64(1.0 - JITTER_FRACTION);
        let upper = DEFAULT_INITIAL.mul_f64(1.0 + JITTER_FRACTION);
        assert!(d >= lower && d <= upper, "{d:?} not in [{lower:?}, {upper:?}]");
    }

    #[test]
    fn base_doubles_each_step_until_max() {
        let b = Backoff::new();
        let mut expected = DEFAULT_INITIAL;
        for step in 0..10 {
            b.next();
            expected = expected.mul_f64(DEFAULT_FACTOR).min(DEFAULT_MAX);
            assert_eq!(current(&b), expected, "step {step}");
        }
    }

    // Mixed next/reset calls from many threads; the mutex must keep the
    // counter consistent.
    #[test]
    fn concurrent_use() {
        let b = Arc::new(Backoff::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let b = Arc::clone(&b);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let _ = b.next();
                }
            }));
        }
        for _ in 0..5 {
            let b = Arc::clone(&b);
            handles.push(std::thread::spawn(move || {
                for _ in 0..20 {
                    b.reset();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(current(&b) >= DEFAULT_INITIAL);
        assert!(current(&b) <= DEFAULT_MAX);
    }
}
