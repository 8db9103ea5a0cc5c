//! Exponential backoff for the signaling reconnect loop.

use std::time::{Duration, Instant};

const DEFAULT_INITIAL: Duration = Duration::from_millis(500);
const DEFAULT_MAX: Duration = Duration::from_secs(60);
const DEFAULT_FACTOR: f64 = 1.5;
const DEFAULT_ELAPSED_CAP: Duration = Duration::from_secs(15 * 60);

/// Grows the delay by `factor` on every call to [`Backoff::next`], never past
/// `max`. Once `elapsed_cap` has passed since the first `next`, the policy is
/// exhausted and yields `None` until reset.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    elapsed_cap: Duration,
    current: Duration,
    started_at: Option<Instant>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL, DEFAULT_MAX, DEFAULT_FACTOR, DEFAULT_ELAPSED_CAP)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: f64, elapsed_cap: Duration) -> Self {
        Self {
            initial,
            max,
            factor,
            elapsed_cap,
            current: initial,
            started_at: None,
        }
    }

    /// Next delay to sleep before retrying, or `None` once the elapsed cap is
    /// exhausted.
    pub fn next(&mut self) -> Option<Duration> {
        let started = *self.started_at.get_or_insert_with(Instant::now);
        if started.elapsed() >= self.elapsed_cap {
            return None;
        }

        let delay = self.current;
        self.current = self.current.mul_f64(self.factor).min(self.max);
        Some(delay)
    }

    /// Forget all accumulated state.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_delay_is_initial() {
        let mut b = Backoff::default();
        assert_eq!(b.next(), Some(DEFAULT_INITIAL));
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let mut b = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
            2.0,
            Duration::from_secs(3600),
        );
        assert_eq!(b.next(), Some(Duration::from_secs(1)));
        assert_eq!(b.next(), Some(Duration::from_secs(2)));
        assert_eq!(b.next(), Some(Duration::from_secs(4)));
        // capped
        assert_eq!(b.next(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_reset_restores_initial() {
        let mut b = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            Duration::from_secs(3600),
        );
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_elapsed_cap_exhausts_policy() {
        let mut b = Backoff::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            2.0,
            Duration::ZERO,
        );
        assert_eq!(b.next(), None);
        // still exhausted until reset
        assert_eq!(b.next(), None);
        b.reset();
        assert_eq!(b.next(), Some(Duration::from_millis(10)));
    }
}
