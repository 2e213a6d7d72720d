//! Exponential sleep backoff for polling loops.
//!
//! Queue delivery loops poll storage instead of blocking on it, so an idle
//! queue must not turn into a busy loop. Each empty poll doubles the wait up to
//! `max`; a successful poll resets it to `min`.

use std::time::Duration;

/// Lower bound on every delay, so a zero `min` still yields to the runtime.
const MIN_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(MIN_DELAY);
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Returns the delay to wait now and grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_max_and_resets() {
        let mut b = PollBackoff::new(Duration::from_millis(5), Duration::from_millis(30));
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, [5, 10, 20, 30, 30]);

        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(5));
    }

    #[test]
    fn max_below_min_is_clamped() {
        let mut b = PollBackoff::new(Duration::from_millis(10), Duration::from_millis(1));
        assert_eq!(b.next_delay(), Duration::from_millis(10));
        assert_eq!(b.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn zero_min_still_sleeps() {
        let mut b = PollBackoff::new(Duration::ZERO, Duration::from_millis(4));
        let delays: Vec<Duration> = (0..4).map(|_| b.next_delay()).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 4].map(Duration::from_millis)
        );
    }
}
