//! Retry budget and geometric backoff for the sender.

use std::time::Duration;

/// Longest single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(3600);

/// How many times, and how patiently, to retry a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Delay before the first retry.
    pub interval: Duration,
    /// Multiplier applied to the delay after each retry. Values `<= 0`
    /// keep the delay constant.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            interval: Duration::from_secs(1),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Fresh delay sequence for one `send_file` call.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.interval.min(MAX_DELAY),
            factor: self.factor,
        }
    }
}

/// Geometric delay sequence: `interval, interval*factor, interval*factor², ...`
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    factor: f64,
}

impl Backoff {
    /// Returns the current delay and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        if self.factor > 0.0 {
            self.next = Duration::try_from_secs_f64(delay.as_secs_f64() * self.factor)
                .unwrap_or(MAX_DELAY)
                .min(MAX_DELAY);
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_geometrically() {
        let policy = RetryPolicy {
            retries: 3,
            interval: Duration::from_millis(1000),
            factor: 1.5,
        };
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2250));
    }

    #[test]
    fn non_positive_factor_keeps_delay() {
        for factor in [0.0, -1.0] {
            let policy = RetryPolicy {
                retries: 2,
                interval: Duration::from_millis(200),
                factor,
            };
            let mut backoff = policy.backoff();
            assert_eq!(backoff.next_delay(), Duration::from_millis(200));
            assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            retries: 100,
            interval: Duration::from_secs(1800),
            factor: 10.0,
        };
        let mut backoff = policy.backoff();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), MAX_DELAY);
        assert_eq!(backoff.next_delay(), MAX_DELAY);
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 3);
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(RetryPolicy::none().retries, 0);
    }
}
