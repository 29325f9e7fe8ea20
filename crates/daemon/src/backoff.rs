//! Exponential backoff with optional jitter.

use rand::Rng;
use std::time::Duration;

/// Iterator of growing retry delays.
///
/// `MaxInterval` caps the base interval, jitter is applied on top of it.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub randomization: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
            randomization: 0.0,
            current: initial,
        }
    }

    /// Credentials resend schedule: 1s growing by 1.6x up to 60s.
    pub fn credentials() -> Self {
        Self::new(Duration::from_secs(1), 1.6, Duration::from_secs(60))
    }

    /// Agent re-creation schedule.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_millis(500), 2.0, Duration::from_secs(30)).with_jitter(0.1)
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.randomization = factor.clamp(0.0, 1.0);
        self
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    fn jitter(&self, d: Duration) -> Duration {
        if self.randomization <= 0.0 {
            return d;
        }
        let delta = d.as_secs_f64() * self.randomization;
        let lo = d.as_secs_f64() - delta;
        let hi = d.as_secs_f64() + delta;
        Duration::from_secs_f64(rand::thread_rng().gen_range(lo..=hi))
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let next = self.jitter(self.current);

        if self.current.as_secs_f64() >= self.max.as_secs_f64() / self.multiplier {
            self.current = self.max;
        } else {
            self.current = self.current.mul_f64(self.multiplier);
        }

        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_schedule() {
        let delays: Vec<u64> = ExponentialBackoff::credentials()
            .take(12)
            .map(|d| d.as_millis() as u64)
            .collect();

        assert_eq!(delays[0], 1000);
        assert_eq!(delays[1], 1600);
        assert_eq!(delays[2], 2560);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), 60_000);
    }

    #[test]
    fn test_jitter_bounds() {
        let b = ExponentialBackoff::new(Duration::from_secs(10), 2.0, Duration::from_secs(10))
            .with_jitter(0.1);
        for d in b.take(50) {
            assert!(d >= Duration::from_secs(9) && d <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_reset() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(100), 3.0, Duration::from_secs(1));
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Some(Duration::from_millis(100)));
    }
}
