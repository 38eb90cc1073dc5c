//! Randomised exponential backoff with an overall deadline.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::ConsumerConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Each delay is drawn from `interval * [1 - r, 1 + r]`
    pub randomization_factor: f64,
    pub max_interval: Duration,
    /// No retry is scheduled past this point after the first attempt
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        (&ConsumerConfig::default()).into()
    }
}

impl From<&ConsumerConfig> for RetryPolicy {
    fn from(cfg: &ConsumerConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(cfg.initial_backoff_ms),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_millis(cfg.max_backoff_ms),
            max_elapsed: Duration::from_millis(cfg.max_retry_elapsed_ms),
        }
    }
}

/// Delay schedule for one operation; create a new one per operation.
#[derive(Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            current: policy.initial_interval,
            policy,
            started: Instant::now(),
        }
    }

    /// Delay before the next attempt, or `None` once the deadline would pass.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.randomized(self.current);
        self.current = self
            .current
            .mul_f64(self.policy.multiplier)
            .min(self.policy.max_interval);

        if self.started.elapsed() + delay > self.policy.max_elapsed {
            return None;
        }
        Some(delay)
    }

    fn randomized(&self, interval: Duration) -> Duration {
        let r = self.policy.randomization_factor.clamp(0.0, 1.0);
        if r == 0.0 {
            return interval;
        }
        let factor = rand::thread_rng().gen_range((1.0 - r)..=(1.0 + r));
        interval.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_elapsed_ms: u64) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(500),
            max_elapsed: Duration::from_millis(max_elapsed_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_intervals_grow_up_to_max() {
        let mut backoff = ExponentialBackoff::new(policy(60_000));
        let delays: Vec<u128> = (0..5)
            .map(|_| backoff.next_backoff().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_max_elapsed() {
        let mut backoff = ExponentialBackoff::new(policy(1_000));
        assert!(backoff.next_backoff().is_some());
        tokio::time::advance(Duration::from_millis(950)).await;
        assert!(backoff.next_backoff().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_randomized_delay_within_bounds() {
        let mut p = policy(60_000);
        p.randomization_factor = 0.5;
        let mut backoff = ExponentialBackoff::new(p);
        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(150));
    }

    #[test]
    fn test_policy_from_consumer_config() {
        let p = RetryPolicy::default();
        assert_eq!(p.initial_interval, Duration::from_millis(500));
        assert_eq!(p.max_interval, Duration::from_secs(60));
        assert_eq!(p.max_elapsed, Duration::from_secs(120));
    }
}
