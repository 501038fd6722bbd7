use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::{thread_rng, Rng};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Exponential backoff with randomised intervals and a total elapsed budget.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Runs `operation` until it succeeds or the next wait would carry the
    /// total elapsed time past `max_elapsed`, returning the last error.
    pub async fn retry<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut interval = self.initial_interval;
        let mut attempt: u32 = 1;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let wait = self.randomized(interval);
            if started.elapsed() + wait > self.max_elapsed {
                return Err(error);
            }
            debug!(attempt, wait_ms = wait.as_millis() as u64, error = %format!("{error:#}"), "retrying after backoff");
            sleep(wait).await;

            interval = self.next_interval(interval);
            attempt += 1;
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.multiplier;
        if next >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(next)
        }
    }

    fn randomized(&self, interval: Duration) -> Duration {
        let factor = self.randomization_factor.clamp(0.0, 1.0);
        if factor == 0.0 {
            return interval;
        }
        let jitter: f64 = thread_rng().gen_range((1.0 - factor)..=(1.0 + factor));
        Duration::from_secs_f64(interval.as_secs_f64() * jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_elapsed: Duration) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(5),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(20),
            max_elapsed,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let value = quick(Duration::from_secs(2))
            .retry(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("not yet");
                }
                Ok(7)
            })
            .await
            .expect("eventually succeeds");
        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_last_error_when_budget_spent() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = quick(Duration::from_millis(40))
            .retry(|| async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("failure {n}")
            })
            .await;
        let error = result.expect_err("budget exhausted");
        let made = attempts.load(Ordering::SeqCst);
        assert!(made > 1, "expected more than one attempt, got {made}");
        assert_eq!(error.to_string(), format!("failure {}", made - 1));
    }

    #[test]
    fn intervals_grow_and_cap() {
        let policy = quick(Duration::from_secs(1));
        let second = policy.next_interval(Duration::from_millis(5));
        assert_eq!(second, Duration::from_millis(10));
        assert_eq!(policy.next_interval(Duration::from_millis(15)), Duration::from_millis(20));
    }

    #[test]
    fn randomized_interval_stays_within_factor() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let wait = policy.randomized(Duration::from_millis(1000));
            assert!(wait >= Duration::from_millis(500) && wait <= Duration::from_millis(1500));
        }
    }
}
