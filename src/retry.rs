use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
    pub jitter_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt + 1` (0-based), with symmetric jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let pow = self.backoff_multiplier.powi(attempt as i32);
        let base_ms = self.initial_backoff.as_millis() as f32 * pow;
        let delay_ms = (base_ms as u64).min(self.max_backoff.as_millis() as u64);

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 || delay_ms == 0 {
            return Duration::from_millis(delay_ms);
        }
        let scale: f32 = rand::rng().random_range(-jitter..=jitter);
        let adjusted = (delay_ms as i64 + (delay_ms as f32 * scale).round() as i64).max(0);
        Duration::from_millis(adjusted as u64)
    }
}

/// Runs `operation` until it succeeds, `should_retry` declines, or retries run out.
pub async fn retry_with_backoff<Op, Fut, T, E, Retry>(
    config: &RetryConfig,
    mut operation: Op,
    should_retry: Retry,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Retry: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < config.max_retries && should_retry(&err) => {
                let delay = config.backoff_delay(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(10), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let config = RetryConfig::default();
        for _ in 0..50 {
            let delay = config.backoff_delay(0).as_millis();
            assert!((80..=120).contains(&delay), "delay {delay}ms out of range");
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            &fast_config(3),
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retryable_or_exhaustion() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            &fast_config(5),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
            |err| err != "fatal",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        let _: Result<(), String> = retry_with_backoff(
            &fast_config(2),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("transient".to_string()) }
            },
            |_| true,
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
