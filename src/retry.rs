//! Retry with capped exponential backoff and jitter for transient provider
//! errors.
//!
//! Only errors whose classification is retryable (rate limits, timeouts,
//! connection failures, 5xx) are retried. Everything else surfaces
//! immediately: retrying an invalid API key or a content-policy rejection
//! will never produce a different answer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use crate::errors::ProviderError;
use crate::prelude::*;

/// Hard floor on any computed delay, preventing degenerate tight loops.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial call.
    pub max_retries: u32,

    /// Base delay before the first retry.
    pub base_delay: Duration,

    /// Cap on any single delay.
    pub max_delay: Duration,

    /// Multiplier applied per attempt.
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            exponential_base: 2.0,
        }
    }
}

/// Compute the delay before retry `attempt` (0-indexed): the capped
/// exponential, plus uniform jitter in ±25%, floored at [`MIN_RETRY_DELAY`].
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exp = config.base_delay.as_secs_f64() * config.exponential_base.powi(attempt as i32);
    let capped = exp.min(config.max_delay.as_secs_f64());
    let jitter = capped * 0.25 * (2.0 * rand::thread_rng().r#gen::<f64>() - 1.0);
    Duration::from_secs_f64((capped + jitter).max(MIN_RETRY_DELAY.as_secs_f64()))
}

/// Thread-safe counters describing retry activity across the run.
#[derive(Debug, Default)]
pub struct RetryMetrics {
    inner: Mutex<RetryMetricsInner>,
}

#[derive(Debug, Default)]
struct RetryMetricsInner {
    total_retries: u64,
    successful_retries: u64,
    exhausted_retries: u64,
    retries_by_provider: HashMap<String, u64>,
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one retry attempt. `success` marks a retry attempt that
    /// returned a value; a first-attempt success is never recorded here.
    pub fn record_retry(&self, provider: &str, success: bool) {
        let mut inner = self.inner.lock().expect("retry metrics lock poisoned");
        inner.total_retries += 1;
        *inner.retries_by_provider.entry(provider.to_owned()).or_insert(0) += 1;
        if success {
            inner.successful_retries += 1;
        }
    }

    /// Record that all retries for a call were exhausted.
    pub fn record_exhausted(&self, provider: &str) {
        let mut inner = self.inner.lock().expect("retry metrics lock poisoned");
        inner.exhausted_retries += 1;
        inner.retries_by_provider.entry(provider.to_owned()).or_insert(0);
    }

    /// Snapshot the counters as a JSON object for the run summary.
    pub fn summary(&self) -> Value {
        let inner = self.inner.lock().expect("retry metrics lock poisoned");
        let success_rate = if inner.total_retries > 0 {
            inner.successful_retries as f64 / inner.total_retries as f64
        } else {
            0.0
        };
        json!({
            "total_retries": inner.total_retries,
            "successful_retries": inner.successful_retries,
            "exhausted_retries": inner.exhausted_retries,
            "success_rate": success_rate,
            "retries_by_provider": &inner.retries_by_provider,
        })
    }
}

/// A retry configuration bound to shared metrics. Each provider adapter
/// holds one and routes every raw API call through [`RetryPolicy::run`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
    pub metrics: std::sync::Arc<RetryMetrics>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, metrics: std::sync::Arc<RetryMetrics>) -> Self {
        Self { config, metrics }
    }

    /// Execute `call` with retry for transient failures.
    ///
    /// Non-retryable classifications and circuit-breaker rejections surface
    /// immediately. When attempts are exhausted the last error is returned
    /// and an exhausted metric recorded. The sleep between attempts is a
    /// cancellation point.
    pub async fn run<T, F, Fut>(
        &self,
        provider: &str,
        mut call: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        for attempt in 0..=self.config.max_retries {
            match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        self.metrics.record_retry(provider, true);
                        info!(provider, attempt = attempt + 1, "retry succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let Some(classified) = err.classified() else {
                        // Circuit-breaker rejections are handled by the
                        // caller's fallback logic, never retried here.
                        return Err(err);
                    };
                    if !classified.is_retryable {
                        warn!(provider, %classified, "non-retryable error");
                        return Err(err);
                    }
                    if attempt < self.config.max_retries {
                        let delay = backoff_delay(attempt, &self.config);
                        warn!(
                            provider,
                            attempt = attempt + 1,
                            attempts = self.config.max_retries + 1,
                            delay_ms = delay.as_millis() as u64,
                            %classified,
                            "retryable error, backing off"
                        );
                        self.metrics.record_retry(provider, false);
                        tokio::time::sleep(delay).await;
                    } else {
                        self.metrics.record_exhausted(provider);
                        error!(
                            provider,
                            attempts = self.config.max_retries + 1,
                            %classified,
                            "all retry attempts exhausted"
                        );
                        return Err(err);
                    }
                }
            }
        }
        unreachable!("retry loop returns from within its body")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::errors::{ClassifiedError, ErrorCategory};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            exponential_base: 2.0,
        }
    }

    fn policy(max_retries: u32) -> (RetryPolicy, Arc<RetryMetrics>) {
        let metrics = Arc::new(RetryMetrics::new());
        (RetryPolicy::new(fast_config(max_retries), metrics.clone()), metrics)
    }

    fn transient(provider: &str) -> ProviderError {
        ClassifiedError::new(ErrorCategory::Server, provider, "503").into()
    }

    fn fatal(provider: &str) -> ProviderError {
        ClassifiedError::new(ErrorCategory::Authentication, provider, "bad key").into()
    }

    #[test]
    fn backoff_delay_stays_in_jitter_band() {
        let config = RetryConfig::default();
        for attempt in 0..6 {
            let exp = 1.0_f64 * 2.0_f64.powi(attempt);
            let capped = exp.min(32.0);
            let delay = backoff_delay(attempt as u32, &config).as_secs_f64();
            assert!(delay >= (capped * 0.75).max(0.1), "attempt {attempt}: {delay}");
            assert!(delay <= capped * 1.25, "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn backoff_delay_has_floor() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            exponential_base: 2.0,
        };
        for attempt in 0..4 {
            assert!(backoff_delay(attempt, &config) >= MIN_RETRY_DELAY);
        }
    }

    #[tokio::test]
    async fn first_attempt_success_is_not_a_retry_success() {
        let (policy, metrics) = policy(3);
        let result: Result<u32, ProviderError> =
            policy.run("openai", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        let summary = metrics.summary();
        assert_eq!(summary["total_retries"], 0);
        assert_eq!(summary["successful_retries"], 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let (policy, metrics) = policy(5);
        let calls = AtomicU32::new(0);
        let result = policy
            .run("openai", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 { Err(transient("openai")) } else { Ok("ok") }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let summary = metrics.summary();
        assert_eq!(summary["total_retries"], 3); // 2 failed + 1 successful
        assert_eq!(summary["successful_retries"], 1);
        assert_eq!(summary["exhausted_retries"], 0);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let (policy, metrics) = policy(5);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("anthropic", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(fatal("anthropic")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.summary()["total_retries"], 0);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error_and_records() {
        let (policy, metrics) = policy(2);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("google", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient("google")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // initial + 2 retries
        let summary = metrics.summary();
        assert_eq!(summary["exhausted_retries"], 1);
        assert_eq!(summary["retries_by_provider"]["google"], 2);
    }

    #[tokio::test]
    async fn zero_max_retries_is_single_shot() {
        let (policy, _) = policy(0);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("xai", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient("xai")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_open_is_never_retried() {
        let (policy, _) = policy(5);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .run("openai", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::CircuitOpen { provider: "openai".into() })
                }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
