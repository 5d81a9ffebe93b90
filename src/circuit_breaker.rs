//! Per-provider circuit breakers.
//!
//! A breaker guards every call to a provider. Consecutive failures trip it
//! OPEN, after which calls fail fast without touching the provider until a
//! cooldown elapses; the first call after the cooldown runs as a HALF_OPEN
//! trial whose outcome decides whether the circuit closes again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::errors::ProviderError;
use crate::prelude::*;

/// Configuration shared by all breakers in a registry.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED that trip the circuit.
    pub failure_threshold: u32,

    /// How long an OPEN circuit waits before allowing a trial call.
    pub cooldown: Duration,

    /// Concurrent trial calls allowed in HALF_OPEN.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    half_open_calls: u32,
    total_calls: u64,
    total_failures: u64,
}

/// A read-only snapshot of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: String,
    pub consecutive_failures: u32,
    pub last_failure_age_seconds: Option<f64>,
    pub half_open_calls: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub error_rate: f64,
}

/// Circuit breaker for a single named provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_owned(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                half_open_calls: 0,
                total_calls: 0,
                total_failures: 0,
            }),
        }
    }

    /// Run `call` through the breaker. In OPEN (within the cooldown) the
    /// downstream is never invoked and `CircuitOpen` is returned directly.
    /// The lock is never held across the await.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.acquire()?;
        let result = call().await;
        self.record_outcome(result.is_ok());
        result
    }

    /// Admission check; transitions OPEN to HALF_OPEN when the cooldown has
    /// elapsed.
    fn acquire(&self) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {}
            BreakerState::Open => {
                if self.cooldown_elapsed(&inner) {
                    info!(breaker = %self.name, "cooldown elapsed, moving to half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_calls = 0;
                } else {
                    return Err(ProviderError::CircuitOpen { provider: self.name.clone() });
                }
            }
            BreakerState::HalfOpen => {}
        }
        if inner.state == BreakerState::HalfOpen {
            if inner.half_open_calls >= self.config.half_open_max_calls {
                return Err(ProviderError::CircuitOpen { provider: self.name.clone() });
            }
            inner.half_open_calls += 1;
        }
        inner.total_calls += 1;
        Ok(())
    }

    fn record_outcome(&self, success: bool) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }
        if success {
            match inner.state {
                BreakerState::HalfOpen => {
                    info!(breaker = %self.name, "trial call succeeded, closing circuit");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                }
                _ => inner.consecutive_failures = 0,
            }
        } else {
            inner.total_failures += 1;
            inner.consecutive_failures += 1;
            inner.last_failure_at = Some(Instant::now());
            match inner.state {
                BreakerState::HalfOpen => {
                    warn!(breaker = %self.name, "trial call failed, reopening circuit");
                    inner.state = BreakerState::Open;
                }
                BreakerState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                    inner.state = BreakerState::Open;
                }
                _ => {}
            }
        }
    }

    /// Whether a call would currently be admitted. OPEN circuits report
    /// available once the cooldown has elapsed, so callers may re-probe
    /// eagerly.
    pub fn is_available(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => self.cooldown_elapsed(&inner),
        }
    }

    /// Current state without mutating anything.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        let error_rate = if inner.total_calls > 0 {
            inner.total_failures as f64 / inner.total_calls as f64
        } else {
            0.0
        };
        BreakerStats {
            state: inner.state.as_str().to_owned(),
            consecutive_failures: inner.consecutive_failures,
            last_failure_age_seconds: inner.last_failure_at.map(|t| t.elapsed().as_secs_f64()),
            half_open_calls: inner.half_open_calls,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            error_rate,
        }
    }

    /// Force the breaker back to CLOSED, clearing failure history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        inner.half_open_calls = 0;
    }

    fn cooldown_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .last_failure_at
            .map(|t| t.elapsed() >= self.config.cooldown)
            .unwrap_or(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().expect("circuit breaker lock poisoned")
    }
}

/// Process-wide mapping from provider name to breaker.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, breakers: Mutex::new(HashMap::new()) }
    }

    /// Get the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breaker registry lock poisoned");
        breakers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Stats for every registered breaker, keyed by provider name.
    pub fn all_stats(&self) -> BTreeMap<String, BreakerStats> {
        let breakers = self.breakers.lock().expect("breaker registry lock poisoned");
        breakers.iter().map(|(name, b)| (name.clone(), b.stats())).collect()
    }

    /// Breaker state strings for every registered breaker.
    pub fn all_states(&self) -> BTreeMap<String, String> {
        let breakers = self.breakers.lock().expect("breaker registry lock poisoned");
        breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.state().as_str().to_owned()))
            .collect()
    }

    pub fn reset(&self, name: &str) {
        if let Some(breaker) =
            self.breakers.lock().expect("breaker registry lock poisoned").get(name)
        {
            breaker.reset();
        }
    }

    pub fn reset_all(&self) {
        let breakers = self.breakers.lock().expect("breaker registry lock poisoned");
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ClassifiedError, ErrorCategory};

    fn test_config(cooldown_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(cooldown_ms),
            half_open_max_calls: 1,
        }
    }

    fn failing_call() -> Result<(), ProviderError> {
        Err(ClassifiedError::new(ErrorCategory::Server, "test", "boom").into())
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { failing_call() }).await;
    }

    #[tokio::test]
    async fn opens_on_exactly_threshold_failures() {
        let breaker = CircuitBreaker::new("test", test_config(60_000));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker).await; // threshold-th failure trips it
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_calling_downstream() {
        let breaker = CircuitBreaker::new("test", test_config(60_000));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        let mut called = false;
        let result = breaker
            .execute(|| {
                called = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::CircuitOpen { .. })));
        assert!(!called);
        assert!(!breaker.is_available());
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", test_config(60_000));
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.execute(|| async { Ok::<_, ProviderError>(()) }).await.unwrap();
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_success_closes_circuit() {
        let breaker = CircuitBreaker::new("test", test_config(5));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(breaker.is_available());

        breaker.execute(|| async { Ok::<_, ProviderError>(()) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new("test", test_config(5));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        fail(&breaker).await; // trial call fails
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.is_available());
    }

    #[tokio::test]
    async fn stats_track_calls_and_error_rate() {
        let breaker = CircuitBreaker::new("test", test_config(60_000));
        breaker.execute(|| async { Ok::<_, ProviderError>(()) }).await.unwrap();
        fail(&breaker).await;
        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.total_failures, 1);
        assert!((stats.error_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn registry_returns_same_breaker_per_name() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("openai");
        let b = registry.get_or_create("openai");
        assert!(Arc::ptr_eq(&a, &b));

        fail(&a).await;
        assert_eq!(registry.all_stats()["openai"].total_failures, 1);
    }

    #[tokio::test]
    async fn reset_closes_an_open_circuit() {
        let registry = CircuitBreakerRegistry::new(test_config(60_000));
        let breaker = registry.get_or_create("openai");
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        registry.reset("openai");
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
