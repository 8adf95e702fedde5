//! Per-binding circuit breaker for fault tolerance.
//!
//! Implements the circuit breaker pattern to stop calling a failing
//! provider for a cooldown period. The circuit has three states:
//!
//! - **Closed**: normal operation, calls are allowed through.
//! - **Open**: the provider is failing, calls are refused without running.
//! - **HalfOpen**: cooldown elapsed, one probe call decides the next state.
//!
//! State is in-memory, private to one (provider, chain) binding, and resets
//! on application restart. The Open to HalfOpen transition happens lazily
//! when the state is read; there is no background timer.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::errors::FetchError;

/// Default number of consecutive failures before opening the circuit.
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default time to wait before probing a failing provider again.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Default number of rolling samples kept for the health score.
const DEFAULT_WINDOW_SIZE: usize = 20;

/// Latency at which the health score bottoms out, in milliseconds.
const HEALTH_LATENCY_CEILING_MS: f64 = 10_000.0;

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CircuitState {
    /// Normal operation - calls are allowed.
    Closed,
    /// Provider is failing - calls are refused.
    Open,
    /// Testing recovery - the next call is a probe.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time to wait before probing again.
    pub cooldown: Duration,
    /// Rolling sample count for the health score.
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// One observed call outcome.
#[derive(Clone, Copy, Debug)]
struct Sample {
    ok: bool,
    latency_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    history: VecDeque<Sample>,
}

/// Point-in-time breaker snapshot for diagnostics surfaces.
#[derive(Clone, Debug)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub health_score: f64,
    pub samples: usize,
}

/// Per-binding circuit breaker.
///
/// Wraps provider calls via [`execute`](Self::execute); when Open, the call
/// is refused with [`FetchError::CircuitOpen`] and the wrapped function
/// never runs.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a breaker with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    /// Create a breaker with custom configuration.
    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                history: VecDeque::with_capacity(config.window_size),
            }),
            config,
        }
    }

    /// Lock the breaker state, recovering from poison if necessary.
    ///
    /// Slightly stale breaker state is preferable to panicking.
    fn lock_inner(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("circuit breaker '{}' mutex was poisoned, recovering", self.name);
            poisoned.into_inner()
        })
    }

    /// Current state, flipping Open to HalfOpen once the cooldown elapsed.
    pub fn current_state(&self) -> CircuitState {
        let mut inner = self.lock_inner();

        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.cooldown)
                .unwrap_or(false);
            if cooled_down {
                info!("circuit breaker '{}': Open -> HalfOpen, probing", self.name);
                inner.state = CircuitState::HalfOpen;
            }
        }

        inner.state
    }

    /// Run `f` under the breaker, timing it and recording the outcome.
    ///
    /// When the circuit is Open, returns [`FetchError::CircuitOpen`]
    /// without invoking `f`.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        if self.current_state() == CircuitState::Open {
            return Err(FetchError::CircuitOpen {
                provider: self.name.clone(),
            });
        }

        let started = Instant::now();
        let result = f().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => self.record_success(latency_ms),
            Err(_) => self.record_failure(latency_ms),
        }

        result
    }

    fn record_success(&self, latency_ms: u64) {
        let mut inner = self.lock_inner();
        inner.consecutive_failures = 0;
        push_sample(&mut inner.history, self.config.window_size, Sample { ok: true, latency_ms });

        if inner.state == CircuitState::HalfOpen {
            info!("circuit breaker '{}': probe succeeded, closing circuit", self.name);
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    fn record_failure(&self, latency_ms: u64) {
        let mut inner = self.lock_inner();
        inner.consecutive_failures += 1;
        push_sample(&mut inner.history, self.config.window_size, Sample { ok: false, latency_ms });

        match inner.state {
            CircuitState::HalfOpen => {
                info!("circuit breaker '{}': probe failed, reopening circuit", self.name);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    info!(
                        "circuit breaker '{}': opening after {} consecutive failures",
                        self.name, inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                } else {
                    debug!(
                        "circuit breaker '{}': failure {}/{}",
                        self.name, inner.consecutive_failures, self.config.failure_threshold
                    );
                }
            }
            CircuitState::Open => {
                // execute refuses while Open, so nothing should land here.
                debug!("circuit breaker '{}': failure recorded while Open", self.name);
            }
        }
    }

    /// Rolling health score in `[0, 1]`, observability only.
    ///
    /// `success_rate * (1 - avg_latency_ms / 10000)`, clamped at 0. An
    /// empty history reads as fully healthy.
    pub fn health_score(&self) -> f64 {
        let inner = self.lock_inner();

        if inner.history.is_empty() {
            return 1.0;
        }

        let total = inner.history.len() as f64;
        let ok = inner.history.iter().filter(|s| s.ok).count() as f64;
        let avg_latency: f64 =
            inner.history.iter().map(|s| s.latency_ms as f64).sum::<f64>() / total;

        let score = (ok / total) * (1.0 - avg_latency / HEALTH_LATENCY_CEILING_MS);
        score.max(0.0)
    }

    /// Current consecutive-failure count.
    pub fn failure_count(&self) -> u32 {
        self.lock_inner().consecutive_failures
    }

    /// Manually reset the circuit to Closed and clear its history.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        info!("circuit breaker '{}': manual reset", self.name);
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.history.clear();
    }

    /// Snapshot for diagnostics.
    pub fn metrics(&self) -> BreakerMetrics {
        let samples = self.lock_inner().history.len();
        BreakerMetrics {
            state: self.current_state(),
            consecutive_failures: self.failure_count(),
            health_score: self.health_score(),
            samples,
        }
    }
}

fn push_sample(history: &mut VecDeque<Sample>, window_size: usize, sample: Sample) {
    history.push_back(sample);
    while history.len() > window_size {
        history.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(20),
            window_size: 20,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async {
                Err::<(), _>(FetchError::Provider {
                    provider: "TEST".to_string(),
                    message: "down".to_string(),
                })
            })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let result = breaker.execute(|| async { Ok(1u32) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let breaker = CircuitBreaker::new("TEST");
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::with_config("TEST", quick_config());

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.current_state(), CircuitState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.current_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_refuses_without_invoking() {
        let breaker = CircuitBreaker::with_config("TEST", quick_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            })
            .await;

        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::with_config("TEST", quick_config());

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        succeed(&breaker).await;
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown() {
        let breaker = CircuitBreaker::with_config("TEST", quick_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.current_state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let breaker = CircuitBreaker::with_config("TEST", quick_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::with_config("TEST", quick_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.current_state(), CircuitState::Open);

        // The reopened circuit refuses again until the next cooldown.
        let result = breaker.execute(|| async { Ok(1u32) }).await;
        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_health_score_degrades_with_failures() {
        let breaker = CircuitBreaker::with_config("TEST", quick_config());
        assert!((breaker.health_score() - 1.0).abs() < f64::EPSILON);

        succeed(&breaker).await;
        fail(&breaker).await;

        let score = breaker.health_score();
        assert!(score > 0.0);
        assert!(score <= 0.5 + f64::EPSILON);
    }

    #[tokio::test]
    async fn test_history_capped_at_window() {
        let config = CircuitBreakerConfig {
            failure_threshold: 100,
            cooldown: Duration::from_millis(20),
            window_size: 5,
        };
        let breaker = CircuitBreaker::with_config("TEST", config);

        for _ in 0..8 {
            succeed(&breaker).await;
        }
        assert_eq!(breaker.metrics().samples, 5);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let breaker = CircuitBreaker::with_config("TEST", quick_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.current_state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.metrics().samples, 0);
    }
}
