//! Provider chain orchestration.
//!
//! The chain owns one cache, one singleflight group and an ordered list of
//! provider bindings, and composes them into the degradation ladder:
//!
//! 1. Fresh cache hit - returned immediately, zero provider calls.
//! 2. Stale cache hit - returned immediately, detached background refresh.
//! 3. Miss - coalesced through singleflight, then ordered provider
//!    failover, each binding gated by its rate limiter and circuit breaker.
//! 4. Total exhaustion - stale value if one exists, aggregated error
//!    otherwise.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use super::circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerConfig};
use super::diagnostics::{AttemptLog, SkipCause};
use super::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::cache::{CacheConfig, CacheHit, TtlCache};
use crate::errors::FetchError;
use crate::provider::DataProvider;
use crate::singleflight::Singleflight;

/// One registered provider with its private gates.
///
/// Breaker and limiter state is scoped to this binding: two chains wrapping
/// the same physical remote API do not share either.
struct ProviderEntry<A, R> {
    provider: Arc<dyn DataProvider<A, R>>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
}

struct ChainInner<A, R> {
    name: String,
    cache: TtlCache<R>,
    flights: Singleflight<R>,
    cache_key_fn: Box<dyn Fn(&A) -> String + Send + Sync>,
    providers: RwLock<Vec<Arc<ProviderEntry<A, R>>>>,
}

/// Orchestrator composing cache, singleflight and provider failover into a
/// single `execute` entry point.
///
/// Cheap to clone; clones share all state. Safe to call concurrently from
/// many tool-call tasks.
pub struct ProviderChain<A, R> {
    inner: Arc<ChainInner<A, R>>,
}

impl<A, R> Clone for ProviderChain<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> ProviderChain<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create a chain with its cache and key derivation.
    pub fn new(
        name: impl Into<String>,
        cache_config: CacheConfig,
        cache_key_fn: impl Fn(&A) -> String + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(ChainInner {
                cache: TtlCache::new(name.clone(), cache_config),
                flights: Singleflight::new(),
                cache_key_fn: Box::new(cache_key_fn),
                providers: RwLock::new(Vec::new()),
                name,
            }),
        }
    }

    /// Register a provider with its own breaker and limiter.
    ///
    /// Registration order is failover priority and never changes at
    /// runtime.
    pub fn add_provider(
        &self,
        provider: Arc<dyn DataProvider<A, R>>,
        breaker_config: CircuitBreakerConfig,
        limit_config: RateLimitConfig,
    ) {
        let name = provider.name().to_string();
        let entry = ProviderEntry {
            breaker: CircuitBreaker::with_config(name.clone(), breaker_config),
            limiter: RateLimiter::new(name.clone(), limit_config),
            provider,
        };
        self.inner.write_providers().push(Arc::new(entry));
        debug!("chain '{}': registered provider '{}'", self.inner.name, name);
    }

    /// Fetch a result, walking the degradation ladder.
    pub async fn execute(&self, args: A) -> Result<R, FetchError> {
        let key = (self.inner.cache_key_fn)(&args);

        match self.inner.cache.get(&key) {
            CacheHit::Fresh(value) => {
                debug!("chain '{}': fresh cache hit for '{}'", self.inner.name, key);
                return Ok(value);
            }
            CacheHit::Stale(value) => {
                debug!(
                    "chain '{}': stale cache hit for '{}', refreshing in background",
                    self.inner.name, key
                );
                self.spawn_revalidate(args, key);
                return Ok(value);
            }
            CacheHit::Miss => {}
        }

        let flight_inner = Arc::clone(&self.inner);
        let flight_args = args.clone();
        let flight_key = key.clone();

        self.inner
            .flights
            .execute(&key, move || async move {
                // A racing flight may have populated the cache while this
                // caller was reaching for the flight map.
                if let CacheHit::Fresh(value) = flight_inner.cache.get(&flight_key) {
                    debug!(
                        "chain '{}': '{}' populated by a racing flight",
                        flight_inner.name, flight_key
                    );
                    return Ok(value);
                }

                match flight_inner.run_providers(&flight_args, &flight_key).await {
                    Ok(value) => Ok(value),
                    Err(error) => match flight_inner.cache.get(&flight_key) {
                        // Last resort: any still-eligible cached value beats
                        // surfacing the failure.
                        CacheHit::Fresh(value) | CacheHit::Stale(value) => {
                            warn!(
                                "chain '{}': every provider failed for '{}', serving stale value",
                                flight_inner.name, flight_key
                            );
                            Ok(value)
                        }
                        CacheHit::Miss => Err(error),
                    },
                }
            })
            .await
    }

    /// Detached best-effort refresh of a stale entry. Errors are swallowed
    /// and observable only through logs. The `"bg:"` key prefix keeps
    /// concurrent stale hits down to one refresh without colliding with
    /// the foreground miss flight.
    fn spawn_revalidate(&self, args: A, key: String) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let bg_key = format!("bg:{}", key);
            let flight_inner = Arc::clone(&inner);
            let flight_args = args.clone();
            let flight_key = key.clone();

            let result = inner
                .flights
                .execute(&bg_key, move || async move {
                    flight_inner.run_providers(&flight_args, &flight_key).await
                })
                .await;

            match result {
                Ok(_) => debug!("chain '{}': background refresh of '{}' done", inner.name, key),
                Err(e) => warn!(
                    "chain '{}': background refresh of '{}' failed: {}",
                    inner.name, key, e
                ),
            }
        });
    }

    /// Registered provider names, in failover order.
    pub fn providers(&self) -> Vec<String> {
        self.inner
            .read_providers()
            .iter()
            .map(|entry| entry.provider.name().to_string())
            .collect()
    }

    /// Manually close a provider's circuit. Returns whether the provider
    /// was found.
    pub fn reset_circuit(&self, provider: &str) -> bool {
        let providers = self.inner.read_providers();
        match providers.iter().find(|e| e.provider.name() == provider) {
            Some(entry) => {
                entry.breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Breaker snapshot for one provider binding.
    pub fn breaker_metrics(&self, provider: &str) -> Option<BreakerMetrics> {
        self.inner
            .read_providers()
            .iter()
            .find(|e| e.provider.name() == provider)
            .map(|entry| entry.breaker.metrics())
    }

    /// Current cache entry count.
    pub fn cache_size(&self) -> usize {
        self.inner.cache.size()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl<A, R> ChainInner<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Walk the providers in registration order; first success wins and is
    /// written back to the cache.
    async fn run_providers(&self, args: &A, key: &str) -> Result<R, FetchError> {
        let entries: Vec<Arc<ProviderEntry<A, R>>> = self.read_providers().to_vec();

        if entries.is_empty() {
            warn!("chain '{}': no providers registered", self.name);
            return Err(FetchError::AllProvidersFailed {
                chain: self.name.clone(),
                attempts: "no providers registered".to_string(),
            });
        }

        let mut log = AttemptLog::new();

        for entry in entries {
            let provider_name = entry.provider.name().to_string();

            if let Err(e) = entry.limiter.acquire() {
                let retry_after_ms = match &e {
                    FetchError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
                    _ => 0,
                };
                debug!(
                    "chain '{}': provider '{}' rate limited, skipping",
                    self.name, provider_name
                );
                log.record_skip(provider_name.as_str(), SkipCause::RateLimited { retry_after_ms });
                continue;
            }

            match entry.breaker.execute(|| entry.provider.execute(args)).await {
                Ok(value) => {
                    log.record_success(provider_name.as_str());
                    info!("chain '{}': provider '{}' served '{}'", self.name, provider_name, key);
                    self.cache.set(key, value.clone());
                    return Ok(value);
                }
                Err(FetchError::CircuitOpen { .. }) => {
                    debug!(
                        "chain '{}': circuit open for '{}', skipping",
                        self.name, provider_name
                    );
                    log.record_skip(provider_name.as_str(), SkipCause::CircuitOpen);
                }
                Err(e) => {
                    warn!(
                        "chain '{}': provider '{}' failed: {}",
                        self.name, provider_name, e
                    );
                    log.record_error(provider_name.as_str(), e.to_string());
                }
            }
        }

        warn!("chain '{}': exhausted providers for '{}': {}", self.name, key, log.summary());
        Err(FetchError::AllProvidersFailed {
            chain: self.name.clone(),
            attempts: log.summary(),
        })
    }

    fn read_providers(&self) -> RwLockReadGuard<'_, Vec<Arc<ProviderEntry<A, R>>>> {
        self.providers.read().unwrap_or_else(|poisoned| {
            warn!("chain '{}': provider list lock poisoned, recovering", self.name);
            poisoned.into_inner()
        })
    }

    fn write_providers(&self) -> RwLockWriteGuard<'_, Vec<Arc<ProviderEntry<A, R>>>> {
        self.providers.write().unwrap_or_else(|poisoned| {
            warn!("chain '{}': provider list lock poisoned, recovering", self.name);
            poisoned.into_inner()
        })
    }
}
