//! Bullsession Fetch Crate
//!
//! Resilient external-data fetching for the tool calls (stock quotes, news,
//! symbol search) that LLM agents make during a discussion.
//!
//! # Overview
//!
//! Remote quote APIs are slow, throttled and flaky; agents fire many
//! identical tool calls at once. This crate keeps that traffic survivable:
//! - TTL cache with stale-while-revalidate tiers and LRU eviction
//! - Singleflight coalescing of identical concurrent requests
//! - Per-provider circuit breaking and token-bucket rate limiting
//! - Bounded-concurrency HTTP with classified retry and charset handling
//! - A provider chain composing all of the above into ordered failover
//!
//! # Architecture
//!
//! ```text
//! chain.execute(args)
//!         |
//!         v
//! +------------------+  fresh hit
//! |     TtlCache     | ------------> return
//! +------------------+
//!         | stale hit: return + detached refresh
//!         | miss
//!         v
//! +------------------+  already in flight
//! |   Singleflight   | ------------> join, share the outcome
//! +------------------+
//!         |
//!         v
//! +------------------+   per binding:
//! | provider failover|   RateLimiter -> CircuitBreaker -> DataProvider
//! | (registration    |
//! |  order)          |
//! +------------------+
//!         |
//!         v
//!  first success -> cache + return
//!  exhaustion    -> stale fallback, else aggregated error
//! ```
//!
//! `HttpClient`, `RateLimiter` and `CircuitBreaker` know nothing about each
//! other; [`ProviderChain`] is the only composition point.
//!
//! # Core Types
//!
//! - [`ProviderChain`] - the orchestrator and its degradation ladder
//! - [`DataProvider`] - the narrow interface remote sources implement
//! - [`TtlCache`] / [`CacheHit`] - fresh/stale/expired cache tiers
//! - [`Singleflight`] - per-key request coalescing
//! - [`CircuitBreaker`] / [`CircuitState`] - per-binding breaker
//! - [`RateLimiter`] - per-binding token bucket
//! - [`HttpClient`] / [`ConnectionLimiter`] - bounded-concurrency GET
//! - [`FetchError`] / [`ErrorClass`] - error taxonomy

pub mod cache;
pub mod chain;
pub mod errors;
pub mod http;
pub mod provider;
pub mod singleflight;

// Re-export the public surface.
pub use cache::{CacheConfig, CacheHit, TtlCache};
pub use chain::{
    AttemptLog, BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitState, ProviderAttempt,
    ProviderChain, RateLimitConfig, RateLimiter, SkipCause,
};
pub use errors::{ErrorClass, FetchError};
pub use http::{ConnectionLimiter, HttpClient, HttpOptions};
pub use provider::DataProvider;
pub use singleflight::Singleflight;
