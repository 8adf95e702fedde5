//! Process-wide HTTP concurrency limiter.
//!
//! One [`ConnectionLimiter`] is constructed at startup and cloned into every
//! [`HttpClient`](super::HttpClient), so all providers and chains share a
//! single outbound-request quota. Waiters queue in FIFO order.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::errors::FetchError;

/// Default cap on concurrent outbound HTTP requests.
const DEFAULT_MAX_CONCURRENT: usize = 6;

/// Environment variable overriding the concurrency cap.
const MAX_CONCURRENT_ENV: &str = "STOCK_MAX_CONCURRENT";

/// Shared counting semaphore gating outbound HTTP requests.
///
/// Cloning is cheap and every clone shares the same quota.
#[derive(Clone)]
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConnectionLimiter {
    /// Create a limiter with an explicit capacity.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            capacity: max_concurrent,
        }
    }

    /// Create a limiter configured from `STOCK_MAX_CONCURRENT` (default 6).
    pub fn from_env() -> Self {
        let max_concurrent = std::env::var(MAX_CONCURRENT_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_CONCURRENT);
        Self::new(max_concurrent)
    }

    /// Acquire a request slot, waiting in FIFO order if the quota is
    /// exhausted. The slot is released when the returned permit drops.
    pub async fn slot(&self) -> Result<OwnedSemaphorePermit, FetchError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| FetchError::TaskFailed {
                message: format!("connection limiter closed: {}", e),
            })?;
        debug!(available = self.semaphore.available_permits(), "acquired HTTP slot");
        Ok(permit)
    }

    /// Configured maximum number of concurrent requests.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
