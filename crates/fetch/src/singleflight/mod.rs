//! Per-key coalescing of concurrent identical requests.
//!
//! The first caller for a key starts the work; every caller arriving while
//! that work is pending joins the same flight and observes the identical
//! settled value or error. The flight is deregistered as soon as it
//! settles, success or failure, so later callers start a new execution.
//!
//! The flight body runs as a spawned task: an abandoned caller does not
//! cancel an in-progress execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use log::{debug, warn};

use crate::errors::FetchError;

type FlightMap<T> = HashMap<String, Shared<BoxFuture<'static, Result<T, FetchError>>>>;

/// In-flight request deduplication keyed by string.
///
/// `T` must be `Clone` because every joiner receives its own copy of the
/// settled result (`FetchError` is `Clone` for the same reason).
pub struct Singleflight<T> {
    flights: Arc<Mutex<FlightMap<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Singleflight<T> {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `f` under `key`, or join an execution already in flight.
    ///
    /// At most one physical execution per key is in progress at any
    /// instant within the process. Joiners do not retry independently -
    /// they share the original flight's outcome verbatim.
    pub async fn execute<F, Fut>(&self, key: &str, f: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let shared = {
            let mut flights = lock_flights(&self.flights);

            if let Some(existing) = flights.get(key) {
                debug!("singleflight: joining in-flight execution for '{}'", key);
                existing.clone()
            } else {
                let flights_ref = Arc::clone(&self.flights);
                let owned_key = key.to_string();
                let work = f();

                // The task owns the work and deregisters the flight when it
                // settles; it is not cancelled if the callers go away. The
                // removal cannot race ahead of the insert below because it
                // needs the map lock we are still holding.
                let task = tokio::spawn(async move {
                    let result = work.await;
                    lock_flights(&flights_ref).remove(&owned_key);
                    result
                });

                let shared = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => Err(FetchError::TaskFailed {
                            message: format!("singleflight execution died: {}", e),
                        }),
                    }
                }
                .boxed()
                .shared();

                flights.insert(key.to_string(), shared.clone());
                shared
            }
        };

        shared.await
    }

    /// Number of flights currently pending.
    pub fn in_flight(&self) -> usize {
        lock_flights(&self.flights).len()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_flights<T>(flights: &Mutex<FlightMap<T>>) -> MutexGuard<'_, FlightMap<T>> {
    flights.lock().unwrap_or_else(|poisoned| {
        warn!("singleflight mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}
