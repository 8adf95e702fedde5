//! Data provider trait definition.
//!
//! This module defines the narrow `DataProvider` interface that all remote
//! data sources (quote, news, symbol-search backends) are consumed through.

use async_trait::async_trait;

use crate::errors::FetchError;

/// Trait for external data providers.
///
/// Implement this trait to add support for a new remote source. The chain
/// uses the provider's name for logging, circuit-breaker tracking and the
/// aggregated failure report; registration order on the chain decides
/// failover priority.
///
/// `execute` must return `Err` on any failure - never a partial or empty
/// placeholder value.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use bullsession_fetch::{DataProvider, FetchError};
///
/// struct SinaQuotes {
///     http: HttpClient,
/// }
///
/// #[async_trait]
/// impl DataProvider<String, Quote> for SinaQuotes {
///     fn name(&self) -> &str {
///         "SINA"
///     }
///
///     async fn execute(&self, symbol: &String) -> Result<Quote, FetchError> {
///         // fetch and decode ...
///     }
/// }
/// ```
#[async_trait]
pub trait DataProvider<A, R>: Send + Sync
where
    A: Send + Sync,
    R: Send,
{
    /// Stable identifier for this provider, e.g. "SINA" or "TENCENT".
    fn name(&self) -> &str;

    /// Fetch a result for the given arguments.
    async fn execute(&self, args: &A) -> Result<R, FetchError>;
}
