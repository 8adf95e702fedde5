//! Error types and retry classification for the fetch layer.
//!
//! This module provides:
//! - [`FetchError`]: The main error enum for all fetch operations
//! - [`ErrorClass`]: Classification for determining retry behavior

mod retry;

pub use retry::ErrorClass;

use thiserror::Error;

/// Errors that can occur while fetching external data.
///
/// Each variant is classified into an [`ErrorClass`] via the
/// [`class`](Self::class) method, which determines how the HTTP client and
/// the provider chain handle the error.
///
/// Every payload is an owned string or integer so the enum is `Clone`:
/// singleflight joiners receive the identical settled error as the caller
/// that started the flight.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// The request exceeded its per-attempt timeout.
    /// Transient - the HTTP client retries this.
    #[error("Timeout after {timeout_ms}ms: {url}")]
    Timeout {
        /// The URL that timed out
        url: String,
        /// The per-attempt timeout that was exceeded
        timeout_ms: u64,
    },

    /// A transport-level failure (connection reset, DNS, aborted socket).
    /// Transient - the HTTP client retries this.
    #[error("Network error: {message}")]
    Network {
        /// Description of the transport failure
        message: String,
    },

    /// The remote answered with a non-success HTTP status.
    /// Server errors (>= 500) and 429 are transient; other client errors
    /// are permanent.
    #[error("HTTP {status}: {url}")]
    HttpStatus {
        /// The HTTP status code
        status: u16,
        /// The URL that was requested
        url: String,
    },

    /// The response body could not be decoded (JSON or JSONP).
    /// Permanent - retrying returns the same malformed payload.
    #[error("Parse failed: {message}")]
    Parse {
        /// Description of the decode failure
        message: String,
    },

    /// The local token bucket for a provider binding is empty.
    /// The provider was never invoked.
    #[error("Rate limited: {provider} (next token in ~{retry_after_ms}ms)")]
    RateLimited {
        /// The provider binding that is out of tokens
        provider: String,
        /// Estimated milliseconds until the next token is available
        retry_after_ms: u64,
    },

    /// The circuit breaker for a provider binding is open.
    /// The provider was never invoked, so this does not count as a new
    /// provider failure.
    #[error("Circuit open: {provider}")]
    CircuitOpen {
        /// The provider binding with an open circuit
        provider: String,
    },

    /// The provider's own `execute` failed after actually running.
    #[error("Provider error: {provider} - {message}")]
    Provider {
        /// The provider that returned the error
        provider: String,
        /// The error message from the provider
        message: String,
    },

    /// Every registered provider was attempted and none produced a result,
    /// and no stale cached value was available as a last resort.
    #[error("All providers failed for '{chain}': {attempts}")]
    AllProvidersFailed {
        /// The chain that exhausted its providers
        chain: String,
        /// Per-provider attempt summary, e.g. "P1: ERROR (..) -> P2: SKIPPED (..)"
        attempts: String,
    },

    /// An internal task failed to run to completion (panic or runtime
    /// shutdown while a flight was in progress).
    #[error("Task failed: {message}")]
    TaskFailed {
        /// Description of the task failure
        message: String,
    },
}

impl FetchError {
    /// Returns the classification for this error.
    ///
    /// This classification determines how the stack handles the error:
    ///
    /// - [`ErrorClass::Retriable`]: retried inside the HTTP client only
    /// - [`ErrorClass::Permanent`]: never retried
    /// - [`ErrorClass::BreakerOpen`]: provider skipped, nothing ran
    /// - [`ErrorClass::RateLimited`]: provider skipped, nothing ran
    /// - [`ErrorClass::ProviderError`]: provider ran and failed
    pub fn class(&self) -> ErrorClass {
        match self {
            // Transient transport conditions - retried by the HTTP client.
            Self::Timeout { .. } | Self::Network { .. } => ErrorClass::Retriable,

            // Server-side failures and remote throttling are transient;
            // every other status (4xx, stray 3xx) is a permanent client error.
            Self::HttpStatus { status, .. } => {
                if *status >= 500 || *status == 429 {
                    ErrorClass::Retriable
                } else {
                    ErrorClass::Permanent
                }
            }

            // Malformed payloads don't improve on retry.
            Self::Parse { .. } => ErrorClass::Permanent,

            // Gate rejections - the provider never ran.
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::CircuitOpen { .. } => ErrorClass::BreakerOpen,

            // The provider ran and rejected.
            Self::Provider { .. } => ErrorClass::ProviderError,

            // Exhausted all options - terminal.
            Self::AllProvidersFailed { .. } | Self::TaskFailed { .. } => ErrorClass::Permanent,
        }
    }
}
