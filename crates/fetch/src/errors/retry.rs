//! Error classification for retry and failover decisions.

/// How an error should be handled by the layer that observes it.
///
/// The HTTP client retries [`Retriable`](Self::Retriable) errors with a
/// fixed backoff; the provider chain never retries - it advances to the
/// next provider regardless of class, but uses the class to decide whether
/// the attempt counts as a provider failure (gate rejections do not).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Transient network condition. Retried only inside the HTTP client,
    /// never by the provider chain.
    Retriable,

    /// Client error or parse failure. Never retried.
    Permanent,

    /// The circuit rejected before the call executed. Does not count as a
    /// new provider failure since nothing ran.
    BreakerOpen,

    /// The local quota was exhausted. Also does not invoke the provider.
    RateLimited,

    /// The provider's own execute rejected after actually running.
    ProviderError,
}

impl ErrorClass {
    /// Whether the HTTP client should retry an error of this class.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_retriable_is_retriable() {
        assert!(ErrorClass::Retriable.is_retriable());
        assert!(!ErrorClass::Permanent.is_retriable());
        assert!(!ErrorClass::BreakerOpen.is_retriable());
        assert!(!ErrorClass::RateLimited.is_retriable());
        assert!(!ErrorClass::ProviderError.is_retriable());
    }
}
