//! Per-request attempt tracking for provider failover.

/// Why a provider was skipped without being invoked.
#[derive(Clone, Debug)]
pub enum SkipCause {
    /// The binding's circuit breaker is open.
    CircuitOpen,
    /// The binding's token bucket is empty.
    RateLimited {
        /// Estimated milliseconds until the next token.
        retry_after_ms: u64,
    },
}

/// Record of a single provider attempt.
#[derive(Clone, Debug)]
pub struct ProviderAttempt {
    pub provider: String,
    pub skipped: Option<SkipCause>,
    pub error: Option<String>,
    pub success: bool,
}

/// Ordered log of every provider attempt for one request.
///
/// Skips (the provider never ran) are distinguished from failures (the
/// provider ran and rejected); the summary feeds both the logs and the
/// aggregated hard-failure error.
#[derive(Clone, Debug, Default)]
pub struct AttemptLog {
    attempts: Vec<ProviderAttempt>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_skip(&mut self, provider: impl Into<String>, cause: SkipCause) {
        self.attempts.push(ProviderAttempt {
            provider: provider.into(),
            skipped: Some(cause),
            error: None,
            success: false,
        });
    }

    pub fn record_error(&mut self, provider: impl Into<String>, error: impl Into<String>) {
        self.attempts.push(ProviderAttempt {
            provider: provider.into(),
            skipped: None,
            error: Some(error.into()),
            success: false,
        });
    }

    pub fn record_success(&mut self, provider: impl Into<String>) {
        self.attempts.push(ProviderAttempt {
            provider: provider.into(),
            skipped: None,
            error: None,
            success: true,
        });
    }

    /// One-line summary naming every attempted provider and its outcome.
    pub fn summary(&self) -> String {
        self.attempts
            .iter()
            .map(|attempt| {
                if attempt.success {
                    format!("{}: SUCCESS", attempt.provider)
                } else if let Some(cause) = &attempt.skipped {
                    format!("{}: SKIPPED ({:?})", attempt.provider, cause)
                } else if let Some(error) = &attempt.error {
                    format!("{}: ERROR ({})", attempt.provider, error)
                } else {
                    format!("{}: UNKNOWN", attempt.provider)
                }
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    pub fn has_success(&self) -> bool {
        self.attempts.iter().any(|attempt| attempt.success)
    }

    pub fn attempts(&self) -> &[ProviderAttempt] {
        &self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_names_every_attempt() {
        let mut log = AttemptLog::new();
        log.record_skip("SINA", SkipCause::CircuitOpen);
        log.record_error("TENCENT", "HTTP 502");
        log.record_success("EASTMONEY");

        let summary = log.summary();
        assert!(summary.contains("SINA: SKIPPED"));
        assert!(summary.contains("TENCENT: ERROR (HTTP 502)"));
        assert!(summary.contains("EASTMONEY: SUCCESS"));
    }

    #[test]
    fn test_has_success() {
        let mut log = AttemptLog::new();
        log.record_skip("SINA", SkipCause::RateLimited { retry_after_ms: 500 });
        assert!(!log.has_success());

        log.record_success("TENCENT");
        assert!(log.has_success());
    }
}
