//! Low-level HTTP client for quote/news/search providers.
//!
//! This module provides bounded-concurrency HTTP GET with:
//! - Per-attempt timeout (`STOCK_API_TIMEOUT`, default 8000 ms)
//! - Classified retry (retriable errors only, fixed 1 s backoff)
//! - User-Agent rotation from a small fixed pool
//! - GBK charset decoding for legacy quote endpoints
//! - JSONP unwrapping for endpoints that only speak `callback(...)`

mod limiter;

pub use limiter::ConnectionLimiter;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::errors::FetchError;

/// Default per-attempt timeout in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 8000;

/// Environment variable overriding the per-attempt timeout (milliseconds).
const TIMEOUT_ENV: &str = "STOCK_API_TIMEOUT";

/// Fixed delay between retry attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// User-Agent pool rotated across attempts. Some quote endpoints throttle
/// by agent string, so consecutive attempts present different agents.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.2420.81",
];

lazy_static! {
    /// Matches a JSONP body `callback({...});` and captures the interior.
    static ref JSONP_WRAPPER: Regex =
        Regex::new(r"(?s)^\s*[A-Za-z_$][\w$.]*\s*\(\s*(.*?)\s*\)\s*;?\s*$")
            .expect("JSONP wrapper pattern is valid");
}

/// Options for a single logical GET.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Per-attempt timeout. `None` uses the client default from the
    /// environment.
    pub timeout: Option<Duration>,
    /// Number of retries after the first attempt (retriable errors only).
    pub retries: u32,
    /// Extra request headers as name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Decode the response body as GBK instead of UTF-8.
    pub decode_gbk: bool,
    /// Optional Referer header, required by some quote endpoints.
    pub referer: Option<String>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: 1,
            headers: Vec::new(),
            decode_gbk: false,
            referer: None,
        }
    }
}

/// Bounded-concurrency HTTP GET client.
///
/// Every attempt first takes a slot from the shared [`ConnectionLimiter`],
/// so the process-wide outbound quota holds across all providers and
/// chains. The client itself is stateless apart from the rotating
/// User-Agent cursor and is cheap to share behind an `Arc`.
pub struct HttpClient {
    client: Client,
    limiter: ConnectionLimiter,
    default_timeout: Duration,
    ua_cursor: AtomicUsize,
}

impl HttpClient {
    /// Create a client with the per-attempt timeout taken from
    /// `STOCK_API_TIMEOUT` (default 8000 ms).
    pub fn new(limiter: ConnectionLimiter) -> Self {
        Self::with_timeout(limiter, timeout_from_env())
    }

    /// Create a client with an explicit default per-attempt timeout.
    pub fn with_timeout(limiter: ConnectionLimiter, default_timeout: Duration) -> Self {
        let client = Client::builder()
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            limiter,
            default_timeout,
            ua_cursor: AtomicUsize::new(0),
        }
    }

    /// GET a URL and return the decoded response body.
    pub async fn get_text(&self, url: &str, opts: &HttpOptions) -> Result<String, FetchError> {
        self.get_with_retry(url, opts).await
    }

    /// GET a URL and parse the response body as JSON.
    ///
    /// Parse failures are permanent and never retried; only the transport
    /// attempt underneath is subject to retry.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        opts: &HttpOptions,
    ) -> Result<T, FetchError> {
        let body = self.get_with_retry(url, opts).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Parse {
            message: format!("invalid JSON from {}: {}", url, e),
        })
    }

    /// GET a JSONP endpoint, strip the `callback(...)` wrapper, and parse
    /// the interior as JSON.
    pub async fn get_jsonp<T: DeserializeOwned>(
        &self,
        url: &str,
        opts: &HttpOptions,
    ) -> Result<T, FetchError> {
        let body = self.get_with_retry(url, opts).await?;
        let inner = strip_jsonp(&body)?;
        serde_json::from_str(inner).map_err(|e| FetchError::Parse {
            message: format!("invalid JSONP interior from {}: {}", url, e),
        })
    }

    /// Run attempts until success, a permanent error, or retry exhaustion.
    async fn get_with_retry(&self, url: &str, opts: &HttpOptions) -> Result<String, FetchError> {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let mut attempt: u32 = 0;

        loop {
            let permit = self.limiter.slot().await?;
            let result = self.attempt(url, opts, timeout).await;
            drop(permit);

            match result {
                Ok(body) => return Ok(body),
                Err(e) if e.class().is_retriable() && attempt < opts.retries => {
                    attempt += 1;
                    warn!(
                        url,
                        attempt,
                        retries = opts.retries,
                        error = %e,
                        "retriable fetch failure, backing off"
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Issue a single GET attempt with a hard timeout.
    async fn attempt(
        &self,
        url: &str,
        opts: &HttpOptions,
        timeout: Duration,
    ) -> Result<String, FetchError> {
        let mut request = self
            .client
            .get(url)
            .timeout(timeout)
            .header(header::USER_AGENT, self.next_user_agent());

        if let Some(referer) = &opts.referer {
            request = request.header(header::REFERER, referer.as_str());
        }

        for (name, value) in &opts.headers {
            match (
                header::HeaderName::try_from(name.as_str()),
                header::HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    request = request.header(name, value);
                }
                _ => {
                    warn!(header = name.as_str(), "skipping invalid request header");
                }
            }
        }

        debug!(url, timeout_ms = timeout.as_millis() as u64, "GET");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                FetchError::Network {
                    message: format!("request to {} failed: {}", url, e),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "non-success HTTP status");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| FetchError::Network {
            message: format!("failed reading body from {}: {}", url, e),
        })?;

        Ok(decode_body(&bytes, opts.decode_gbk))
    }

    /// Next User-Agent from the rotation pool.
    fn next_user_agent(&self) -> &'static str {
        let index = self.ua_cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[index % USER_AGENTS.len()]
    }
}

/// Decode a response body, optionally as GBK.
fn decode_body(bytes: &[u8], decode_gbk: bool) -> String {
    if decode_gbk {
        let (text, _, _) = encoding_rs::GBK.decode(bytes);
        text.into_owned()
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Strip a `callback(...)` JSONP wrapper, returning the interior.
fn strip_jsonp(body: &str) -> Result<&str, FetchError> {
    JSONP_WRAPPER
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| FetchError::Parse {
            message: "response is not a JSONP payload".to_string(),
        })
}

/// Per-attempt timeout from `STOCK_API_TIMEOUT`, default 8000 ms.
fn timeout_from_env() -> Duration {
    std::env::var(TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = HttpOptions::default();
        assert_eq!(opts.retries, 1);
        assert!(opts.timeout.is_none());
        assert!(!opts.decode_gbk);
        assert!(opts.referer.is_none());
        assert!(opts.headers.is_empty());
    }

    #[test]
    fn test_strip_jsonp_basic() {
        let inner = strip_jsonp(r#"callback({"price":100});"#).unwrap();
        assert_eq!(inner, r#"{"price":100}"#);
    }

    #[test]
    fn test_strip_jsonp_dotted_callback_and_whitespace() {
        let inner = strip_jsonp("  jQuery12345.cb ( {\"a\": [1, 2]} ) ; \n").unwrap();
        assert_eq!(inner, r#"{"a": [1, 2]}"#);
    }

    #[test]
    fn test_strip_jsonp_multiline_interior() {
        let inner = strip_jsonp("cb({\n  \"a\": 1\n});").unwrap();
        assert_eq!(inner, "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_strip_jsonp_rejects_plain_json() {
        let err = strip_jsonp(r#"{"price":100}"#).unwrap_err();
        assert!(matches!(err, FetchError::Parse { .. }));
    }

    #[test]
    fn test_decode_body_utf8() {
        assert_eq!(decode_body("hello".as_bytes(), false), "hello");
    }

    #[test]
    fn test_decode_body_gbk() {
        // "行情" (market quote) encoded as GBK.
        let gbk_bytes: &[u8] = &[0xD0, 0xD0, 0xC7, 0xE9];
        assert_eq!(decode_body(gbk_bytes, true), "行情");
    }

    #[test]
    fn test_user_agent_rotation_cycles_pool() {
        let client = HttpClient::with_timeout(
            ConnectionLimiter::new(1),
            Duration::from_millis(100),
        );

        let mut seen = Vec::new();
        for _ in 0..USER_AGENTS.len() {
            seen.push(client.next_user_agent());
        }
        assert_eq!(seen, USER_AGENTS.to_vec());

        // Wraps back to the start of the pool.
        assert_eq!(client.next_user_agent(), USER_AGENTS[0]);
    }
}
