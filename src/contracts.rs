// SPDX-License-Identifier: Apache-2.0 OR MIT

//! External collaborators this crate depends on but does not implement:
//! the HTTPS fetcher, the clock, and the RNG.
//!
//! `Fetcher` follows the same object-safe, `Send + Sync + 'static` shape as
//! `rpc::server::RequestHandler`. `Clock` is injected rather than calling
//! `Instant::now()`/`SystemTime::now()` directly from business logic, the
//! way `congestion::rtt_estimator` takes an injected clock, so tests can
//! drive timeouts and cache expiry deterministically.

use std::time::{Duration, Instant};

/// Errors a [`Fetcher`] may raise, mapped to domain error codes by
/// [`crate::server::ServerHandler`] (see [`crate::error::DomainErrorCode`]).
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    InvalidUrl,
    BodyTooLarge { limit: u64 },
    Timeout { secs: f64 },
    Fetch(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl => write!(f, "invalid URL"),
            Self::BodyTooLarge { limit } => write!(f, "response exceeds {limit} bytes"),
            Self::Timeout { secs } => write!(f, "fetch timed out after {secs}s"),
            Self::Fetch(msg) => write!(f, "fetch failed: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// One successful HTTP fetch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: std::collections::BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Pluggable HTTPS fetcher. Implementations must honor `max_bytes` and an
/// overall timeout, and SHOULD strip `Content-Security-Policy` /
/// `X-Frame-Options` on the fetch side (the handler strips them again
/// defensively via [`crate::wire::header_block`]'s whitelist).
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, max_bytes: u64, timeout: Duration) -> Result<HttpResponse, FetchError>;
}

impl<F> Fetcher for F
where
    F: Fn(&str, u64, Duration) -> Result<HttpResponse, FetchError> + Send + Sync,
{
    fn fetch(&self, url: &str, max_bytes: u64, timeout: Duration) -> Result<HttpResponse, FetchError> {
        self(url, max_bytes, timeout)
    }
}

/// Async counterpart to [`Fetcher`], for callers driving the handler from a
/// `tokio` runtime instead of a blocking thread. `async_trait` keeps this
/// object-safe the same way it does for the interceptor traits this crate's
/// sibling examples build on.
#[cfg(feature = "async")]
#[async_trait::async_trait]
pub trait AsyncFetcher: Send + Sync {
    async fn fetch(&self, url: &str, max_bytes: u64, timeout: Duration) -> Result<HttpResponse, FetchError>;
}

/// Adapts a blocking [`Fetcher`] to [`AsyncFetcher`] by running it on
/// `tokio`'s blocking thread pool, for callers who already have a sync
/// fetcher and just want to drive the server loop from async code.
#[cfg(feature = "async")]
pub struct BlockingFetcherAdapter<F>(pub std::sync::Arc<F>);

#[cfg(feature = "async")]
#[async_trait::async_trait]
impl<F> AsyncFetcher for BlockingFetcherAdapter<F>
where
    F: Fetcher + 'static,
{
    async fn fetch(&self, url: &str, max_bytes: u64, timeout: Duration) -> Result<HttpResponse, FetchError> {
        let fetcher = self.0.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || fetcher.fetch(&url, max_bytes, timeout))
            .await
            .unwrap_or_else(|e| Err(FetchError::Fetch(format!("fetch task panicked: {e}"))))
    }
}

/// Monotonic-plus-wall-clock time source, injected so timeout and cache
/// expiry logic can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    /// Monotonic instant, used for timeouts and elapsed-time math.
    fn now(&self) -> Instant;
    /// Wall-clock seconds since the Unix epoch, used for packet
    /// `timestamp` fields and cache expiry stamps.
    fn unix_seconds(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Source of randomness for `message_id` generation and retry jitter. Must
/// be seeded nondeterministically in production; tests inject a fixed
/// sequence.
pub trait Rng: Send + Sync {
    fn next_u32(&self) -> u32;
    fn next_f64(&self) -> f64;
}

/// [`fastrand`]-backed RNG, nondeterministically seeded by the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRng;

impl Rng for SystemRng {
    fn next_u32(&self) -> u32 {
        fastrand::u32(..)
    }

    fn next_f64(&self) -> f64 {
        fastrand::f64()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    /// A clock an integration test can advance explicitly instead of
    /// sleeping real wall-clock time.
    pub struct FakeClock {
        base: Instant,
        offset_nanos: AtomicU64,
        unix_base: AtomicU64,
    }

    impl FakeClock {
        pub fn new() -> Self {
            Self {
                base: Instant::now(),
                offset_nanos: AtomicU64::new(0),
                unix_base: AtomicU64::new(1_700_000_000),
            }
        }

        pub fn advance(&self, by: Duration) {
            self.offset_nanos
                .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
            self.unix_base.fetch_add(by.as_secs(), Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.base + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
        }

        fn unix_seconds(&self) -> u64 {
            self.unix_base.load(Ordering::SeqCst)
        }
    }
}
