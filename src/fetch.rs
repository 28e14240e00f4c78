//! Upstream fetch collaborators
//!
//! A [`Fetcher`] is the expensive, unreliable operation the rest of the crate
//! protects. It may be slow, may fail, and may return `Ok(None)` when the
//! upstream answered but had nothing useful.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{FetchError, ResilienceError, Result};

/// Fetches the value for a key from an upstream source.
#[async_trait]
pub trait Fetcher<V>: Send + Sync {
    /// Fetch `key`. Implementations should return [`FetchError::Cancelled`]
    /// once `cancel` fires, if they can notice it.
    async fn fetch(&self, key: &str, cancel: &CancellationToken) -> std::result::Result<Option<V>, FetchError>;
}

#[async_trait]
impl<V, T> Fetcher<V> for Arc<T>
where
    T: Fetcher<V> + ?Sized,
    V: Send + 'static,
{
    async fn fetch(&self, key: &str, cancel: &CancellationToken) -> std::result::Result<Option<V>, FetchError> {
        (**self).fetch(key, cancel).await
    }
}

/// Fetcher backed by an async closure.
pub struct FnFetcher<F, V> {
    f: F,
    _value: PhantomData<fn() -> V>,
}

impl<F, V> FnFetcher<F, V> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _value: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, V> Fetcher<V> for FnFetcher<F, V>
where
    F: Fn(String, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Option<V>, FetchError>> + Send,
    V: Send + 'static,
{
    async fn fetch(&self, key: &str, cancel: &CancellationToken) -> std::result::Result<Option<V>, FetchError> {
        (self.f)(key.to_string(), cancel.clone()).await
    }
}

/// Wraps a fetcher with random failures and latency, for demos and soak
/// tests.
#[derive(Debug, Clone)]
pub struct FaultInjector<F> {
    inner: F,
    failure_rate: f64,
    min_latency: Duration,
    max_latency: Duration,
}

impl<F> FaultInjector<F> {
    /// One failure in five, no added latency.
    pub const DEFAULT_FAILURE_RATE: f64 = 0.2;

    pub fn new(inner: F) -> Self {
        Self {
            inner,
            failure_rate: Self::DEFAULT_FAILURE_RATE,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
        }
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ResilienceError::invalid_config(format!(
                "failure rate {rate} is outside 0.0..=1.0"
            )));
        }
        self.failure_rate = rate;
        Ok(self)
    }

    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
        self
    }

    /// Latency every fetch pays at least. A maximum below it is raised to it.
    pub fn with_min_latency(mut self, min_latency: Duration) -> Self {
        self.min_latency = min_latency;
        self
    }

    pub fn failure_rate(&self) -> f64 {
        self.failure_rate
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    // thread_rng is not Send, so draw everything before the first await.
    fn draw(&self) -> (bool, Duration) {
        let mut rng = rand::thread_rng();
        let fail = rng.gen_bool(self.failure_rate);
        let latency = if self.max_latency <= self.min_latency {
            self.min_latency
        } else {
            let min_ms = self.min_latency.as_millis() as u64;
            let max_ms = self.max_latency.as_millis() as u64;
            Duration::from_millis(rng.gen_range(min_ms..=max_ms))
        };
        (fail, latency)
    }
}

#[async_trait]
impl<F, V> Fetcher<V> for FaultInjector<F>
where
    F: Fetcher<V>,
    V: Send + 'static,
{
    async fn fetch(&self, key: &str, cancel: &CancellationToken) -> std::result::Result<Option<V>, FetchError> {
        let (fail, latency) = self.draw();

        if !latency.is_zero() {
            trace!(key, ?latency, "injecting latency");
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        if fail {
            debug!(key, "injecting upstream failure");
            return Err(FetchError::Injected);
        }
        self.inner.fetch(key, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> FnFetcher<impl Fn(String, CancellationToken) -> futures::future::Ready<std::result::Result<Option<String>, FetchError>>, String> {
        FnFetcher::new(|key: String, _cancel: CancellationToken| futures::future::ready(Ok(Some(format!("value:{key}")))))
    }

    #[tokio::test]
    async fn fn_fetcher_receives_key() {
        let fetcher = echo();
        let out = fetcher.fetch("130000", &CancellationToken::new()).await.unwrap();
        assert_eq!(out.as_deref(), Some("value:130000"));
    }

    #[tokio::test]
    async fn arc_dyn_fetcher_delegates() {
        let fetcher: Arc<dyn Fetcher<String>> = Arc::new(echo());
        let out = fetcher.fetch("k", &CancellationToken::new()).await.unwrap();
        assert_eq!(out.as_deref(), Some("value:k"));
    }

    #[tokio::test]
    async fn always_failing_injector() {
        let fetcher = FaultInjector::new(echo()).with_failure_rate(1.0).unwrap();
        let err = fetcher.fetch("k", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::Injected));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn never_failing_injector_passes_through() {
        let fetcher = FaultInjector::new(echo()).with_failure_rate(0.0).unwrap();
        for _ in 0..20 {
            assert!(fetcher.fetch("k", &CancellationToken::new()).await.is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn latency_honours_cancellation() {
        let fetcher = FaultInjector::new(echo())
            .with_failure_rate(0.0)
            .unwrap()
            .with_min_latency(Duration::from_secs(1))
            .with_max_latency(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = tokio::time::Instant::now();
        let err = fetcher.fetch("k", &cancel).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn latency_stays_within_bounds() {
        let fetcher = FaultInjector::new(echo())
            .with_failure_rate(0.0)
            .unwrap()
            .with_min_latency(Duration::from_millis(200))
            .with_max_latency(Duration::from_millis(300));

        for _ in 0..10 {
            let start = tokio::time::Instant::now();
            let out = fetcher.fetch("k", &CancellationToken::new()).await.unwrap();
            assert_eq!(out.as_deref(), Some("value:k"));
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(200));
            assert!(elapsed <= Duration::from_millis(310));
        }
    }

    #[test]
    fn failure_rate_out_of_range_rejected() {
        assert!(FaultInjector::new(echo()).with_failure_rate(1.5).is_err());
        assert!(FaultInjector::new(echo()).with_failure_rate(-0.1).is_err());
        assert_eq!(FaultInjector::new(echo()).failure_rate(), 0.2);
    }
}
