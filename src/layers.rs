//! Tower layers over the resilience executors
//!
//! The same retry, deadline and single-flight behaviour as the direct API,
//! packaged as `tower::Layer`s so it can be stacked around any service:
//!
//! ```ignore
//! let svc = ServiceBuilder::new()
//!     .layer(DeadlineLayer::new(deadline))
//!     .layer(SingleFlightLayer::new(cache))
//!     .layer(RetryLayer::new(retry))
//!     .service(fetch_service);
//! ```
//!
//! Inner services that are called more than once per request are shared
//! behind an async mutex and driven to readiness before each call. The lock
//! covers readiness and `call` only; the response future is awaited after it
//! is released, so a slow request never holds up another key.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Mutex;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::warn;

use crate::cache::SingleFlightCache;
use crate::deadline::DeadlineExecutor;
use crate::error::ResilienceError;
use crate::retry::RetryExecutor;

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

// ===== Retry =====

/// Retries an inner `Service<Req, Response = Option<V>>`.
///
/// `Ok(None)` and errors are both fed to the executor's policy. Exhaustion
/// surfaces as [`ResilienceError::Unavailable`].
#[derive(Debug, Clone)]
pub struct RetryLayer {
    executor: RetryExecutor,
}

impl RetryLayer {
    pub fn new(executor: RetryExecutor) -> Self {
        Self { executor }
    }
}

pub struct Retry<S> {
    inner: Arc<Mutex<S>>,
    executor: RetryExecutor,
}

impl<S> Clone for Retry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner: Arc::new(Mutex::new(inner)),
            executor: self.executor.clone(),
        }
    }
}

impl<S, Req, V> Service<Req> for Retry<S>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Response = Option<V>> + Send + 'static,
    S::Error: StdError + Send + Sync + 'static,
    S::Future: Send + 'static,
    V: Send + 'static,
{
    type Response = V;
    type Error = ResilienceError;
    type Future = BoxFuture<V, ResilienceError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // readiness is checked per attempt, under the lock
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let executor = self.executor.clone();
        Box::pin(async move {
            let outcome = executor
                .run(move || {
                    let inner = inner.clone();
                    let req = req.clone();
                    async move {
                        let response = {
                            let mut svc = inner.lock().await;
                            ServiceExt::ready(&mut *svc).await?.call(req)
                        };
                        response.await
                    }
                })
                .await;

            outcome.into_result().map_err(|last| {
                warn!(operation = %executor.name(), last_failure = %last, "retries exhausted");
                ResilienceError::Unavailable {
                    operation: executor.name().to_string(),
                }
            })
        })
    }
}

// ===== Deadline =====

/// Runs the inner call on the executor's worker pool under its deadline.
#[derive(Debug, Clone)]
pub struct DeadlineLayer {
    executor: DeadlineExecutor,
}

impl DeadlineLayer {
    pub fn new(executor: DeadlineExecutor) -> Self {
        Self { executor }
    }
}

#[derive(Clone)]
pub struct Deadline<S> {
    inner: S,
    executor: DeadlineExecutor,
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = Deadline<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Deadline {
            inner,
            executor: self.executor.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Deadline<S>
where
    S: Service<Req> + Send + 'static,
    S::Error: Into<BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<S::Response, BoxError>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let fut = self.inner.call(req);
        let executor = self.executor.clone();
        Box::pin(async move {
            // outer error: timeout or worker failure; inner: the service's own
            let out: Result<S::Response, BoxError> =
                match executor.run_with_deadline(move |_cancel| fut).await {
                    Ok(result) => result.map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
            out
        })
    }
}

// ===== Single flight =====

/// Serves `Service<K, Response = V>` calls through a [`SingleFlightCache`].
///
/// Concurrent calls for the same key share one inner call; an inner error is
/// cached as `None` for the cache's TTL.
pub struct SingleFlightLayer<K, V> {
    cache: Arc<SingleFlightCache<K, V>>,
}

impl<K, V> SingleFlightLayer<K, V> {
    pub fn new(cache: Arc<SingleFlightCache<K, V>>) -> Self {
        Self { cache }
    }
}

impl<K, V> Clone for SingleFlightLayer<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

pub struct SingleFlight<S, K, V> {
    inner: Arc<Mutex<S>>,
    cache: Arc<SingleFlightCache<K, V>>,
}

impl<S, K, V> Clone for SingleFlight<S, K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<S, K, V> Layer<S> for SingleFlightLayer<K, V> {
    type Service = SingleFlight<S, K, V>;

    fn layer(&self, inner: S) -> Self::Service {
        SingleFlight {
            inner: Arc::new(Mutex::new(inner)),
            cache: self.cache.clone(),
        }
    }
}

impl<S, K, V> Service<K> for SingleFlight<S, K, V>
where
    S: Service<K, Response = V> + Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    S::Future: Send + 'static,
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Response = Option<V>;
    type Error = BoxError;
    type Future = BoxFuture<Option<V>, BoxError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, key: K) -> Self::Future {
        let inner = self.inner.clone();
        let cache = self.cache.clone();
        Box::pin(async move {
            let compute_key = key.clone();
            let value = cache
                .get(key, move || {
                    let inner = inner.clone();
                    let key = compute_key.clone();
                    async move {
                        let response = {
                            let mut svc = inner.lock().await;
                            ServiceExt::ready(&mut *svc).await?.call(key)
                        };
                        response.await
                    }
                })
                .await;
            Ok::<_, BoxError>(value)
        })
    }
}
