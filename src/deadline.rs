//! Deadline-bounded execution on a bounded worker pool
//!
//! [`WorkerPool`] caps how many operations run at once and how many may wait
//! for a running slot. Submitters beyond that wait for admission in their own
//! task, so overload shows up as latency instead of unbounded task growth.
//! [`DeadlineExecutor`] submits an operation to the pool and waits for it,
//! admission included, up to a wall-clock deadline.
//!
//! On expiry the caller gets [`ResilienceError::Timeout`] straight away and the
//! operation's [`CancellationToken`] is cancelled. The worker is not aborted:
//! it stops only if the operation observes the token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::error::{ResilienceError, Result};

struct PoolInner {
    admission: Arc<Semaphore>,
    running: Arc<Semaphore>,
    max_concurrency: usize,
    capacity: usize,
}

/// Bounded pool of tokio tasks.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_concurrency", &self.inner.max_concurrency)
            .field("capacity", &self.inner.capacity)
            .field("admitted", &self.admitted())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.max_concurrency == 0 {
            return Err(ResilienceError::invalid_config(
                "worker pool needs at least one running slot",
            ));
        }
        let capacity = config.capacity();
        Ok(Self {
            inner: Arc::new(PoolInner {
                admission: Arc::new(Semaphore::new(capacity)),
                running: Arc::new(Semaphore::new(config.max_concurrency)),
                max_concurrency: config.max_concurrency,
                capacity,
            }),
        })
    }

    /// Tasks currently running or waiting for a running slot.
    pub fn admitted(&self) -> usize {
        self.inner.capacity - self.inner.admission.available_permits()
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Running plus queued capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Wait for admission, then spawn `fut` to run once a running slot is free.
    pub async fn spawn<Fut>(&self, fut: Fut) -> JoinHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        if self.inner.admission.available_permits() == 0 {
            trace!(capacity = self.inner.capacity, "worker pool full, waiting for admission");
        }
        // Neither semaphore is ever closed, so permits are always granted.
        let admission = self.inner.admission.clone().acquire_owned().await.ok();
        let running = self.inner.running.clone();
        tokio::spawn(async move {
            let _admission = admission;
            let _permit = running.acquire_owned().await.ok();
            fut.await
        })
    }

    /// Run a blocking closure on tokio's blocking threads, under the same bound.
    pub async fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<std::result::Result<R, JoinError>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.spawn(async move { tokio::task::spawn_blocking(f).await }).await
    }
}

/// Runs operations on a [`WorkerPool`] under a deadline.
#[derive(Debug, Clone)]
pub struct DeadlineExecutor {
    operation: Arc<str>,
    timeout: Duration,
    pool: WorkerPool,
}

impl DeadlineExecutor {
    pub fn new(operation: impl Into<Arc<str>>, timeout: Duration, pool: WorkerPool) -> Result<Self> {
        let operation = operation.into();
        if timeout.is_zero() {
            return Err(ResilienceError::invalid_config(format!(
                "{operation}: deadline must be positive"
            )));
        }
        Ok(Self {
            operation,
            timeout,
            pool,
        })
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Same pool, different operation name and deadline.
    pub fn with_operation(&self, operation: impl Into<Arc<str>>, timeout: Duration) -> Result<Self> {
        Self::new(operation, timeout, self.pool.clone())
    }

    /// Run `operation` with this executor's deadline.
    pub async fn run_with_deadline<F, Fut, V>(&self, operation: F) -> Result<V>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = V> + Send + 'static,
        V: Send + 'static,
    {
        self.run_with_timeout(operation, self.timeout).await
    }

    /// Run `operation` with an explicit deadline.
    pub async fn run_with_timeout<F, Fut, V>(&self, operation: F, deadline: Duration) -> Result<V>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = V> + Send + 'static,
        V: Send + 'static,
    {
        let expires = Instant::now() + deadline;
        let cancel = CancellationToken::new();
        let admitted = timeout_at(expires, self.pool.spawn(operation(cancel.clone()))).await;
        let Ok(handle) = admitted else {
            return Err(self.expired(&cancel, deadline));
        };
        self.await_handle(handle, cancel, expires, deadline).await
    }

    /// Run a synchronous closure with this executor's deadline.
    pub async fn run_blocking_with_deadline<F, V>(&self, operation: F) -> Result<V>
    where
        F: FnOnce(CancellationToken) -> V + Send + 'static,
        V: Send + 'static,
    {
        let expires = Instant::now() + self.timeout;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let admitted = timeout_at(expires, self.pool.spawn_blocking(move || operation(token))).await;
        let Ok(handle) = admitted else {
            return Err(self.expired(&cancel, self.timeout));
        };
        self.await_handle(handle, cancel, expires, self.timeout)
            .await?
            .map_err(|e| ResilienceError::WorkerFailed(e.to_string()))
    }

    async fn await_handle<V>(
        &self,
        handle: JoinHandle<V>,
        cancel: CancellationToken,
        expires: Instant,
        deadline: Duration,
    ) -> Result<V> {
        match timeout_at(expires, handle).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(join)) => {
                warn!(operation = %self.operation, error = %join, "worker failed");
                Err(ResilienceError::WorkerFailed(join.to_string()))
            }
            // Detach the worker; it keeps running until it notices the token.
            Err(_) => Err(self.expired(&cancel, deadline)),
        }
    }

    fn expired(&self, cancel: &CancellationToken, deadline: Duration) -> ResilienceError {
        cancel.cancel();
        debug!(operation = %self.operation, ?deadline, "deadline exceeded");
        ResilienceError::Timeout {
            operation: self.operation.to_string(),
            after: deadline,
        }
    }
}
