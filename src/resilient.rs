//! Fault-tolerant read path
//!
//! [`ResilientFetch`] composes the three building blocks around one
//! [`Fetcher`]:
//!
//! ```text
//! deadline( cache( retry( fetch ) ) )
//! ```
//!
//! The cache decides whether the upstream is contacted at all, the retry
//! executor absorbs transient failures while it is, and the optional deadline
//! bounds how long a caller is willing to wait for either.
//!
//! Deadline-bound callers wait on the deadline executor's pool. Fetches run
//! wherever the cache runs its computations, normally a second, separately
//! sized pool (see [`SingleFlightCache::with_pool`]).

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheStats, SingleFlightCache};
use crate::deadline::DeadlineExecutor;
use crate::error::{ResilienceError, Result};
use crate::fetch::Fetcher;
use crate::retry::RetryExecutor;

/// A cached, retried, deadline-bounded view of one upstream.
pub struct ResilientFetch<V> {
    fetcher: Arc<dyn Fetcher<V>>,
    retry: RetryExecutor,
    deadline: DeadlineExecutor,
    cache: Arc<SingleFlightCache<String, V>>,
}

impl<V> Clone for ResilientFetch<V> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            retry: self.retry.clone(),
            deadline: self.deadline.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<V> fmt::Debug for ResilientFetch<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientFetch")
            .field("retry", &self.retry)
            .field("deadline", &self.deadline)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<V> ResilientFetch<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        fetcher: Arc<dyn Fetcher<V>>,
        retry: RetryExecutor,
        deadline: DeadlineExecutor,
        cache: SingleFlightCache<String, V>,
    ) -> Self {
        Self {
            fetcher,
            retry,
            deadline,
            cache: Arc::new(cache),
        }
    }

    /// Cached value for `id`, fetching with retries on a miss.
    ///
    /// `None` means the upstream could not produce a value, now or within the
    /// last TTL window.
    pub async fn resilient_get(&self, id: &str) -> Option<V> {
        let fetcher = self.fetcher.clone();
        let retry = self.retry.clone();
        let key = id.to_string();

        self.cache
            .get(id.to_string(), move || {
                let fetcher = fetcher.clone();
                let retry = retry.clone();
                let key = key.clone();
                async move {
                    // Detached from any caller, so nothing ever cancels it.
                    let cancel = CancellationToken::new();
                    retry
                        .run_cancellable(
                            |token| {
                                let fetcher = fetcher.clone();
                                let key = key.clone();
                                async move { fetcher.fetch(&key, &token).await }
                            },
                            &cancel,
                        )
                        .await
                        .into_result()
                }
            })
            .await
    }

    /// Like [`resilient_get`](Self::resilient_get), bounded by the deadline
    /// executor's timeout.
    ///
    /// Returns [`ResilienceError::Timeout`] when the deadline passes first and
    /// [`ResilienceError::Unavailable`] when the read completed without a
    /// value. A timed-out computation keeps running and populates the cache;
    /// only the caller's wait, and its pool slot, is given up.
    pub async fn resilient_get_with_deadline(&self, id: &str) -> Result<V> {
        let this = self.clone();
        let key = id.to_string();
        let value = self
            .deadline
            .run_with_deadline(move |cancel| async move {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    value = this.resilient_get(&key) => value,
                }
            })
            .await?;

        value.ok_or_else(|| {
            debug!(operation = %self.deadline.operation(), id, "no value available");
            ResilienceError::Unavailable {
                operation: self.deadline.operation().to_string(),
            }
        })
    }

    /// Drop the cached entry for `id`.
    pub fn invalidate(&self, id: &str) -> bool {
        self.cache.invalidate(&id.to_string())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn deadline(&self) -> &DeadlineExecutor {
        &self.deadline
    }
}
