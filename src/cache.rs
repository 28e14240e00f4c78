//! Single-flight TTL cache
//!
//! Each key maps to a shared computation handle. A resolved handle is the
//! cached entry; an unresolved one is a computation in progress. The slot map
//! lock is only held to look up or install a handle, never across an await,
//! so exactly one caller per miss episode becomes the coordinator and every
//! concurrent requester awaits the same handle.
//!
//! Computations are spawned as detached tasks: they run to completion even if
//! every waiter gives up, and their outcome is what the next reader sees.
//! With [`with_pool`](SingleFlightCache::with_pool) they run on a bounded
//! [`WorkerPool`], so a burst of misses queues instead of fanning out.
//! A failed computation is cached as a negative (`None`) entry with the same
//! TTL as a value, so a failing upstream is not hit on every request.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::deadline::WorkerPool;
use crate::error::{ResilienceError, Result};

/// A published computation outcome.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: Option<V>,
    created_at: Instant,
}

impl<V> CacheEntry<V> {
    pub fn new(value: Option<V>, created_at: Instant) -> Self {
        Self { value, created_at }
    }

    /// `None` for a cached negative result.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        self.age(now) < ttl
    }
}

type Computation<V> = Shared<BoxFuture<'static, Arc<CacheEntry<V>>>>;

enum Lookup<V> {
    Hit(Option<V>),
    Wait(Computation<V>),
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    stale_restarts: AtomicU64,
}

/// Snapshot of cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Served from a fresh entry
    pub hits: u64,
    /// Started a computation
    pub misses: u64,
    /// Joined a computation someone else started
    pub coalesced: u64,
    /// Received an entry that was already stale and looked up again
    pub stale_restarts: u64,
}

impl CacheStats {
    /// Share of lookups that did not start a computation (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.coalesced) as f64 / total as f64
        }
    }
}

/// Keyed TTL cache with at most one in-flight computation per key.
pub struct SingleFlightCache<K, V> {
    name: Arc<str>,
    ttl: Duration,
    slots: Mutex<HashMap<K, Computation<V>>>,
    counters: Counters,
    pool: Option<WorkerPool>,
}

impl<K, V> fmt::Debug for SingleFlightCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache whose entries live for `ttl`.
    pub fn new(name: impl Into<Arc<str>>, ttl: Duration) -> Result<Self> {
        let name = name.into();
        if ttl.is_zero() {
            return Err(ResilienceError::invalid_config(format!(
                "cache `{name}`: ttl must be positive"
            )));
        }
        Ok(Self {
            name,
            ttl,
            slots: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            pool: None,
        })
    }

    /// Run computations on `pool` instead of on unbounded detached tasks.
    ///
    /// The pool must not be one whose slots are held by callers waiting on
    /// this cache, or a full pool would wait on itself.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up `key` with the configured TTL, computing it on a miss.
    pub async fn get<F, Fut, E>(&self, key: K, compute: F) -> Option<V>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.get_with_ttl(key, self.ttl, compute).await
    }

    /// Look up `key`, treating entries older than `ttl` as absent.
    ///
    /// `compute` is invoked at most once per miss episode no matter how many
    /// callers ask concurrently. An `Err` from it is cached as `None`.
    pub async fn get_with_ttl<F, Fut, E>(&self, key: K, ttl: Duration, mut compute: F) -> Option<V>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        loop {
            let computation = match self.lookup(&key, ttl, &mut compute) {
                Lookup::Hit(value) => return value,
                Lookup::Wait(computation) => computation,
            };

            let entry = computation.clone().await;
            if entry.is_fresh(ttl, Instant::now()) {
                return entry.value().cloned();
            }

            // Computed for longer than the TTL: drop the slot unless someone
            // already replaced it, then look up again.
            self.counters.stale_restarts.fetch_add(1, Ordering::Relaxed);
            debug!(cache = %self.name, key = ?key, "entry stale on arrival, looking up again");
            let mut slots = self.lock();
            if slots
                .get(&key)
                .is_some_and(|current| current.ptr_eq(&computation))
            {
                slots.remove(&key);
            }
        }
    }

    fn lookup<F, Fut, E>(&self, key: &K, ttl: Duration, compute: &mut F) -> Lookup<V>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let mut slots = self.lock();

        if let Some(existing) = slots.get(key) {
            match existing.peek() {
                Some(entry) if entry.is_fresh(ttl, Instant::now()) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Lookup::Hit(entry.value().cloned());
                }
                Some(_) => {}
                None => {
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    return Lookup::Wait(existing.clone());
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let computation = self.start(key.clone(), compute());
        slots.insert(key.clone(), computation.clone());
        Lookup::Wait(computation)
    }

    fn start<Fut, E>(&self, key: K, fut: Fut) -> Computation<V>
    where
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let name = self.name.clone();
        debug!(cache = %name, key = ?key, "cache miss, starting computation");

        let publish = async move {
            let value = match fut.await {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(cache = %name, key = ?key, error = %e, "computation failed, caching negative result");
                    None
                }
            };
            trace!(cache = %name, key = ?key, present = value.is_some(), "cache entry published");
            CacheEntry::new(value, Instant::now())
        };

        // The outer task waits for pool admission, so the coordinator never does.
        let pool = self.pool.clone();
        let task = tokio::spawn(async move {
            match pool {
                Some(pool) => pool.spawn(publish).await.await,
                None => Ok(publish.await),
            }
        });

        let name = self.name.clone();
        async move {
            match task.await {
                Ok(Ok(entry)) => Arc::new(entry),
                Ok(Err(join)) | Err(join) => {
                    error!(cache = %name, error = %join, "computation task failed");
                    Arc::new(CacheEntry::new(None, Instant::now()))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Forget the entry for `key`. Callers already waiting on an in-flight
    /// computation still receive its result.
    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Number of keys with an entry or a computation in progress.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            stale_restarts: self.counters.stale_restarts.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Computation<V>>> {
        // The map holds only cloneable handles, a panic while locked cannot
        // leave it half-updated.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
