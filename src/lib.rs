//! # resilient-fetch
//!
//! Cached, retried and deadline-bounded reads of slow, unreliable upstreams.
//!
//! ## Core Concepts
//!
//! - **RetryExecutor**: runs an operation under an immutable [`RetryPolicy`]
//!   (attempt budget, backoff curve, retryable-outcome classifier) and always
//!   returns a value or the terminal failure, never a panic
//! - **DeadlineExecutor**: runs work on a bounded [`WorkerPool`] and gives up
//!   waiting after a timeout, cancelling a token instead of killing the worker;
//!   a full pool makes callers wait, never fail
//! - **SingleFlightCache**: TTL cache with at most one in-flight computation
//!   per key; failures are cached as `None` so a broken upstream is not
//!   hammered
//! - **ResilientFetch**: the three composed around one [`Fetcher`]
//! - **Layers**: the same behaviour as tower middleware
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use resilient_fetch::{
//!     ConfigBuilder, DeadlineExecutor, FetchError, FnFetcher, ResilientFetch, RetryExecutor,
//!     SingleFlightCache, WorkerPool,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> resilient_fetch::Result<()> {
//! let config = ConfigBuilder::new().max_attempts(3).timeout(Duration::from_millis(500)).build()?;
//! let pool = WorkerPool::new(config.pool)?;
//!
//! let upstream = FnFetcher::<_, String>::new(|key: String, _cancel: CancellationToken| async move {
//!     Ok::<_, FetchError>(Some(format!("value for {key}")))
//! });
//!
//! let read = ResilientFetch::new(
//!     Arc::new(upstream),
//!     RetryExecutor::new("lookup", config.retry_policy("lookup")?),
//!     DeadlineExecutor::new("lookup", config.deadline_for("lookup"), pool)?,
//!     SingleFlightCache::new("lookups", Duration::from_secs(60))?
//!         .with_pool(WorkerPool::new(config.fetch_pool)?),
//! );
//!
//! let value = read.resilient_get_with_deadline("130000").await?;
//! println!("{value}");
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod deadline;
pub mod error;
pub mod fetch;
pub mod layers;
pub mod resilient;
pub mod retry;
pub mod weather;

pub use cache::{CacheEntry, CacheStats, SingleFlightCache};
pub use config::{ConfigBuilder, ResilienceConfig};
pub use deadline::{DeadlineExecutor, WorkerPool};
pub use error::{FetchError, ResilienceError, Result};
pub use fetch::{FaultInjector, Fetcher, FnFetcher};
pub use layers::{DeadlineLayer, RetryLayer, SingleFlightLayer};
pub use resilient::ResilientFetch;
pub use retry::{
    Backoff, ErrorClassifier, RetryExecutionResult, RetryExecutor, RetryPolicy, TransientOnly,
};
pub use weather::{AreaDirectory, ForecastOverview, WeatherDataService};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
