//! Retry mechanism with exponential backoff
//!
//! A [`RetryPolicy`] is immutable configuration plus a decision function: for a
//! failed attempt it says whether to try again and how long to wait first.
//! The executors in this module run an operation under a policy and always
//! hand back a [`RetryExecutionResult`]; exhaustion is a value, never a panic
//! or an escaping error.
//!
//! An operation reports a soft failure by returning `Ok(None)`. That sentinel
//! is fed to the classifier like a raised error, so an upstream answering
//! "404" can be retried without having to invent an error for it.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{FetchError, ResilienceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay curve between attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub initial: Duration,
    pub factor: f32,
    pub max: Duration,
    /// Upper bound of the random extra delay, as a ratio of the base delay
    pub jitter: Option<f32>,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            initial: delay,
            factor: 1.0,
            max: delay,
            jitter: None,
        }
    }

    pub fn exponential(initial: Duration, factor: f32, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial,
            factor,
            max,
            jitter: None,
        }
    }

    pub fn with_jitter(mut self, ratio: f32) -> Self {
        self.jitter = Some(ratio.max(0.0));
        self
    }

    /// Reject curves that could shrink between attempts.
    pub fn validate(&self) -> Result<()> {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ResilienceError::invalid_config(format!(
                "backoff factor must be finite and >= 1.0, got {}",
                self.factor
            )));
        }
        if self.max < self.initial {
            return Err(ResilienceError::invalid_config(format!(
                "backoff cap {:?} is shorter than the initial delay {:?}",
                self.max, self.initial
            )));
        }
        if self.jitter.is_some_and(|ratio| !ratio.is_finite()) {
            return Err(ResilienceError::invalid_config("backoff jitter must be finite"));
        }
        Ok(())
    }

    /// Base delay after the given (1-based) failed attempt, without jitter.
    ///
    /// Exponential curves give `initial * factor^(attempt - 1)`, capped at `max`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.initial,
            BackoffKind::Exponential => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
                if exp == 0 {
                    return self.initial.min(self.max);
                }
                let nanos = (self.initial.as_nanos() as f64 * f64::from(self.factor).powi(exp)).round();
                if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
                    self.max
                } else {
                    Duration::from_nanos(nanos as u64)
                }
            }
        }
    }

    /// Delay to actually sleep, including jitter when enabled.
    pub fn sample(&self, attempt: usize) -> Duration {
        let base = self.delay_for_attempt(attempt);
        match self.jitter {
            Some(ratio) if ratio > 0.0 => {
                let extra = rand::thread_rng().gen_range(0.0..ratio as f64);
                base + base.mul_f64(extra)
            }
            _ => base,
        }
    }
}

/// What a single failed attempt produced.
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    /// The operation raised an error
    Failed(&'a (dyn StdError + 'static)),
    /// The operation returned the sentinel empty result
    Empty,
}

/// Decides whether an outcome is worth another attempt.
pub trait ErrorClassifier: Send + Sync + 'static {
    fn retryable(&self, outcome: &AttemptOutcome<'_>) -> bool;
}

/// Retries every error and every empty result.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl ErrorClassifier for AlwaysRetry {
    fn retryable(&self, _outcome: &AttemptOutcome<'_>) -> bool {
        true
    }
}

/// Retries empty results and [`FetchError`]s that are transient.
///
/// Errors of any other type are treated as transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientOnly;

impl ErrorClassifier for TransientOnly {
    fn retryable(&self, outcome: &AttemptOutcome<'_>) -> bool {
        match outcome {
            AttemptOutcome::Empty => true,
            AttemptOutcome::Failed(e) => e
                .downcast_ref::<FetchError>()
                .map_or(true, FetchError::is_transient),
        }
    }
}

/// Classifier built from a closure, see [`retry_if`].
pub struct RetryIf<F>(F);

/// Build a classifier from a predicate over attempt outcomes.
pub fn retry_if<F>(predicate: F) -> RetryIf<F>
where
    F: Fn(&AttemptOutcome<'_>) -> bool + Send + Sync + 'static,
{
    RetryIf(predicate)
}

impl<F> ErrorClassifier for RetryIf<F>
where
    F: Fn(&AttemptOutcome<'_>) -> bool + Send + Sync + 'static,
{
    fn retryable(&self, outcome: &AttemptOutcome<'_>) -> bool {
        (self.0)(outcome)
    }
}

/// Verdict of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Immutable retry policy, shared by every execution of an operation.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    classifier: Arc<dyn ErrorClassifier>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a policy that retries everything. `max_attempts` counts the
    /// first attempt and must be at least 1.
    pub fn new(max_attempts: usize, backoff: Backoff) -> Result<Self> {
        if max_attempts == 0 {
            return Err(ResilienceError::invalid_config(
                "retry policy needs at least one attempt",
            ));
        }
        backoff.validate()?;
        Ok(Self {
            max_attempts,
            backoff,
            classifier: Arc::new(AlwaysRetry),
        })
    }

    /// Replace the retryable-outcome predicate.
    pub fn with_classifier(mut self, classifier: impl ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn is_retryable(&self, outcome: &AttemptOutcome<'_>) -> bool {
        self.classifier.retryable(outcome)
    }

    /// Decide what to do after `attempt` (1-based) produced `outcome`.
    pub fn decide(&self, attempt: usize, outcome: &AttemptOutcome<'_>) -> RetryDecision {
        if attempt >= self.max_attempts || !self.is_retryable(outcome) {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.backoff.sample(attempt))
        }
    }
}

/// Last failure seen before the executor gave up.
#[derive(Debug)]
pub enum LastFailure<E> {
    Error(E),
    Empty,
}

impl<E: fmt::Display> fmt::Display for LastFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastFailure::Error(e) => write!(f, "{e}"),
            LastFailure::Empty => f.write_str("empty result"),
        }
    }
}

impl<E: StdError + 'static> LastFailure<E> {
    fn outcome(&self) -> AttemptOutcome<'_> {
        match self {
            LastFailure::Error(e) => AttemptOutcome::Failed(e),
            LastFailure::Empty => AttemptOutcome::Empty,
        }
    }
}

/// Either a value or the terminal failure. Never partially successful.
#[derive(Debug)]
pub enum RetryExecutionResult<V, E> {
    Value(V),
    Exhausted(LastFailure<E>),
}

impl<V, E> RetryExecutionResult<V, E> {
    pub fn is_value(&self) -> bool {
        matches!(self, RetryExecutionResult::Value(_))
    }

    pub fn into_option(self) -> Option<V> {
        match self {
            RetryExecutionResult::Value(v) => Some(v),
            RetryExecutionResult::Exhausted(_) => None,
        }
    }

    pub fn into_result(self) -> std::result::Result<V, LastFailure<E>> {
        match self {
            RetryExecutionResult::Value(v) => Ok(v),
            RetryExecutionResult::Exhausted(last) => Err(last),
        }
    }
}

fn classify<V, E>(
    result: std::result::Result<Option<V>, E>,
) -> std::result::Result<V, LastFailure<E>> {
    match result {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(LastFailure::Empty),
        Err(e) => Err(LastFailure::Error(e)),
    }
}

/// Run an async operation under `policy`.
pub async fn execute<F, Fut, V, E>(mut operation: F, policy: &RetryPolicy) -> RetryExecutionResult<V, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Option<V>, E>>,
    E: StdError + 'static,
{
    let mut attempt = 1;
    loop {
        let last = match classify(operation().await) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempts = attempt, "operation succeeded after retries");
                }
                return RetryExecutionResult::Value(value);
            }
            Err(last) => last,
        };

        let decision = policy.decide(attempt, &last.outcome());
        match decision {
            RetryDecision::GiveUp => {
                warn!(attempts = attempt, last_failure = %last, "giving up");
                return RetryExecutionResult::Exhausted(last);
            }
            RetryDecision::RetryAfter(delay) => {
                warn!(attempt, failure = %last, ?delay, "attempt failed, retrying");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Like [`execute`], but the operation receives `cancel` and a cancelled
/// token stops further attempts, including a pending backoff sleep.
pub async fn execute_cancellable<F, Fut, V, E>(
    mut operation: F,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> RetryExecutionResult<V, E>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = std::result::Result<Option<V>, E>>,
    E: StdError + 'static,
{
    let mut attempt = 1;
    loop {
        let last = match classify(operation(cancel.clone()).await) {
            Ok(value) => return RetryExecutionResult::Value(value),
            Err(last) => last,
        };

        if cancel.is_cancelled() {
            debug!(attempts = attempt, "cancelled, not retrying");
            return RetryExecutionResult::Exhausted(last);
        }

        let decision = policy.decide(attempt, &last.outcome());
        match decision {
            RetryDecision::GiveUp => {
                warn!(attempts = attempt, last_failure = %last, "giving up");
                return RetryExecutionResult::Exhausted(last);
            }
            RetryDecision::RetryAfter(delay) => {
                warn!(attempt, failure = %last, ?delay, "attempt failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(attempts = attempt, "cancelled during backoff");
                        return RetryExecutionResult::Exhausted(last);
                    }
                    _ = sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Run a synchronous operation under `policy`, sleeping the calling thread
/// between attempts.
pub fn execute_blocking<F, V, E>(mut operation: F, policy: &RetryPolicy) -> RetryExecutionResult<V, E>
where
    F: FnMut() -> std::result::Result<Option<V>, E>,
    E: StdError + 'static,
{
    let mut attempt = 1;
    loop {
        let last = match classify(operation()) {
            Ok(value) => return RetryExecutionResult::Value(value),
            Err(last) => last,
        };

        let decision = policy.decide(attempt, &last.outcome());
        match decision {
            RetryDecision::GiveUp => {
                warn!(attempts = attempt, last_failure = %last, "giving up");
                return RetryExecutionResult::Exhausted(last);
            }
            RetryDecision::RetryAfter(delay) => {
                warn!(attempt, failure = %last, ?delay, "attempt failed, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// A policy bound to an operation name, for callers that retry the same
/// operation many times.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    name: Arc<str>,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(name: impl Into<Arc<str>>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run<F, Fut, V, E>(&self, operation: F) -> RetryExecutionResult<V, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Option<V>, E>>,
        E: StdError + 'static,
    {
        let span = tracing::debug_span!("retry", operation = %self.name);
        tracing::Instrument::instrument(execute(operation, &self.policy), span).await
    }

    pub async fn run_cancellable<F, Fut, V, E>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> RetryExecutionResult<V, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<Option<V>, E>>,
        E: StdError + 'static,
    {
        let span = tracing::debug_span!("retry", operation = %self.name);
        tracing::Instrument::instrument(execute_cancellable(operation, &self.policy, cancel), span).await
    }

    pub fn run_blocking<F, V, E>(&self, operation: F) -> RetryExecutionResult<V, E>
    where
        F: FnMut() -> std::result::Result<Option<V>, E>,
        E: StdError + 'static,
    {
        let _guard = tracing::debug_span!("retry", operation = %self.name).entered();
        execute_blocking(operation, &self.policy)
    }
}
