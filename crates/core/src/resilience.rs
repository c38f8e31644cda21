//! Timeout, retry and stale-cache fallback for outbound calls.

use crate::cache::{CacheHit, CachePolicy, CacheStore, Freshness};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry behaviour for one outbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Deadline for each individual attempt
    pub timeout: Duration,
    /// Attempts after the first one
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per attempt
    pub base_delay: Duration,
    /// Upper bound (exclusive) of the random jitter added to each backoff
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(100),
            max_retries: 2,
            base_delay: Duration::from_millis(50),
            max_jitter: Duration::from_millis(10),
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Backoff after failed attempt `attempt` (zero based), without jitter
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Backoff plus jitter in `[0, max_jitter)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };
        self.backoff_for_attempt(attempt).saturating_add(jitter)
    }
}

/// Marks an attempt error that retrying cannot fix
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PermanentFailure(pub String);

/// Per-call options
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Cache key for the target
    pub key: String,
    /// Idempotent reads may be served from and written to the cache
    pub idempotent: bool,
    /// Overrides the store's default windows
    pub cache_policy: Option<CachePolicy>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn read(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            idempotent: true,
            cache_policy: None,
            cancel: None,
        }
    }

    pub fn mutation(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            idempotent: false,
            cache_policy: None,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }
}

/// Where a successful response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Live,
    /// Fresh cache hit, no live attempt made
    Cache,
    /// Every live attempt failed; served from the stale window
    Stale { age: Duration },
}

#[derive(Debug, Clone)]
pub struct CallOutcome<T> {
    pub value: T,
    pub source: ResponseSource,
    pub attempts: u32,
}

impl<T> CallOutcome<T> {
    pub fn is_stale(&self) -> bool {
        matches!(self.source, ResponseSource::Stale { .. })
    }

    /// Label for stale markers in responses
    pub fn cache_status(&self) -> &'static str {
        match self.source {
            ResponseSource::Live => "live",
            ResponseSource::Cache => "hit",
            ResponseSource::Stale { .. } => "stale",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("{key}: giving up after {attempts} attempt(s), retry after {}ms: {last_error:#}", retry_after.as_millis())]
    Exhausted {
        key: String,
        attempts: u32,
        retry_after: Duration,
        #[source]
        last_error: anyhow::Error,
    },

    #[error("{key}: permanent failure after {attempts} attempt(s): {last_error:#}")]
    Rejected {
        key: String,
        attempts: u32,
        #[source]
        last_error: anyhow::Error,
    },

    #[error("{key}: cancelled after {attempts} attempt(s)")]
    Cancelled { key: String, attempts: u32 },

    #[error("outbound call limiter closed")]
    Closed,
}

impl CallError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Rejected { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
            Self::Closed => 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Bookkeeping for one call; dropped when the call returns
#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    accumulated_delay: Duration,
}

/// Runs outbound calls under [`RetryConfig`] and falls back to a shared
/// [`CacheStore`] for idempotent reads.
#[derive(Debug, Clone)]
pub struct ResilientCaller<T> {
    cache: Arc<CacheStore<T>>,
    limiter: Option<Arc<Semaphore>>,
}

impl<T: Clone + Send + Sync> ResilientCaller<T> {
    pub fn new(cache: Arc<CacheStore<T>>) -> Self {
        Self {
            cache,
            limiter: None,
        }
    }

    /// Bound the number of calls in flight at once
    pub fn with_concurrency_limit(mut self, max_concurrent: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(max_concurrent)));
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore<T>> {
        &self.cache
    }

    /// Execute `attempt` until it succeeds, the retry budget runs out, or the
    /// caller's token fires.
    pub async fn call<F, Fut>(
        &self,
        options: CallOptions,
        config: &RetryConfig,
        mut attempt: F,
    ) -> Result<CallOutcome<T>, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = options.key.clone();
        let cancel = options.cancel.clone().unwrap_or_default();

        if options.idempotent {
            if let Some(hit) = self.cache.get(&key) {
                if hit.freshness == Freshness::Fresh {
                    debug!(key = %key, "Serving fresh cache hit");
                    return Ok(CallOutcome {
                        value: hit.value,
                        source: ResponseSource::Cache,
                        attempts: 0,
                    });
                }
            }
        }

        let _permit = match &self.limiter {
            Some(limiter) => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(CallError::Cancelled { key, attempts: 0 });
                }
                permit = limiter.clone().acquire_owned() => {
                    Some(permit.map_err(|_| CallError::Closed)?)
                }
            },
            None => None,
        };

        let mut state = RetryState::default();
        let last_error = loop {
            if cancel.is_cancelled() {
                return Err(CallError::Cancelled {
                    key,
                    attempts: state.attempts,
                });
            }

            state.attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(key = %key, attempt = state.attempts, "Attempt aborted by cancellation");
                    return Err(CallError::Cancelled { key, attempts: state.attempts });
                }
                result = tokio::time::timeout(config.timeout, attempt()) => result,
            };

            let error = match result {
                Ok(Ok(value)) => {
                    if options.idempotent {
                        let policy = options
                            .cache_policy
                            .unwrap_or_else(|| self.cache.default_policy());
                        self.cache.set_with_policy(key.clone(), value.clone(), policy);
                    }
                    debug!(
                        key = %key,
                        attempts = state.attempts,
                        delay_ms = state.accumulated_delay.as_millis() as u64,
                        "Outbound call succeeded"
                    );
                    return Ok(CallOutcome {
                        value,
                        source: ResponseSource::Live,
                        attempts: state.attempts,
                    });
                }
                Ok(Err(error)) => error,
                Err(_) => anyhow::anyhow!(
                    "attempt timed out after {}ms",
                    config.timeout.as_millis()
                ),
            };

            if error.downcast_ref::<PermanentFailure>().is_some() {
                warn!(key = %key, attempt = state.attempts, error = %error, "Permanent failure, not retrying");
                return Err(CallError::Rejected {
                    key,
                    attempts: state.attempts,
                    last_error: error,
                });
            }

            if state.attempts > config.max_retries {
                break error;
            }

            let backoff = config.delay_for_attempt(state.attempts - 1);
            warn!(
                key = %key,
                attempt = state.attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Outbound attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(CallError::Cancelled { key, attempts: state.attempts });
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            state.accumulated_delay = state.accumulated_delay.saturating_add(backoff);
        };

        if options.idempotent {
            if let Some(CacheHit { value, age, .. }) = self.cache.get(&key) {
                warn!(
                    key = %key,
                    attempts = state.attempts,
                    age_ms = age.as_millis() as u64,
                    error = %last_error,
                    "All attempts failed, serving stale cache entry"
                );
                return Ok(CallOutcome {
                    value,
                    source: ResponseSource::Stale { age },
                    attempts: state.attempts,
                });
            }
        }

        Err(CallError::Exhausted {
            key,
            attempts: state.attempts,
            retry_after: config.backoff_for_attempt(state.attempts),
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn caller() -> ResilientCaller<String> {
        ResilientCaller::new(Arc::new(CacheStore::new()))
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();

        assert_eq!(config.timeout, Duration::from_millis(100));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.base_delay, Duration::from_millis(50));
        assert_eq!(config.total_attempts(), 3);
    }

    #[test]
    fn test_backoff_doubles() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(50));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::default();

        for _ in 0..200 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(110));
        }
    }

    #[test]
    fn test_huge_delays_saturate() {
        let config = RetryConfig {
            base_delay: Duration::MAX,
            max_jitter: Duration::from_millis(u64::MAX),
            ..Default::default()
        };

        assert_eq!(config.backoff_for_attempt(40), Duration::MAX);
        assert_eq!(config.delay_for_attempt(3), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanently_failing_target_makes_three_attempts() {
        let caller = caller();
        let started = Instant::now();
        let starts = Arc::new(Mutex::new(Vec::new()));

        let recorded = starts.clone();
        let err = caller
            .call(CallOptions::read("down"), &RetryConfig::default(), || {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(started.elapsed());
                    Err::<String, _>(anyhow::anyhow!("connection refused"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 3);
        match &err {
            CallError::Exhausted {
                retry_after,
                last_error,
                ..
            } => {
                assert_eq!(*retry_after, Duration::from_millis(400));
                assert!(last_error.to_string().contains("connection refused"));
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 3);
        let first_gap = starts[1] - starts[0];
        let second_gap = starts[2] - starts[1];
        assert_eq!(starts[0], Duration::ZERO);
        assert!(first_gap >= Duration::from_millis(50) && first_gap < Duration::from_millis(60));
        assert!(second_gap >= Duration::from_millis(100) && second_gap < Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_deadline_counts_as_failure() {
        let caller = caller();
        let calls = Arc::new(Mutex::new(0u32));

        let counter = calls.clone();
        let outcome = caller
            .call(CallOptions::read("slow"), &RetryConfig::default(), || {
                let counter = counter.clone();
                async move {
                    let n = {
                        let mut calls = counter.lock().unwrap();
                        *calls += 1;
                        *calls
                    };
                    if n == 1 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    anyhow::Ok(format!("attempt {}", n))
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, "attempt 2");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.source, ResponseSource::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fallback_after_failures() {
        let caller = caller();
        let policy = CachePolicy {
            ttl: Duration::from_secs(1),
            stale_grace: Duration::from_secs(60),
        };

        caller
            .call(
                CallOptions::read("page").with_cache_policy(policy),
                &RetryConfig::default(),
                || async { anyhow::Ok("cached body".to_string()) },
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;

        let outcome = caller
            .call(CallOptions::read("page"), &RetryConfig::default(), || async {
                Err::<String, _>(anyhow::anyhow!("503 Service Unavailable"))
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, "cached body");
        assert!(outcome.is_stale());
        assert_eq!(outcome.cache_status(), "stale");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_hit_skips_live_call() {
        let caller = caller();
        caller.cache().set("page", "cached".to_string(), Duration::from_secs(60));

        let outcome = caller
            .call(CallOptions::read("page"), &RetryConfig::default(), || async {
                Err::<String, _>(anyhow::anyhow!("should not be called"))
            })
            .await
            .unwrap();

        assert_eq!(outcome.source, ResponseSource::Cache);
        assert_eq!(outcome.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_is_never_cached_or_substituted() {
        let caller = caller();
        caller.cache().set("submit", "old".to_string(), Duration::from_secs(60));

        let outcome = caller
            .call(CallOptions::mutation("submit"), &RetryConfig::default(), || async {
                anyhow::Ok("new".to_string())
            })
            .await
            .unwrap();
        assert_eq!(outcome.value, "new");
        assert_eq!(caller.cache().get_fresh("submit").as_deref(), Some("old"));

        let err = caller
            .call(CallOptions::mutation("submit"), &RetryConfig::default(), || async {
                Err::<String, _>(anyhow::anyhow!("boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let caller = caller();
        let calls = Arc::new(Mutex::new(0u32));

        let counter = calls.clone();
        let err = caller
            .call(CallOptions::read("missing"), &RetryConfig::default(), || {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<String, _>(PermanentFailure("404 Not Found".to_string()).into())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Rejected { attempts: 1, .. }));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_current_attempt() {
        let caller = caller();
        let token = CancellationToken::new();
        let calls = Arc::new(Mutex::new(0u32));

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let counter = calls.clone();
        let config = RetryConfig {
            timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let err = caller
            .call(CallOptions::read("slow").with_cancel(token), &config, || {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    anyhow::Ok("late".to_string())
                }
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_starts_no_attempt() {
        let caller = caller();
        let token = CancellationToken::new();
        token.cancel();

        let err = caller
            .call(CallOptions::read("k").with_cancel(token), &RetryConfig::default(), || async {
                anyhow::Ok("never".to_string())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Cancelled { attempts: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_not_served() {
        let caller = caller();
        caller.cache().set_with_policy(
            "page",
            "ancient".to_string(),
            CachePolicy {
                ttl: Duration::from_secs(1),
                stale_grace: Duration::from_secs(1),
            },
        );

        tokio::time::advance(Duration::from_secs(5)).await;

        let err = caller
            .call(CallOptions::read("page"), &RetryConfig::default(), || async {
                Err::<String, _>(anyhow::anyhow!("503 Service Unavailable"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Exhausted { attempts: 3, .. }));
        assert!(!caller.cache().contains("page"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff_stops_retries() {
        let caller = caller();
        let token = CancellationToken::new();
        let calls = Arc::new(Mutex::new(0u32));
        let started = Instant::now();

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let counter = calls.clone();
        let config = RetryConfig {
            base_delay: Duration::from_secs(30),
            ..Default::default()
        };
        let err = caller
            .call(CallOptions::read("flaky").with_cancel(token), &config, || {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<String, _>(anyhow::anyhow!("connection reset"))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Cancelled { attempts: 1, .. }));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_queues_and_cancels_waiters() {
        let caller = caller().with_concurrency_limit(1);
        let config = RetryConfig {
            timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let release = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(Mutex::new(Vec::new()));

        let holder = {
            let caller = caller.clone();
            let release = release.clone();
            let started = started.clone();
            tokio::spawn(async move {
                caller
                    .call(CallOptions::mutation("first"), &config, || {
                        let release = release.clone();
                        let started = started.clone();
                        async move {
                            started.lock().unwrap().push("first");
                            release.notified().await;
                            anyhow::Ok("first".to_string())
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*started.lock().unwrap(), vec!["first"]);

        let waiter = {
            let caller = caller.clone();
            let started = started.clone();
            tokio::spawn(async move {
                caller
                    .call(CallOptions::mutation("second"), &config, || {
                        let started = started.clone();
                        async move {
                            started.lock().unwrap().push("second");
                            anyhow::Ok("second".to_string())
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Still queued behind the held permit
        assert_eq!(*started.lock().unwrap(), vec!["first"]);

        let token = CancellationToken::new();
        let cancelled = {
            let caller = caller.clone();
            let token = token.clone();
            tokio::spawn(async move {
                caller
                    .call(CallOptions::mutation("third").with_cancel(token), &config, || async {
                        anyhow::Ok("third".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let err = cancelled.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::Cancelled { attempts: 0, .. }));

        release.notify_one();
        assert_eq!(holder.await.unwrap().unwrap().value, "first");
        assert_eq!(waiter.await.unwrap().unwrap().value, "second");
        assert_eq!(*started.lock().unwrap(), vec!["first", "second"]);
    }
}
