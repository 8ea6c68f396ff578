use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{FailureKind, FetchError};
use crate::grid::Cell;
use crate::places::{PlacesApi, SearchPage};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub quota_factor: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            quota_factor: config.quota_backoff_factor.max(1),
        }
    }

    /// Backoff before retry number `attempt + 1`, without jitter.
    pub fn delay_for(&self, attempt: u32, kind: FailureKind) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()));
        match kind {
            FailureKind::QuotaExceeded => capped * self.quota_factor,
            _ => capped,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CallKind {
    Search,
    Detail,
}

impl CallKind {
    fn as_str(&self) -> &'static str {
        match self {
            CallKind::Search => "search",
            CallKind::Detail => "detail",
        }
    }
}

/// Wraps a [`PlacesApi`] with a concurrency ceiling, a shared rate limit, a
/// per-worker pause after every call and classified retries. It never touches
/// the cache; callers persist whatever it returns.
///
/// Every wait (permit, rate limit, request, backoff) races the caller's
/// [`CancellationToken`]; a cancelled call returns a `Cancelled` error.
pub struct RetryingClient {
    api: Arc<dyn PlacesApi>,
    policy: RetryPolicy,
    permits: Semaphore,
    rate_limiter: RateLimiter,
    search_delay: Duration,
    detail_delay: Duration,
    jitter_rng: Mutex<StdRng>,
    search_attempts: AtomicU64,
    detail_attempts: AtomicU64,
}

impl RetryingClient {
    pub fn new(api: Arc<dyn PlacesApi>, config: &AppConfig) -> Self {
        let ceiling = config.search_concurrency.max(config.details_concurrency).max(1);
        Self::with_parts(
            api,
            RetryPolicy::from_config(config),
            ceiling,
            config.places_rate_limit_qps,
            config.search_delay(),
            config.details_delay(),
            StdRng::from_entropy(),
        )
    }

    pub fn with_parts(
        api: Arc<dyn PlacesApi>,
        policy: RetryPolicy,
        max_in_flight: usize,
        qps: u32,
        search_delay: Duration,
        detail_delay: Duration,
        rng: StdRng,
    ) -> Self {
        Self {
            api,
            policy,
            permits: Semaphore::new(max_in_flight.max(1)),
            rate_limiter: RateLimiter::new(qps),
            search_delay,
            detail_delay,
            jitter_rng: Mutex::new(rng),
            search_attempts: AtomicU64::new(0),
            detail_attempts: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of search requests issued, retries included.
    pub fn search_attempts(&self) -> u64 {
        self.search_attempts.load(Ordering::SeqCst)
    }

    pub fn detail_attempts(&self) -> u64 {
        self.detail_attempts.load(Ordering::SeqCst)
    }

    pub async fn search(
        &self,
        cell: &Cell,
        cancel: &CancellationToken,
    ) -> Result<SearchPage, FetchError> {
        let api = self.api.as_ref();
        let key = cell.key();
        self.call(CallKind::Search, &key, cancel, move || api.search(cell))
            .await
    }

    pub async fn detail(&self, place_id: &str, cancel: &CancellationToken) -> Result<Value, FetchError> {
        let api = self.api.as_ref();
        self.call(CallKind::Detail, place_id, cancel, move || api.detail(place_id))
            .await
    }

    async fn call<T, F, Fut>(
        &self,
        kind: CallKind,
        key: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        if cancel.is_cancelled() {
            return Err(FetchError::cancelled().with_attempts(0, false));
        }
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::cancelled().with_attempts(0, false)),
            permit = self.permits.acquire() => {
                permit.map_err(|_| FetchError::permanent("client is shut down"))?
            }
        };

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FetchError::cancelled()),
                outcome = async {
                    self.rate_limiter.wait().await;
                    self.counter(kind).fetch_add(1, Ordering::SeqCst);
                    op().await
                } => outcome,
            };

            match outcome {
                Ok(value) => break Ok(value),
                Err(err) if err.is_cancelled() => {
                    debug!(call = kind.as_str(), key, attempt, "call cancelled");
                    return Err(err.with_attempts(attempt, false));
                }
                Err(err) if !err.is_retryable() => {
                    debug!(call = kind.as_str(), key, error = %err.message, "permanent failure");
                    break Err(err.with_attempts(attempt, false));
                }
                Err(err) if attempt >= self.policy.max_attempts => {
                    warn!(
                        call = kind.as_str(),
                        key,
                        attempt,
                        kind = %err.kind,
                        "retry budget exhausted"
                    );
                    break Err(err.with_attempts(attempt, true));
                }
                Err(err) => {
                    let delay = self.backoff_delay(attempt, err.kind);
                    warn!(
                        call = kind.as_str(),
                        key,
                        attempt,
                        kind = %err.kind,
                        error = %err.message,
                        "request failed; retrying after {:?}",
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(call = kind.as_str(), key, attempt, "backoff cancelled");
                            return Err(FetchError::cancelled().with_attempts(attempt, false));
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        };

        let pause = match kind {
            CallKind::Search => self.search_delay,
            CallKind::Detail => self.detail_delay,
        };
        if !pause.is_zero() {
            // A finished call is still returned so the caller can persist it.
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(pause) => {}
            }
        }
        result
    }

    fn counter(&self, kind: CallKind) -> &AtomicU64 {
        match kind {
            CallKind::Search => &self.search_attempts,
            CallKind::Detail => &self.detail_attempts,
        }
    }

    fn backoff_delay(&self, attempt: u32, kind: FailureKind) -> Duration {
        let base = self.policy.delay_for(attempt, kind);
        let jitter_cap = self.policy.base.as_millis() as u64;
        if jitter_cap == 0 {
            return base;
        }
        let jitter_ms = self.jitter_rng.lock().gen_range(0..jitter_cap);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Spaces requests at least `1/qps` apart across all workers. `0` disables it.
struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        let min_interval = if qps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1000_f64 / qps as f64).ceil() as u64)
        };
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use futures_util::future::join_all;
    use serde_json::json;

    use super::*;
    use crate::grid::{Region, RegionGrid};

    struct ScriptedApi {
        details: Mutex<VecDeque<Result<Value, FetchError>>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        quota_only: bool,
    }

    impl ScriptedApi {
        fn new(details: Vec<Result<Value, FetchError>>) -> Self {
            Self {
                details: Mutex::new(details.into()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                quota_only: false,
            }
        }
    }

    #[async_trait]
    impl PlacesApi for ScriptedApi {
        async fn search(&self, _cell: &Cell) -> Result<SearchPage, FetchError> {
            if self.quota_only {
                return Err(FetchError::quota("RESOURCE_EXHAUSTED"));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(SearchPage::default())
        }

        async fn detail(&self, _place_id: &str) -> Result<Value, FetchError> {
            self.details
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::transient("script exhausted")))
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(8),
            quota_factor: 3,
        }
    }

    fn client(api: Arc<ScriptedApi>, max_attempts: u32, max_in_flight: usize) -> RetryingClient {
        RetryingClient::with_parts(
            api,
            policy(max_attempts),
            max_in_flight,
            0,
            Duration::ZERO,
            Duration::ZERO,
            StdRng::seed_from_u64(7),
        )
    }

    #[tokio::test]
    async fn retries_transient_failures_before_succeeding() {
        let api = Arc::new(ScriptedApi::new(vec![
            Err(FetchError::transient("reset")),
            Err(FetchError::quota("429")),
            Ok(json!({ "id": "p1" })),
        ]));
        let client = client(api, 5, 2);

        let detail = client.detail("p1", &CancellationToken::new()).await.unwrap();
        assert_eq!(detail["id"], "p1");
        assert_eq!(client.detail_attempts(), 3);
    }

    #[tokio::test]
    async fn stops_at_max_attempts() {
        let api = Arc::new(ScriptedApi::new(Vec::new()));
        let client = client(api, 4, 2);

        let err = client.detail("p1", &CancellationToken::new()).await.unwrap_err();
        assert!(err.exhausted);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.kind, FailureKind::Transient);
        assert_eq!(client.detail_attempts(), 4);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let api = Arc::new(ScriptedApi::new(vec![
            Err(FetchError::permanent("INVALID_ARGUMENT")),
            Ok(json!({})),
        ]));
        let client = client(api, 5, 2);

        let err = client.detail("p1", &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
        assert!(!err.exhausted);
        assert_eq!(client.detail_attempts(), 1);
    }

    #[tokio::test]
    async fn bounds_concurrent_calls() {
        let api = Arc::new(ScriptedApi::new(Vec::new()));
        let client = client(api.clone(), 3, 2);
        let region = Region::new(0.0, 1.0, 0.0, 1.0, 3, 3).unwrap();
        let cells = RegionGrid::build(&region, 0.0);

        let cancel = CancellationToken::new();
        let results = join_all(cells.iter().map(|cell| client.search(cell, &cancel))).await;
        assert!(results.iter().all(Result::is_ok));
        assert!(api.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(client.search_attempts(), 9);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let mut api = ScriptedApi::new(Vec::new());
        api.quota_only = true;
        let client = RetryingClient::with_parts(
            Arc::new(api),
            RetryPolicy {
                max_attempts: 5,
                base: Duration::from_millis(500),
                multiplier: 2.0,
                max_delay: Duration::from_secs(30),
                quota_factor: 4,
            },
            1,
            0,
            Duration::ZERO,
            Duration::ZERO,
            StdRng::seed_from_u64(7),
        );
        let region = Region::new(0.0, 1.0, 0.0, 1.0, 1, 1).unwrap();
        let cell = RegionGrid::build(&region, 0.0).remove(0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = client.search(&cell, &cancel).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(err.kind, FailureKind::Cancelled);
        assert_eq!(client.search_attempts(), 1);

        let err = client.search(&cell, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(client.search_attempts(), 1);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = policy(5);
        assert_eq!(policy.delay_for(1, FailureKind::Transient), Duration::from_millis(1));
        assert_eq!(policy.delay_for(3, FailureKind::Transient), Duration::from_millis(4));
        assert_eq!(policy.delay_for(10, FailureKind::Transient), Duration::from_millis(8));
        assert_eq!(policy.delay_for(3, FailureKind::QuotaExceeded), Duration::from_millis(12));
    }
}
