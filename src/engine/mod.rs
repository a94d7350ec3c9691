//! Rate aggregation: cache, request deduplication and provider fan-out

pub mod inflight;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::AppConfig;
use crate::core::{
    CacheSlot, Conversion, ErrorKind, ProviderError, ProviderStatus, RateProvider, RateSnapshot,
    RequestContext, ServiceError, normalize_currency,
};
use crate::providers::build_providers;
use inflight::SingleFlight;

/// Races every enabled provider for a base currency and remembers the latest
/// winning snapshot.
///
/// Cloning is cheap and clones share the cache and in-flight rounds.
#[derive(Clone)]
pub struct RatesEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    providers: Vec<Arc<dyn RateProvider>>,
    cache: CacheSlot,
    max_concurrent: usize,
    rounds: SingleFlight<Result<RateSnapshot, ServiceError>>,
}

impl RatesEngine {
    /// `max_concurrent == 0` allows every provider to run at once.
    pub fn new(
        providers: Vec<Arc<dyn RateProvider>>,
        cache_ttl: Duration,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = if max_concurrent == 0 {
            providers.len().max(1)
        } else {
            max_concurrent
        };
        RatesEngine {
            inner: Arc::new(EngineInner {
                providers,
                cache: CacheSlot::new(cache_ttl),
                max_concurrent,
                rounds: SingleFlight::new(),
            }),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let providers = build_providers(&config.providers)?;
        info!(
            providers = providers.len(),
            cache_ttl_secs = config.cache_ttl_secs,
            "Rates engine ready"
        );
        Ok(Self::new(
            providers,
            config.cache_ttl(),
            config.max_concurrent_requests,
        ))
    }

    /// Returns the cached snapshot for `base_currency` when fresh, otherwise
    /// the first successful provider response of a (possibly shared) round.
    #[instrument(name = "GetRates", skip(self, ctx))]
    pub async fn get_rates(
        &self,
        ctx: &RequestContext,
        base_currency: &str,
    ) -> Result<RateSnapshot, ServiceError> {
        let base = normalize_currency(base_currency);
        if let Some(snapshot) = self.inner.cache.get(&base).await {
            return Ok(snapshot);
        }

        let key = format!("rates:{base}");
        let inner = Arc::clone(&self.inner);
        let round_ctx = ctx.clone();
        let round = self.inner.rounds.run(&key, move || async move {
            inner.fetch_from_providers(&round_ctx, &base).await
        });

        // Leaving early only stops this caller from waiting; the round keeps
        // running under the context of whoever started it.
        tokio::select! {
            biased;
            cause = ctx.done() => {
                debug!(%cause, "Caller stopped waiting for rates round");
                Err(ServiceError::ContextCancelled(cause))
            }
            result = round => result.unwrap_or_else(|e| Err(ServiceError::RoundAborted(e))),
        }
    }

    pub async fn convert(
        &self,
        ctx: &RequestContext,
        from: &str,
        to: &str,
        amount: f64,
    ) -> Result<Conversion, ServiceError> {
        let from = normalize_currency(from);
        let to = normalize_currency(to);
        let snapshot = self.get_rates(ctx, &from).await?;

        let rate = if to == snapshot.base {
            1.0
        } else {
            snapshot
                .rate_for(&to)
                .ok_or_else(|| ServiceError::RateNotFound {
                    from: from.clone(),
                    to: to.clone(),
                })?
        };

        Ok(Conversion {
            from,
            to,
            amount,
            rate,
            converted: amount * rate,
            provider: snapshot.provider,
        })
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.inner.providers.iter().map(|p| p.status()).collect()
    }
}

impl EngineInner {
    async fn fetch_from_providers(
        &self,
        ctx: &RequestContext,
        base: &str,
    ) -> Result<RateSnapshot, ServiceError> {
        // A round that finished just before this one started may have
        // filled the slot.
        if let Some(snapshot) = self.cache.get(base).await {
            return Ok(snapshot);
        }
        if self.providers.is_empty() {
            return Err(ServiceError::NoProviders);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for provider in &self.providers {
            let provider = Arc::clone(provider);
            let semaphore = Arc::clone(&semaphore);
            let ctx = ctx.clone();
            let base = base.to_string();
            tasks.spawn(async move {
                let name = provider.name().to_string();
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        debug!("Fetching rates from provider: {}", name);
                        provider.fetch_rates(&ctx, &base).await
                    }
                    Err(_) => Err(ProviderError::Failed {
                        provider: name.clone(),
                        message: "concurrency limiter closed".to_string(),
                    }),
                };
                (name, result)
            });
        }

        let attempted = tasks.len();
        let mut first_error: Option<ProviderError> = None;

        // Dropping `tasks` on return aborts providers still running.
        loop {
            let joined = tokio::select! {
                biased;
                cause = ctx.done() => {
                    warn!(base, %cause, "Rates round cancelled before any provider succeeded");
                    return Err(ServiceError::ContextCancelled(cause));
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let (name, result) = joined.unwrap_or_else(|join_err| {
                (
                    "unknown".to_string(),
                    Err(ProviderError::Failed {
                        provider: "unknown".to_string(),
                        message: join_err.to_string(),
                    }),
                )
            });

            match result {
                Ok(snapshot) => {
                    self.cache.put(snapshot.clone()).await;
                    info!("Successfully fetched rates from provider: {}", name);
                    return Ok(snapshot);
                }
                Err(err) => {
                    warn!(provider = %name, kind = %err.kind(), "Provider failed: {}", err);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        let Some(first) = first_error else {
            return Err(ServiceError::NoProviders);
        };
        if first.kind() == ErrorKind::ContextCancelled {
            if let Some(cause) = ctx.err() {
                return Err(ServiceError::ContextCancelled(cause));
            }
        }
        error!("All {} exchange rate providers failed", attempted);
        Err(ServiceError::AllProvidersFailed { attempted, first })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CancelCause;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    const T: i64 = 1_640_995_200;

    enum Outcome {
        Rates(&'static str),
        Fail(fn(&str) -> ProviderError),
    }

    struct FakeProvider {
        name: String,
        delay: Duration,
        outcome: Outcome,
        calls: AtomicUsize,
        completed: AtomicUsize,
    }

    impl FakeProvider {
        fn new(name: &str, delay_ms: u64, outcome: Outcome) -> Arc<Self> {
            Arc::new(FakeProvider {
                name: name.to_string(),
                delay: Duration::from_millis(delay_ms),
                outcome,
                calls: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn network_failure(provider: &str) -> ProviderError {
        ProviderError::Status {
            provider: provider.to_string(),
            status: 500,
            body: "boom".to_string(),
        }
    }

    fn invalid_failure(provider: &str) -> ProviderError {
        ProviderError::invalid_response(provider, "empty rates")
    }

    #[async_trait]
    impl RateProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_enabled(&self) -> bool {
            true
        }

        fn priority(&self) -> i32 {
            1
        }

        async fn fetch_rates(
            &self,
            ctx: &RequestContext,
            base_currency: &str,
        ) -> Result<RateSnapshot, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                cause = ctx.done() => {
                    return Err(ProviderError::Cancelled { provider: self.name.clone(), cause });
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Outcome::Rates(tag) => Ok(RateSnapshot {
                    base: normalize_currency(base_currency),
                    timestamp: T,
                    rates: HashMap::from([
                        ("EUR".to_string(), 0.85),
                        ("GBP".to_string(), 0.73),
                    ]),
                    provider: tag.to_string(),
                }),
                Outcome::Fail(make) => Err(make(&self.name)),
            }
        }
    }

    fn engine(providers: &[Arc<FakeProvider>], max_concurrent: usize) -> RatesEngine {
        let providers = providers
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn RateProvider>)
            .collect();
        RatesEngine::new(providers, Duration::from_secs(60), max_concurrent)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_wins_and_slow_provider_is_discarded() {
        let fast = FakeProvider::new("a", 50, Outcome::Rates("a"));
        let slow = FakeProvider::new("b", 5_000, Outcome::Rates("b"));
        let engine = engine(&[slow.clone(), fast.clone()], 0);

        let started = Instant::now();
        let snapshot = engine
            .get_rates(&RequestContext::background(), "USD")
            .await
            .unwrap();

        assert_eq!(snapshot.provider, "a");
        assert_eq!(snapshot.rates.get("EUR"), Some(&0.85));
        assert_eq!(snapshot.timestamp, T);
        assert!(started.elapsed() < Duration::from_millis(100));

        // The losing request is aborted, not left to finish.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(slow.calls(), 1);
        assert_eq!(slow.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_providers() {
        let provider = FakeProvider::new("a", 10, Outcome::Rates("a"));
        let engine = engine(&[provider.clone()], 0);
        let ctx = RequestContext::background();

        let first = engine.get_rates(&ctx, "USD").await.unwrap();
        let second = engine.get_rates(&ctx, "usd").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_base_misses_cache() {
        let provider = FakeProvider::new("a", 10, Outcome::Rates("a"));
        let engine = engine(&[provider.clone()], 0);
        let ctx = RequestContext::background();

        engine.get_rates(&ctx, "USD").await.unwrap();
        let eur = engine.get_rates(&ctx, "EUR").await.unwrap();

        assert_eq!(eur.base, "EUR");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_scenario() {
        let provider = FakeProvider::new("a", 10, Outcome::Rates("a"));
        let engine = engine(&[provider.clone()], 0);
        let ctx = RequestContext::background();

        let at_zero = engine.get_rates(&ctx, "USD").await.unwrap();
        assert_eq!(provider.calls(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        let at_thirty = engine.get_rates(&ctx, "USD").await.unwrap();
        assert_eq!(at_thirty.timestamp, at_zero.timestamp);
        assert_eq!(at_thirty.rates, at_zero.rates);
        assert_eq!(provider.calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        engine.get_rates(&ctx, "USD").await.unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_fan_out() {
        let a = FakeProvider::new("a", 50, Outcome::Rates("a"));
        let b = FakeProvider::new("b", 80, Outcome::Fail(network_failure));
        let engine = engine(&[a.clone(), b.clone()], 0);
        let ctx = RequestContext::background();

        let results = join_all((0..16).map(|_| engine.get_rates(&ctx, "USD"))).await;

        assert!(results.iter().all(|r| r.as_ref().unwrap().provider == "a"));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_success_among_failures_is_enough() {
        let f1 = FakeProvider::new("f1", 5, Outcome::Fail(network_failure));
        let f2 = FakeProvider::new("f2", 10, Outcome::Fail(invalid_failure));
        let ok = FakeProvider::new("ok", 200, Outcome::Rates("ok"));
        let engine = engine(&[f1, f2, ok], 0);

        let snapshot = engine
            .get_rates(&RequestContext::background(), "USD")
            .await
            .unwrap();
        assert_eq!(snapshot.provider, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_fail_reports_first_arrival() {
        // Listed first, but answers last.
        let slow = FakeProvider::new("slow", 100, Outcome::Fail(network_failure));
        let fast = FakeProvider::new("fast", 10, Outcome::Fail(invalid_failure));
        let engine = engine(&[slow, fast], 0);

        let err = engine
            .get_rates(&RequestContext::background(), "USD")
            .await
            .unwrap_err();

        match &err {
            ServiceError::AllProvidersFailed { attempted, first } => {
                assert_eq!(*attempted, 2);
                assert_eq!(first.provider(), "fast");
                assert_eq!(first.kind(), ErrorKind::InvalidResponse);
            }
            other => panic!("Expected AllProvidersFailed, got {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_round_is_not_cached() {
        let provider = FakeProvider::new("a", 10, Outcome::Fail(network_failure));
        let engine = engine(&[provider.clone()], 0);
        let ctx = RequestContext::background();

        assert!(engine.get_rates(&ctx, "USD").await.is_err());
        assert!(engine.get_rates(&ctx, "USD").await.is_err());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_providers() {
        let engine = RatesEngine::new(Vec::new(), Duration::from_secs(60), 0);
        let err = engine
            .get_rates(&RequestContext::background(), "USD")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoProviders));
        assert_eq!(err.kind(), ErrorKind::NoProviders);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_serializes_providers() {
        let providers: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|n| FakeProvider::new(n, 100, Outcome::Fail(network_failure)))
            .collect();

        let capped = engine(&providers, 1);
        let started = Instant::now();
        assert!(
            capped
                .get_rates(&RequestContext::background(), "USD")
                .await
                .is_err()
        );
        assert!(started.elapsed() >= Duration::from_millis(300));

        let uncapped = engine(&providers, 0);
        let started = Instant::now();
        assert!(
            uncapped
                .get_rates(&RequestContext::background(), "USD")
                .await
                .is_err()
        );
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_context() {
        let provider = FakeProvider::new("a", 5_000, Outcome::Rates("a"));
        let engine = engine(&[provider], 0);
        let ctx = RequestContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = engine.get_rates(&ctx, "USD").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::ContextCancelled(CancelCause::Cancelled)
        ));
        assert_eq!(err.kind(), ErrorKind::ContextCancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let provider = FakeProvider::new("a", 5_000, Outcome::Rates("a"));
        let engine = engine(&[provider], 0);
        let ctx = RequestContext::with_timeout(Duration::from_millis(100));

        let err = engine.get_rates(&ctx, "USD").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::ContextCancelled(CancelCause::DeadlineExceeded)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_sees_leader_cancellation() {
        let provider = FakeProvider::new("a", 5_000, Outcome::Rates("a"));
        let engine = engine(&[provider.clone()], 0);
        let leader_ctx = RequestContext::with_timeout(Duration::from_millis(10));
        let follower_ctx = RequestContext::background();

        let (leader, follower) = tokio::join!(
            engine.get_rates(&leader_ctx, "USD"),
            engine.get_rates(&follower_ctx, "USD"),
        );

        assert!(matches!(leader, Err(ServiceError::ContextCancelled(_))));
        assert!(matches!(follower, Err(ServiceError::ContextCancelled(_))));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_honours_its_own_deadline() {
        let provider = FakeProvider::new("a", 5_000, Outcome::Rates("a"));
        let engine = engine(&[provider.clone()], 0);
        let leader_ctx = RequestContext::background();
        let follower_ctx = RequestContext::with_timeout(Duration::from_millis(10));
        let started = Instant::now();

        let (leader, follower) = tokio::join!(
            engine.get_rates(&leader_ctx, "USD"),
            async {
                let result = engine.get_rates(&follower_ctx, "USD").await;
                (result, started.elapsed())
            },
        );

        let (follower, follower_elapsed) = follower;
        assert!(matches!(
            follower,
            Err(ServiceError::ContextCancelled(CancelCause::DeadlineExceeded))
        ));
        assert!(follower_elapsed < Duration::from_secs(1));
        assert_eq!(leader.unwrap().provider, "a");

        // The round the follower left still filled the cache
        let cached = engine.get_rates(&RequestContext::background(), "USD").await;
        assert_eq!(cached.unwrap().provider, "a");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_convert() {
        let provider = FakeProvider::new("a", 10, Outcome::Rates("a"));
        let engine = engine(&[provider], 0);
        let ctx = RequestContext::background();

        let conversion = engine.convert(&ctx, "usd", "eur", 100.0).await.unwrap();
        assert_eq!(conversion.from, "USD");
        assert_eq!(conversion.to, "EUR");
        assert_eq!(conversion.rate, 0.85);
        assert!((conversion.converted - 85.0).abs() < 1e-9);
        assert_eq!(conversion.provider, "a");

        let same = engine.convert(&ctx, "USD", "USD", 3.0).await.unwrap();
        assert_eq!(same.converted, 3.0);

        let missing = engine.convert(&ctx, "USD", "XYZ", 1.0).await.unwrap_err();
        assert!(matches!(missing, ServiceError::RateNotFound { .. }));
    }

    #[test]
    fn test_provider_status() {
        let engine = engine(
            &[
                FakeProvider::new("a", 0, Outcome::Rates("a")),
                FakeProvider::new("b", 0, Outcome::Rates("b")),
            ],
            0,
        );
        let status = engine.provider_status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "a");
        assert!(status[0].enabled);
        assert_eq!(status[1].priority, 1);
    }
}
