//! Single-flight resolution of documentation lookups.
//!
//! Each key moves through `absent -> fetching -> settled -> absent`. While a
//! key is fetching, the in-flight table holds one shared handle to the
//! outcome; every caller for that key awaits the same handle, so at most one
//! upstream fetch per key is ever outstanding.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::cache::Cache;
use crate::docs_parser::{DocFetcher, DocumentationRecord};
use crate::error::DocError;
use crate::key::CacheKey;

pub type Outcome = Result<Arc<DocumentationRecord>, DocError>;

type SharedOutcome = Shared<BoxFuture<'static, Outcome>>;

struct InFlightRequest {
    outcome: SharedOutcome,
    waiters: usize,
    started_at: Instant,
}

pub struct RequestCoordinator {
    cache: Arc<dyn Cache>,
    fetcher: Arc<dyn DocFetcher>,
    request_timeout: Duration,
    in_flight: Arc<Mutex<HashMap<CacheKey, InFlightRequest>>>,
}

impl RequestCoordinator {
    pub fn new(
        cache: Arc<dyn Cache>,
        fetcher: Arc<dyn DocFetcher>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            fetcher,
            request_timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    /// Number of keys with a fetch currently outstanding.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Returns the documentation for `key`, from the cache when fresh,
    /// otherwise from the single fetch in flight for it.
    pub async fn resolve(&self, key: &CacheKey) -> Outcome {
        let outcome = {
            // The cache check and the in-flight registration happen under the
            // same lock, so a fetch settling in between cannot be missed.
            let mut in_flight = self.in_flight.lock().await;

            if let Some(entry) = self.cache.get(key).await {
                tracing::info!("Cache hit for {}", key);
                return Ok(entry.value);
            }

            match in_flight.get_mut(key) {
                Some(pending) => {
                    pending.waiters += 1;
                    tracing::info!(
                        "Joining in-flight fetch for {} ({} waiters, started {:?} ago)",
                        key,
                        pending.waiters,
                        pending.started_at.elapsed()
                    );
                    pending.outcome.clone()
                }
                None => {
                    tracing::info!("Cache miss for {}. Fetching...", key);
                    let outcome = self.spawn_fetch(key.clone());
                    in_flight.insert(
                        key.clone(),
                        InFlightRequest {
                            outcome: outcome.clone(),
                            waiters: 0,
                            started_at: Instant::now(),
                        },
                    );
                    outcome
                }
            }
        };

        outcome.await
    }

    /// Runs the fetch on its own task so it settles (and tears down its
    /// in-flight entry) even if every caller stops waiting.
    fn spawn_fetch(&self, key: CacheKey) -> SharedOutcome {
        let cache = Arc::clone(&self.cache);
        let fetcher = Arc::clone(&self.fetcher);
        let in_flight = Arc::clone(&self.in_flight);
        let timeout = self.request_timeout;

        let task = tokio::spawn(async move {
            let fetch = AssertUnwindSafe(fetcher.fetch(&key)).catch_unwind();
            let outcome = match tokio::time::timeout(timeout, fetch).await {
                Ok(Ok(Ok(record))) => {
                    let record = Arc::new(record);
                    cache.put(key.clone(), Arc::clone(&record), record.size_hint()).await;
                    Ok(record)
                }
                Ok(Ok(Err(err))) => Err(err),
                Ok(Err(_panic)) => Err(DocError::UpstreamUnavailable(format!(
                    "fetch for {key} panicked"
                ))),
                Err(_elapsed) => Err(DocError::Timeout(timeout.as_millis() as u64)),
            };

            let settled = in_flight.lock().await.remove(&key);
            let waiters = settled.as_ref().map_or(0, |pending| pending.waiters);
            let elapsed = settled.map(|pending| pending.started_at.elapsed());
            match &outcome {
                Ok(_) => tracing::info!(
                    "Fetched {} in {:?}, released {} waiters",
                    key,
                    elapsed,
                    waiters
                ),
                Err(err) => tracing::warn!(
                    "Fetch for {} failed after {:?}: {} ({} waiters released)",
                    key,
                    elapsed,
                    err,
                    waiters
                ),
            }
            outcome
        });

        task.map(|joined| {
            joined.unwrap_or_else(|e| {
                Err(DocError::UpstreamUnavailable(format!(
                    "fetch task aborted: {e}"
                )))
            })
        })
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::ServerConfig;
    use crate::docs_parser::PackageInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fetcher that counts calls, waits `delay`, then yields `result`.
    struct ScriptedFetcher {
        calls: AtomicUsize,
        delay: Duration,
        result: Result<(), DocError>,
    }

    impl ScriptedFetcher {
        fn new(delay: Duration, result: Result<(), DocError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                result,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocFetcher for ScriptedFetcher {
        async fn fetch(&self, key: &CacheKey) -> Result<DocumentationRecord, DocError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.result.clone()?;
            Ok(DocumentationRecord {
                package: PackageInfo {
                    name: key.package().to_string(),
                    version: "1.0.0".to_string(),
                    description: None,
                    repository: None,
                    homepage: None,
                },
                item_path: key.item_path().to_string(),
                title: format!("Crate {}", key.package()),
                signature: None,
                description: None,
                content: "content".to_string(),
                cross_references: vec![],
                source_url: String::new(),
            })
        }
    }

    fn coordinator(fetcher: Arc<ScriptedFetcher>, timeout: Duration) -> RequestCoordinator {
        let cache = Arc::new(CacheStore::in_memory(&ServerConfig::default()));
        RequestCoordinator::new(cache, fetcher, timeout)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, None, None).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_fetch() {
        let fetcher = ScriptedFetcher::new(Duration::from_millis(100), Ok(()));
        let coordinator = Arc::new(coordinator(fetcher.clone(), Duration::from_secs(5)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.resolve(&key("serde")).await })
            })
            .collect();
        let results = futures::future::join_all(handles).await;

        assert_eq!(fetcher.calls(), 1);
        let first = results[0].as_ref().unwrap().as_ref().unwrap();
        for result in &results {
            let record = result.as_ref().unwrap().as_ref().unwrap();
            assert!(Arc::ptr_eq(first, record));
        }
        assert_eq!(coordinator.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let fetcher = ScriptedFetcher::new(Duration::ZERO, Ok(()));
        let coordinator = coordinator(fetcher.clone(), Duration::from_secs(5));

        coordinator.resolve(&key("serde")).await.unwrap();
        coordinator.resolve(&key("Serde")).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_fetch_independently() {
        let fetcher = ScriptedFetcher::new(Duration::from_millis(20), Ok(()));
        let coordinator = coordinator(fetcher.clone(), Duration::from_secs(5));

        let (serde, tokio) = (key("serde"), key("tokio"));
        let (a, b) = tokio::join!(coordinator.resolve(&serde), coordinator.resolve(&tokio));
        assert_eq!(a.unwrap().package.name, "serde");
        assert_eq!(b.unwrap().package.name, "tokio");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_equivalent_spellings_share_one_fetch() {
        let fetcher = ScriptedFetcher::new(Duration::from_millis(20), Ok(()));
        let coordinator = coordinator(fetcher.clone(), Duration::from_secs(5));

        let dashed = CacheKey::new("serde-json", None, Some("serde_json::Value")).unwrap();
        let underscored = CacheKey::new("serde_json", None, Some("Value")).unwrap();
        let (a, b) = tokio::join!(
            coordinator.resolve(&dashed),
            coordinator.resolve(&underscored)
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_reaches_all_waiters_and_allows_retry() {
        let failure = DocError::UpstreamUnavailable("connection reset".to_string());
        let fetcher = ScriptedFetcher::new(Duration::from_millis(50), Err(failure.clone()));
        let coordinator = coordinator(fetcher.clone(), Duration::from_secs(5));

        let serde = key("serde");
        let (a, b, c) = tokio::join!(
            coordinator.resolve(&serde),
            coordinator.resolve(&serde),
            coordinator.resolve(&serde),
        );
        for result in [a, b, c] {
            assert_eq!(result.unwrap_err(), failure);
        }
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(coordinator.in_flight_count().await, 0);
        assert!(coordinator.cache().get(&serde).await.is_none());

        assert!(coordinator.resolve(&serde).await.is_err());
        assert_eq!(fetcher.calls(), 2, "a settled failure is not cached");
    }

    #[tokio::test]
    async fn test_timeout_fails_all_waiters() {
        let fetcher = ScriptedFetcher::new(Duration::from_secs(10), Ok(()));
        let coordinator = coordinator(fetcher.clone(), Duration::from_millis(50));

        let serde = key("serde");
        let (a, b) = tokio::join!(coordinator.resolve(&serde), coordinator.resolve(&serde));
        assert_eq!(a.unwrap_err(), DocError::Timeout(50));
        assert_eq!(b.unwrap_err(), DocError::Timeout(50));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(coordinator.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_fetch() {
        let fetcher = ScriptedFetcher::new(Duration::from_millis(50), Ok(()));
        let coordinator = Arc::new(coordinator(fetcher.clone(), Duration::from_secs(5)));

        let abandoned = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.resolve(&key("serde")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();

        let record = coordinator.resolve(&key("serde")).await.unwrap();
        assert_eq!(record.package.name, "serde");
        assert_eq!(fetcher.calls(), 1);
    }
}
