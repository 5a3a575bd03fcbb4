//! Resilient cache over a key-value store.

use super::fetch::{FetchSource, Fetched};
use super::write_behind::{WriteBehind, WriteOutcome};
use crate::resilience::{CallError, CircuitBreaker};
use crate::store::KeyValueStore;
use crate::telemetry::{CacheMetrics, CacheOperation, NoopMetrics};
use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub enabled: bool,
    pub key_prefix: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            enabled: true,
            key_prefix: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
}

/// JSON cache whose store access goes through a circuit breaker.
///
/// Reads never fail: an open circuit, a store error or an unreadable value
/// all count as a miss. Every get, set and delete is reported to the metrics
/// collector.
#[derive(Clone)]
pub struct ResilientCache {
    store: Arc<dyn KeyValueStore>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<dyn CacheMetrics>,
    config: CacheConfig,
}

impl ResilientCache {
    pub fn new(store: Arc<dyn KeyValueStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            store,
            breaker,
            metrics: Arc::new(NoopMetrics),
            config: CacheConfig::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    fn full_key(&self, key: &str) -> String {
        match &self.config.key_prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }

    fn record(&self, operation: CacheOperation, key: &str, hit: bool, started: Instant) {
        if let Err(e) = self
            .metrics
            .record_cache_operation(operation, key, hit, started.elapsed())
        {
            tracing::debug!(error = %e, "metrics collector rejected cache operation");
        }
    }

    fn record_error(&self, operation: CacheOperation, key: &str, error: &str) {
        if let Err(e) = self.metrics.record_cache_error(operation, key, error) {
            tracing::debug!(error = %e, "metrics collector rejected cache error");
        }
    }

    /// Cached value for `key`, or `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let full = self.full_key(key);
        let started = Instant::now();
        let raw = match self.breaker.execute(|| self.store.get(&full)).await {
            Ok(raw) => raw,
            Err(CallError::Open { .. }) => None,
            Err(CallError::Failed(e)) => {
                tracing::warn!(key = %full, error = %e, "cache read failed");
                self.record_error(CacheOperation::Get, &full, &e.to_string());
                None
            }
        };
        let value = raw.and_then(|raw| match serde_json::from_str::<T>(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %full, error = %e, "unreadable cache entry, treating as miss");
                self.record_error(CacheOperation::Get, &full, &e.to_string());
                None
            }
        });
        self.record(CacheOperation::Get, &full, value.is_some(), started);
        value
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, self.config.default_ttl).await
    }

    pub async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let raw = serde_json::to_string(value)?;
        self.put(&self.full_key(key), &raw, ttl)
            .await
            .map_err(Error::from)
    }

    /// Remove `key`; returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let full = self.full_key(key);
        let started = Instant::now();
        match self.breaker.execute(|| self.store.del(&full)).await {
            Ok(removed) => {
                self.record(CacheOperation::Delete, &full, removed, started);
                Ok(removed)
            }
            Err(CallError::Failed(e)) => {
                self.record_error(CacheOperation::Delete, &full, &e.to_string());
                Err(e)
            }
            Err(open) => Err(open.into()),
        }
    }

    /// Cached value for `key`, or the result of `fetch` written back in the background.
    ///
    /// `fetch` is not guarded by the breaker and its error is returned as is.
    pub async fn get_or_fetch<T, E, F, Fut>(&self, key: &str, fetch: F) -> std::result::Result<Fetched<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.get_or_fetch_with_ttl(key, self.config.default_ttl, fetch)
            .await
    }

    pub async fn get_or_fetch_with_ttl<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> std::result::Result<Fetched<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get::<T>(key).await {
            return Ok(Fetched {
                value,
                source: FetchSource::Cache,
                write: WriteBehind::skipped(),
            });
        }
        let value = fetch().await?;
        let write = self.write_behind(key, &value, ttl);
        Ok(Fetched {
            value,
            source: FetchSource::Origin,
            write,
        })
    }

    fn write_behind<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> WriteBehind {
        if !self.config.enabled {
            return WriteBehind::skipped();
        }
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                self.record_error(CacheOperation::Set, &self.full_key(key), &e.to_string());
                return WriteBehind::ready(WriteOutcome::Failed(e.to_string()));
            }
        };
        let cache = self.clone();
        let key = key.to_string();
        WriteBehind::spawn(async move { cache.put_raw(&key, raw, ttl).await })
    }

    async fn put(
        &self,
        full: &str,
        raw: &str,
        ttl: Duration,
    ) -> std::result::Result<(), CallError<Error>> {
        let started = Instant::now();
        let result = self
            .breaker
            .execute(|| self.store.set(full, raw, Some(ttl)))
            .await;
        match &result {
            Ok(()) => self.record(CacheOperation::Set, full, false, started),
            Err(CallError::Failed(e)) => {
                tracing::warn!(key = %full, error = %e, "cache write failed");
                self.record_error(CacheOperation::Set, full, &e.to_string());
            }
            Err(CallError::Open { name }) => {
                tracing::debug!(breaker = %name, key = %full, "circuit open, cache write skipped");
            }
        }
        result
    }

    async fn put_raw(&self, key: &str, raw: String, ttl: Duration) -> WriteOutcome {
        match self.put(&self.full_key(key), &raw, ttl).await {
            Ok(()) => WriteOutcome::Written,
            Err(CallError::Open { .. }) => WriteOutcome::Skipped,
            Err(CallError::Failed(e)) => WriteOutcome::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use crate::store::MemoryStore;
    use crate::telemetry::MetricsCollector;
    use crate::ErrorContext;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Contact {
        phone: String,
        name: String,
    }

    fn contact() -> Contact {
        Contact {
            phone: "5511999990000".into(),
            name: "Ana".into(),
        }
    }

    /// Memory store whose reads or writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    fn down() -> Error {
        Error::store_with_context("connection reset", ErrorContext::new())
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(down());
            }
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(down());
            }
            self.inner.set(key, value, ttl).await
        }
        async fn del(&self, key: &str) -> Result<bool> {
            self.inner.del(key).await
        }
        async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
            self.inner.ttl(key).await
        }
        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn cache_over(store: Arc<FlakyStore>) -> (ResilientCache, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::store().with_failure_threshold(2),
        ));
        let cache = ResilientCache::new(store, breaker)
            .with_metrics(metrics.clone())
            .with_config(CacheConfig::new().with_key_prefix("contact"));
        (cache, metrics)
    }

    #[tokio::test]
    async fn test_hit_never_calls_fetch() {
        let store = Arc::new(FlakyStore::default());
        let (cache, metrics) = cache_over(store.clone());
        cache.set("phone:1", &contact()).await.unwrap();
        assert!(store.inner.get("contact:phone:1").await.unwrap().is_some());

        let fetched = cache
            .get_or_fetch("phone:1", || async { Err::<Contact, _>("must not be called") })
            .await
            .unwrap();
        assert!(fetched.from_cache());
        assert_eq!(fetched.value, contact());
        assert_eq!(fetched.write.outcome().await, WriteOutcome::Skipped);
        assert_eq!(metrics.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_miss_fetches_once_then_hits() {
        let store = Arc::new(FlakyStore::default());
        let (cache, metrics) = cache_over(store);
        let calls = AtomicU32::new(0);

        let first = cache
            .get_or_fetch("phone:2", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(contact())
            })
            .await
            .unwrap();
        assert_eq!(first.source, FetchSource::Origin);
        assert_eq!(first.write.outcome().await, WriteOutcome::Written);

        let second = cache
            .get_or_fetch("phone:2", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(contact())
            })
            .await
            .unwrap();
        assert!(second.from_cache());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = metrics.cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_fetch_error_propagates() {
        let (cache, _) = cache_over(Arc::new(FlakyStore::default()));
        let err = cache
            .get_or_fetch("phone:3", || async { Err::<Contact, _>("database unavailable") })
            .await
            .unwrap_err();
        assert_eq!(err, "database unavailable");
    }

    #[tokio::test]
    async fn test_open_breaker_degrades_to_miss() {
        let store = Arc::new(FlakyStore::default());
        let (cache, metrics) = cache_over(store.clone());
        store.fail_reads.store(true, Ordering::SeqCst);
        store.fail_writes.store(true, Ordering::SeqCst);

        // read failure + write failure reach the threshold of 2
        let fetched = cache
            .get_or_fetch("phone:4", || async { Ok::<_, String>(contact()) })
            .await
            .unwrap();
        assert_eq!(fetched.value, contact());
        assert!(matches!(fetched.write.outcome().await, WriteOutcome::Failed(_)));
        assert!(cache.breaker().state().state == crate::resilience::CircuitState::Open);

        store.fail_reads.store(false, Ordering::SeqCst);
        store.fail_writes.store(false, Ordering::SeqCst);
        let again = cache
            .get_or_fetch("phone:4", || async { Ok::<_, String>(contact()) })
            .await
            .unwrap();
        assert_eq!(again.source, FetchSource::Origin);
        assert_eq!(again.write.outcome().await, WriteOutcome::Skipped);
        assert_eq!(metrics.cache_stats().errors, 2);

        let err = cache.set("phone:4", &contact()).await.unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let store = Arc::new(FlakyStore::default());
        let (cache, metrics) = cache_over(store.clone());
        store.inner.set("contact:phone:5", "{not json", None).await.unwrap();
        assert_eq!(cache.get::<Contact>("phone:5").await, None);
        assert_eq!(metrics.cache_stats().errors, 1);
        assert_eq!(cache.breaker().state().failures, 0);
    }

    #[tokio::test]
    async fn test_delete_and_disabled_cache() {
        let store = Arc::new(FlakyStore::default());
        let (cache, metrics) = cache_over(store.clone());
        cache.set("phone:6", &contact()).await.unwrap();
        assert!(cache.delete("phone:6").await.unwrap());
        assert!(!cache.delete("phone:6").await.unwrap());
        assert_eq!(metrics.cache_stats().deletes, 2);

        let disabled = cache.with_config(CacheConfig::new().with_enabled(false));
        disabled.set("phone:7", &contact()).await.unwrap();
        assert_eq!(store.inner.get("phone:7").await.unwrap(), None);
        let fetched = disabled
            .get_or_fetch("phone:7", || async { Ok::<_, String>(contact()) })
            .await
            .unwrap();
        assert_eq!(fetched.write.outcome().await, WriteOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_ttl_applies_to_written_entries() {
        let store = Arc::new(FlakyStore::default());
        let (cache, _) = cache_over(store.clone());
        cache
            .set_with_ttl("phone:8", &contact(), Duration::from_secs(30))
            .await
            .unwrap();
        let ttl = store.inner.ttl("contact:phone:8").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(30) && ttl > Duration::from_secs(25));
    }
}
