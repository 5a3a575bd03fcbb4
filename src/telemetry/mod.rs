//! 遥测模块：日志初始化与缓存操作指标收集。
//!
//! Telemetry Module.
//!
//! Logging goes through `tracing`; [`init_logging`] installs a formatting
//! subscriber for binaries and tests that want output. Cache metrics are
//! collected through the [`CacheMetrics`] hook trait, which the resilient
//! cache calls on every operation.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheMetrics`] | Hook trait invoked by the cache |
//! | [`MetricsCollector`] | In-memory counters plus a bounded ring of recent operations |
//! | [`NoopMetrics`] | Collector that records nothing |

use crate::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber.
///
/// `filter` uses `EnvFilter` syntax; without one, `RUST_LOG` is read and
/// `info` is the last resort. Calling this again once a subscriber is set
/// does nothing.
pub fn init_logging(filter: Option<&str>) {
    let env_filter = match filter {
        Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOperation {
    Get,
    Set,
    Delete,
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheOperation::Get => "get",
            CacheOperation::Set => "set",
            CacheOperation::Delete => "delete",
        })
    }
}

/// One recorded cache operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreMetric {
    pub operation: CacheOperation,
    pub key: String,
    pub hit: bool,
    pub duration: Duration,
    pub recorded_at: SystemTime,
}

/// Hooks invoked by the cache. Callers ignore the returned error.
pub trait CacheMetrics: Send + Sync {
    fn record_cache_operation(
        &self,
        operation: CacheOperation,
        key: &str,
        hit: bool,
        duration: Duration,
    ) -> Result<()>;

    fn record_cache_error(&self, operation: CacheOperation, key: &str, error: &str) -> Result<()>;
}

/// Collector that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl CacheMetrics for NoopMetrics {
    fn record_cache_operation(&self, _: CacheOperation, _: &str, _: bool, _: Duration) -> Result<()> {
        Ok(())
    }

    fn record_cache_error(&self, _: CacheOperation, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
}

/// Aggregate view returned by [`MetricsCollector::cache_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    /// Hits over gets, `0.0` before the first get.
    pub hit_rate: f64,
    /// Most recent operations, oldest first.
    pub recent: Vec<StoreMetric>,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    errors: u64,
    ring: VecDeque<StoreMetric>,
}

/// In-memory metrics collector.
pub struct MetricsCollector {
    inner: Mutex<Counters>,
    max_metrics: usize,
}

impl MetricsCollector {
    pub const DEFAULT_CAPACITY: usize = 1000;
    const RECENT: usize = 10;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(max_metrics: usize) -> Self {
        Self {
            inner: Mutex::new(Counters::default()),
            max_metrics: max_metrics.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn cache_stats(&self) -> CacheStats {
        let c = self.lock();
        let gets = c.hits + c.misses;
        let hit_rate = if gets == 0 {
            0.0
        } else {
            c.hits as f64 / gets as f64
        };
        let skip = c.ring.len().saturating_sub(Self::RECENT);
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            sets: c.sets,
            deletes: c.deletes,
            errors: c.errors,
            hit_rate,
            recent: c.ring.iter().skip(skip).cloned().collect(),
        }
    }

    /// Number of operations held in the ring.
    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        *self.lock() = Counters::default();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics for MetricsCollector {
    fn record_cache_operation(
        &self,
        operation: CacheOperation,
        key: &str,
        hit: bool,
        duration: Duration,
    ) -> Result<()> {
        let mut c = self.lock();
        match operation {
            CacheOperation::Get if hit => c.hits += 1,
            CacheOperation::Get => c.misses += 1,
            CacheOperation::Set => c.sets += 1,
            CacheOperation::Delete => c.deletes += 1,
        }
        if c.ring.len() >= self.max_metrics {
            c.ring.pop_front();
        }
        c.ring.push_back(StoreMetric {
            operation,
            key: key.to_string(),
            hit,
            duration,
            recorded_at: SystemTime::now(),
        });
        Ok(())
    }

    fn record_cache_error(&self, operation: CacheOperation, key: &str, error: &str) -> Result<()> {
        self.lock().errors += 1;
        tracing::error!(operation = %operation, key, error, "cache error");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_and_counters() {
        let m = MetricsCollector::new();
        assert_eq!(m.cache_stats().hit_rate, 0.0);

        m.record_cache_operation(CacheOperation::Get, "a", true, Duration::from_millis(1)).unwrap();
        m.record_cache_operation(CacheOperation::Get, "a", true, Duration::from_millis(1)).unwrap();
        m.record_cache_operation(CacheOperation::Get, "b", false, Duration::from_millis(2)).unwrap();
        m.record_cache_operation(CacheOperation::Get, "c", false, Duration::from_millis(2)).unwrap();
        m.record_cache_operation(CacheOperation::Set, "b", false, Duration::ZERO).unwrap();
        m.record_cache_operation(CacheOperation::Delete, "a", false, Duration::ZERO).unwrap();
        m.record_cache_error(CacheOperation::Set, "b", "timeout").unwrap();

        let stats = m.cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.sets, stats.deletes, stats.errors), (2, 2, 1, 1, 1));
        assert_eq!(stats.hit_rate, 0.5);
        assert_eq!(stats.recent.len(), 6);
        assert_eq!(stats.recent.last().unwrap().operation, CacheOperation::Delete);
    }

    #[test]
    fn test_ring_is_bounded_and_recent_is_last_ten() {
        let m = MetricsCollector::with_capacity(15);
        for i in 0..40 {
            m.record_cache_operation(CacheOperation::Set, &format!("k{}", i), false, Duration::ZERO)
                .unwrap();
        }
        assert_eq!(m.len(), 15);
        let recent = m.cache_stats().recent;
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].key, "k30");
        assert_eq!(recent[9].key, "k39");
        assert_eq!(m.cache_stats().sets, 40);
    }

    #[test]
    fn test_reset_clears_everything() {
        let m = MetricsCollector::new();
        m.record_cache_operation(CacheOperation::Get, "a", true, Duration::ZERO).unwrap();
        m.reset();
        assert!(m.is_empty());
        assert_eq!(m.cache_stats().hits, 0);
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(Some("realtime_resilience=debug"));
        init_logging(None);
    }
}
