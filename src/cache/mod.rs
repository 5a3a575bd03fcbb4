//! 弹性缓存模块：熔断保护的缓存读取，失败时回退到数据源。
//!
//! # Resilient Caching Module
//!
//! Cache-aside reads where only the cache path is protected. A breaker sits
//! in front of the store so a struggling cache degrades to misses instead of
//! errors, while the source of truth is always called directly.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResilientCache`] | Typed JSON cache over a [`KeyValueStore`](crate::store::KeyValueStore) |
//! | [`CacheConfig`] | Default TTL, key prefix, on/off switch |
//! | [`get_cached_or_fetch`] | Closure-based cache-aside read |
//! | [`WriteBehind`] | Handle for the background write-through |
//!
//! ## Example
//!
//! ```rust
//! use realtime_resilience::cache::{CacheConfig, ResilientCache};
//! use realtime_resilience::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use realtime_resilience::store::MemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), String> {
//! let cache = ResilientCache::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(CircuitBreaker::new(CircuitBreakerConfig::store())),
//! )
//! .with_config(CacheConfig::new().with_ttl(Duration::from_secs(60)));
//!
//! let stats = cache
//!     .get_or_fetch("admin:dashboard:stats", || async { Ok::<_, String>(42u64) })
//!     .await?;
//! assert_eq!(stats.value, 42);
//! # Ok(())
//! # }
//! ```

mod fetch;
mod manager;
mod write_behind;

pub use fetch::{get_cached_or_fetch, FetchSource, Fetched};
pub use manager::{CacheConfig, ResilientCache};
pub use write_behind::{WriteBehind, WriteOutcome};
