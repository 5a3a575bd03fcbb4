//! Closure-based cache-aside read.

use super::write_behind::{WriteBehind, WriteOutcome};
use crate::resilience::{CallError, CircuitBreaker};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

/// Where a value returned by a cache-aside read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Origin,
}

/// Value returned by a cache-aside read together with its write-through.
#[derive(Debug)]
pub struct Fetched<T> {
    pub value: T,
    pub source: FetchSource,
    /// [`WriteOutcome::Skipped`] for cache hits.
    pub write: WriteBehind,
}

impl<T> Fetched<T> {
    pub fn from_cache(&self) -> bool {
        self.source == FetchSource::Cache
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Cache-aside read over caller-supplied cache closures.
///
/// `cache_get` runs behind `breaker` when one is given; an open circuit or a
/// read error counts as a miss. On a miss `fetch` runs unguarded and its error
/// is returned unchanged. A fetched value is handed to `cache_put` in the
/// background, through the breaker; the returned [`WriteBehind`] reports how
/// that went.
pub async fn get_cached_or_fetch<T, CE, G, GFut, P, PFut, PE, F, FFut, E>(
    cache_get: G,
    cache_put: P,
    fetch: F,
    breaker: Option<Arc<CircuitBreaker>>,
) -> Result<Fetched<T>, E>
where
    T: Clone + Send + 'static,
    CE: Display,
    G: FnOnce() -> GFut,
    GFut: Future<Output = Result<Option<T>, CE>>,
    P: FnOnce(T) -> PFut + Send + 'static,
    PFut: Future<Output = Result<(), PE>> + Send + 'static,
    PE: Display + Send + 'static,
    F: FnOnce() -> FFut,
    FFut: Future<Output = Result<T, E>>,
{
    let cached = match &breaker {
        Some(breaker) => match breaker.execute(cache_get).await {
            Ok(value) => value,
            Err(CallError::Open { .. }) => None,
            Err(CallError::Failed(e)) => {
                tracing::warn!(breaker = %breaker.name(), error = %e, "cache read failed, fetching from source");
                None
            }
        },
        None => cache_get().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cache read failed, fetching from source");
            None
        }),
    };
    if let Some(value) = cached {
        return Ok(Fetched {
            value,
            source: FetchSource::Cache,
            write: WriteBehind::skipped(),
        });
    }

    let value = fetch().await?;
    let copy = value.clone();
    let write = WriteBehind::spawn(async move {
        let result = match &breaker {
            Some(breaker) => breaker.execute(|| cache_put(copy)).await,
            None => cache_put(copy).await.map_err(CallError::Failed),
        };
        match result {
            Ok(()) => WriteOutcome::Written,
            Err(CallError::Open { name }) => {
                tracing::debug!(breaker = %name, "circuit open, cache write skipped");
                WriteOutcome::Skipped
            }
            Err(CallError::Failed(e)) => {
                tracing::warn!(error = %e, "cache write failed");
                WriteOutcome::Failed(e.to_string())
            }
        }
    });
    Ok(Fetched {
        value,
        source: FetchSource::Origin,
        write,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    type Shared = Arc<Mutex<HashMap<String, String>>>;

    async fn read(map: &Shared, key: &str) -> Result<Option<String>, String> {
        Ok(map.lock().unwrap().get(key).cloned())
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let map: Shared = Arc::default();
        let fetches = Arc::new(AtomicU32::new(0));

        for expected in [FetchSource::Origin, FetchSource::Cache] {
            let put_map = Arc::clone(&map);
            let fetches = Arc::clone(&fetches);
            let fetched = get_cached_or_fetch(
                || read(&map, "profile"),
                move |v: String| async move {
                    put_map.lock().unwrap().insert("profile".into(), v);
                    Ok::<(), String>(())
                },
                || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("alice".to_string())
                },
                None,
            )
            .await
            .unwrap();
            assert_eq!(fetched.source, expected);
            assert_eq!(fetched.value, "alice");
            fetched.write.outcome().await;
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_propagates_unchanged() {
        let err = get_cached_or_fetch(
            || async { Ok::<Option<u32>, String>(None) },
            |_| async { Ok::<(), String>(()) },
            || async { Err::<u32, _>("db down") },
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err, "db down");
    }

    #[tokio::test]
    async fn test_read_error_is_a_miss_and_failed_put_is_reported() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::store()));
        let fetched = get_cached_or_fetch(
            || async { Err::<Option<u32>, _>("ECONNRESET") },
            |_| async { Err::<(), _>("READONLY") },
            || async { Ok::<_, String>(7) },
            Some(Arc::clone(&breaker)),
        )
        .await
        .unwrap();
        assert_eq!(fetched.value, 7);
        assert_eq!(fetched.write.outcome().await, WriteOutcome::Failed("READONLY".into()));
        assert_eq!(breaker.state().failures, 2);
    }
}
