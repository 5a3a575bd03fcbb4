//! 弹性模式模块：熔断器、指数退避重试与限流器。
//!
//! # Resilience Primitives Module
//!
//! Guards for calls into shared dependencies (the backing store, third-party
//! APIs) and admission control for inbound traffic.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Per-dependency failure tracker with closed / open / half-open states |
//! | [`retry`] | Stateless retry with exponential backoff and symmetric jitter |
//! | [`rate_limiter`] | Sliding-window and fixed-window limiters behind one front, failing open |
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use realtime_resilience::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new()
//!         .with_name("external-api")
//!         .with_failure_threshold(3)
//!         .with_timeout(Duration::from_secs(30)),
//! );
//! let answer = breaker
//!     .execute_with_fallback(
//!         || async { Err::<u32, &str>("gateway down") },
//!         || async { Ok(0) },
//!     )
//!     .await;
//! assert_eq!(answer, Ok(0));
//! # }
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust
//! use realtime_resilience::resilience::{RateLimitConfig, RateLimiter};
//! use realtime_resilience::store::MemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let store = Arc::new(MemoryStore::new());
//! let limiter = RateLimiter::sliding(
//!     RateLimitConfig::new(100, Duration::from_secs(60)).with_prefix("ratelimit:api"),
//!     store,
//! );
//! if limiter.check("203.0.113.7").await.allowed {
//!     // admit the request
//! }
//! # }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    BreakerRegistry, CallError, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot,
    CircuitState,
};
pub use rate_limiter::{
    FixedWindow, LimiterStrategy, RateLimitConfig, RateLimitDecision, RateLimitPreset,
    RateLimiter, RateLimiters, SlidingWindow, WindowStrategy,
};
pub use retry::{retry_with_backoff, RetryPolicy};
