//! # realtime-resilience
//!
//! 这是消息控制台的弹性与实时分发层：熔断、重试、缓存回退、限流与跨进程事件分发。
//!
//! Resilience and real-time distribution layer for a multi-tenant messaging
//! console: circuit breaking with retry and backoff, a cache-aside read that
//! survives cache outages, sliding- and fixed-window rate limiting, and a
//! pub/sub event bus that fans domain events out to every process serving
//! Server-Sent Event streams.
//!
//! ## Core Philosophy
//!
//! - **Explicit services**: breakers, limiters, collectors and buses are values
//!   built at startup and passed by `Arc`, never globals
//! - **Narrow store surface**: everything runs over the traits in [`store`],
//!   in-process or against Redis (`redis-store` feature)
//! - **Stated failure policy**: limiters fail open, cache reads degrade to
//!   misses, event publishing never fails its caller
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use realtime_resilience::config::CoreConfig;
//! use realtime_resilience::events::{EventBus, MessageAuthor, MessageReceived};
//! use realtime_resilience::store::MemoryStore;
//! use realtime_resilience::utils::system_clock;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> realtime_resilience::Result<()> {
//!     realtime_resilience::telemetry::init_logging(None);
//!     let config = CoreConfig::default();
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let limiters = config.rate_limiters(store.clone(), system_clock())?;
//!     let messages = limiters.get("messages").expect("preset");
//!     if !messages.check("org-1:user-9").await.allowed {
//!         return Ok(());
//!     }
//!
//!     let bus = EventBus::new(store);
//!     bus.emit_message_received(&MessageReceived {
//!         session_id: "s1".into(),
//!         message_id: "m1".into(),
//!         content: "hello".into(),
//!         author: MessageAuthor::Agent,
//!         organization_id: "org-1".into(),
//!     })
//!     .await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Circuit breaker, retry with backoff, rate limiting |
//! | [`cache`] | Breaker-protected cache-aside reads with explicit write-behind |
//! | [`events`] | Pub/sub event bus and typed domain events |
//! | [`sse`] | SSE frame encoding and relay with heartbeats |
//! | [`store`] | Store traits, in-process store, Redis store |
//! | [`config`] | YAML/JSON configuration and registry builders |
//! | [`telemetry`] | Logging setup and cache metrics |

pub mod cache;
pub mod config;
pub mod events;
pub mod resilience;
pub mod sse;
pub mod store;
pub mod telemetry;
pub mod utils;

pub use cache::{get_cached_or_fetch, ResilientCache, WriteBehind, WriteOutcome};
pub use events::{Channel, EventBus, EventPayload, Subscription};
pub use resilience::{
    retry_with_backoff, CallError, CircuitBreaker, CircuitBreakerConfig, RateLimitDecision,
    RateLimiter, RetryPolicy,
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
