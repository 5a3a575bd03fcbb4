use crate::store::{KeyValueStore, SortedSetPipeline, SortedSetStore};
use crate::utils::clock::{system_clock, Clock};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window: Duration,
    /// Key namespace; the backing key is `{prefix}:{identifier}`.
    pub prefix: String,
}

impl RateLimitConfig {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            prefix: "ratelimit".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn key_for(&self, identifier: &str) -> String {
        format!("{}:{}", self.prefix, identifier)
    }

    fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// Window length in whole seconds for key expiry, rounded up.
    fn window_secs(&self) -> u64 {
        let ms = self.window_ms();
        ((ms + 999) / 1000).max(1)
    }
}

/// Traffic classes with their own quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPreset {
    /// Login / registration attempts: 5 per 15 minutes.
    Auth,
    /// General API calls: 100 per minute.
    Api,
    /// Outbound message sends: 30 per minute.
    Messages,
    /// Inbound webhook deliveries: 1000 per minute.
    Webhooks,
    /// Sends within one chat session: 20 per minute.
    Session,
}

impl RateLimitPreset {
    pub const ALL: [RateLimitPreset; 5] = [
        RateLimitPreset::Auth,
        RateLimitPreset::Api,
        RateLimitPreset::Messages,
        RateLimitPreset::Webhooks,
        RateLimitPreset::Session,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RateLimitPreset::Auth => "auth",
            RateLimitPreset::Api => "api",
            RateLimitPreset::Messages => "messages",
            RateLimitPreset::Webhooks => "webhooks",
            RateLimitPreset::Session => "session",
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        let (limit, secs) = match self {
            RateLimitPreset::Auth => (5, 900),
            RateLimitPreset::Api => (100, 60),
            RateLimitPreset::Messages => (30, 60),
            RateLimitPreset::Webhooks => (1000, 60),
            RateLimitPreset::Session => (20, 60),
        };
        RateLimitConfig::new(limit, Duration::from_secs(secs))
            .with_prefix(format!("ratelimit:{}", self.name()))
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    /// When the current window ends, epoch milliseconds.
    pub reset_at_ms: u64,
    /// Set only on rejection.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn allow(limit: u32, remaining: u32, reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            reset_at_ms,
            retry_after: None,
        }
    }

    fn reject(limit: u32, reset_at_ms: u64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            reset_at_ms,
            retry_after: Some(retry_after),
        }
    }

    /// Full quota; what a check reports when the store cannot be reached.
    fn unrestricted(cfg: &RateLimitConfig, now_ms: u64) -> Self {
        Self::allow(cfg.limit, cfg.limit, now_ms + cfg.window_ms())
    }
}

/// A windowing algorithm over some backing store.
#[async_trait]
pub trait WindowStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Count this request and decide.
    async fn check(&self, key: &str, cfg: &RateLimitConfig, now_ms: u64) -> Result<RateLimitDecision>;
    /// Report the current state without consuming quota.
    async fn status(&self, key: &str, cfg: &RateLimitConfig, now_ms: u64) -> Result<RateLimitDecision>;
    async fn reset(&self, key: &str) -> Result<()>;
}

/// Sliding window over a sorted set of request timestamps.
///
/// The current request is recorded even when it is rejected, so a client that
/// keeps hammering keeps its own window full.
pub struct SlidingWindow {
    store: Arc<dyn SortedSetStore>,
    seq: AtomicU64,
}

impl SlidingWindow {
    pub fn new(store: Arc<dyn SortedSetStore>) -> Self {
        Self {
            store,
            seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl WindowStrategy for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding"
    }

    async fn check(&self, key: &str, cfg: &RateLimitConfig, now_ms: u64) -> Result<RateLimitDecision> {
        let window_start = now_ms.saturating_sub(cfg.window_ms());
        // Members must be unique or same-millisecond requests collapse into one.
        let member = format!("{}-{}", now_ms, self.seq.fetch_add(1, Ordering::Relaxed));
        let pipeline = SortedSetPipeline::new(key)
            .zremrangebyscore(0, window_start)
            .zcard()
            .zadd(now_ms, member)
            .expire(cfg.window_secs());
        let replies = self.store.exec_sorted(&pipeline).await?;
        let count = replies.get(1).copied().unwrap_or(0).max(0) as u64;

        let reset_at = now_ms + cfg.window_ms();
        if count >= cfg.limit as u64 {
            return Ok(RateLimitDecision::reject(cfg.limit, reset_at, cfg.window));
        }
        let remaining = (cfg.limit as u64 - count - 1) as u32;
        Ok(RateLimitDecision::allow(cfg.limit, remaining, reset_at))
    }

    async fn status(&self, key: &str, cfg: &RateLimitConfig, now_ms: u64) -> Result<RateLimitDecision> {
        let window_start = now_ms.saturating_sub(cfg.window_ms());
        let pipeline = SortedSetPipeline::new(key)
            .zremrangebyscore(0, window_start)
            .zcard();
        let replies = self.store.exec_sorted(&pipeline).await?;
        let count = replies.get(1).copied().unwrap_or(0).max(0) as u64;
        let remaining = (cfg.limit as u64).saturating_sub(count) as u32;
        Ok(RateLimitDecision {
            allowed: remaining > 0,
            remaining,
            limit: cfg.limit,
            reset_at_ms: now_ms + cfg.window_ms(),
            retry_after: None,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.store.del(key).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WindowEntry {
    count: u32,
    reset_at: u64,
}

/// Fixed window counter stored as `{count, reset_at}` in a key-value store.
///
/// Check-and-increment is serialized inside this process only; two processes
/// sharing a store can both admit the last slot of a window.
pub struct FixedWindow {
    store: Arc<dyn KeyValueStore>,
    guard: tokio::sync::Mutex<()>,
}

impl FixedWindow {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            guard: tokio::sync::Mutex::new(()),
        }
    }

    async fn active_entry(&self, key: &str, now_ms: u64) -> Result<Option<WindowEntry>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<WindowEntry>(&raw) {
            Ok(entry) if entry.reset_at >= now_ms => Ok(Some(entry)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding unreadable rate limit entry");
                Ok(None)
            }
        }
    }

    async fn write(&self, key: &str, entry: WindowEntry, now_ms: u64) -> Result<()> {
        let ttl = Duration::from_millis(entry.reset_at.saturating_sub(now_ms));
        let raw = serde_json::to_string(&entry)?;
        self.store.set(key, &raw, Some(ttl)).await
    }
}

#[async_trait]
impl WindowStrategy for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn check(&self, key: &str, cfg: &RateLimitConfig, now_ms: u64) -> Result<RateLimitDecision> {
        let _serialized = self.guard.lock().await;
        match self.active_entry(key, now_ms).await? {
            Some(entry) if entry.count >= cfg.limit => Ok(RateLimitDecision::reject(
                cfg.limit,
                entry.reset_at,
                Duration::from_millis(entry.reset_at.saturating_sub(now_ms)),
            )),
            Some(mut entry) => {
                entry.count += 1;
                self.write(key, entry, now_ms).await?;
                Ok(RateLimitDecision::allow(
                    cfg.limit,
                    cfg.limit - entry.count,
                    entry.reset_at,
                ))
            }
            None => {
                let entry = WindowEntry {
                    count: 1,
                    reset_at: now_ms + cfg.window_ms(),
                };
                self.write(key, entry, now_ms).await?;
                Ok(RateLimitDecision::allow(
                    cfg.limit,
                    cfg.limit.saturating_sub(1),
                    entry.reset_at,
                ))
            }
        }
    }

    async fn status(&self, key: &str, cfg: &RateLimitConfig, now_ms: u64) -> Result<RateLimitDecision> {
        Ok(match self.active_entry(key, now_ms).await? {
            Some(entry) => {
                let remaining = cfg.limit.saturating_sub(entry.count);
                RateLimitDecision {
                    allowed: remaining > 0,
                    remaining,
                    limit: cfg.limit,
                    reset_at_ms: entry.reset_at,
                    retry_after: None,
                }
            }
            None => RateLimitDecision::unrestricted(cfg, now_ms),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let _serialized = self.guard.lock().await;
        self.store.del(key).await?;
        Ok(())
    }
}

/// Which windowing algorithm a limiter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterStrategy {
    #[default]
    Sliding,
    Fixed,
}

/// Rate limiter front: one config, one strategy, fail-open on store errors.
pub struct RateLimiter {
    config: RateLimitConfig,
    strategy: Arc<dyn WindowStrategy>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, strategy: Arc<dyn WindowStrategy>) -> Self {
        Self {
            config,
            strategy,
            clock: system_clock(),
        }
    }

    pub fn sliding(config: RateLimitConfig, store: Arc<dyn SortedSetStore>) -> Self {
        Self::new(config, Arc::new(SlidingWindow::new(store)))
    }

    pub fn fixed(config: RateLimitConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(config, Arc::new(FixedWindow::new(store)))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Count one request for `identifier` and decide whether it is admitted.
    ///
    /// Never fails: if the backing store errors the request is allowed.
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        let key = self.config.key_for(identifier);
        let now = self.clock.now_ms();
        match self.strategy.check(&key, &self.config, now).await {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::debug!(limiter = %self.config.prefix, key = %key, "rate limit exceeded");
                }
                decision
            }
            Err(e) => {
                tracing::warn!(
                    limiter = %self.config.prefix,
                    strategy = self.strategy.name(),
                    error = %e,
                    "rate limit store failed, allowing request"
                );
                RateLimitDecision::unrestricted(&self.config, now)
            }
        }
    }

    /// Current state for `identifier` without counting a request.
    pub async fn status(&self, identifier: &str) -> RateLimitDecision {
        let key = self.config.key_for(identifier);
        let now = self.clock.now_ms();
        match self.strategy.status(&key, &self.config, now).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(limiter = %self.config.prefix, error = %e, "rate limit status unavailable");
                RateLimitDecision::unrestricted(&self.config, now)
            }
        }
    }

    /// Drop the backing entry for `identifier` (admin unblock, test teardown).
    pub async fn reset(&self, identifier: &str) -> Result<()> {
        self.strategy.reset(&self.config.key_for(identifier)).await
    }
}

/// Named limiters sharing one store.
pub struct RateLimiters {
    limiters: BTreeMap<String, Arc<RateLimiter>>,
}

impl RateLimiters {
    /// Build limiters from `(name, config, strategy)` triples over `store`.
    pub fn build<S>(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        specs: impl IntoIterator<Item = (String, RateLimitConfig, LimiterStrategy)>,
    ) -> Self
    where
        S: SortedSetStore + 'static,
    {
        let mut limiters = BTreeMap::new();
        for (name, config, strategy) in specs {
            let limiter = match strategy {
                LimiterStrategy::Sliding => {
                    RateLimiter::sliding(config, store.clone() as Arc<dyn SortedSetStore>)
                }
                LimiterStrategy::Fixed => {
                    RateLimiter::fixed(config, store.clone() as Arc<dyn KeyValueStore>)
                }
            };
            limiters.insert(name, Arc::new(limiter.with_clock(Arc::clone(&clock))));
        }
        Self { limiters }
    }

    /// The five preset limiters, all using `strategy`.
    pub fn presets<S>(store: Arc<S>, strategy: LimiterStrategy) -> Self
    where
        S: SortedSetStore + 'static,
    {
        Self::build(
            store,
            system_clock(),
            RateLimitPreset::ALL
                .iter()
                .map(|p| (p.name().to_string(), p.config(), strategy)),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).cloned()
    }

    pub fn preset(&self, preset: RateLimitPreset) -> Option<Arc<RateLimiter>> {
        self.get(preset.name())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(|k| k.as_str())
    }
}
