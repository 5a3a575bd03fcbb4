//! Construction-time configuration: store address, breakers, limiters, cache.
//!
//! Loaded from YAML or JSON. `CoreConfig::default()` carries the built-in
//! presets, so an empty document is a valid configuration.
//!
//! ```yaml
//! store:
//!   url: redis://127.0.0.1:6379
//! breakers:
//!   - name: store
//!     threshold: 5
//!     timeout_ms: 60000
//! limiters:
//!   - name: auth
//!     limit: 5
//!     window: 15m
//!   - name: api
//!     limit: 100
//!     window: 60
//!     strategy: fixed
//! cache:
//!   default_ttl_secs: 60
//! ```

use crate::cache::CacheConfig;
use crate::resilience::{
    BreakerRegistry, CircuitBreakerConfig, LimiterStrategy, RateLimitConfig, RateLimitPreset,
    RateLimiters,
};
use crate::store::SortedSetStore;
use crate::utils::clock::Clock;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable overriding [`StoreConfig::url`].
pub const STORE_URL_ENV: &str = "REDIS_URL";

fn config_error(msg: impl Into<String>, field: impl Into<String>) -> Error {
    Error::configuration_with_context(
        msg,
        ErrorContext::new()
            .with_field_path(field)
            .with_source("config"),
    )
}

/// Parse a window such as `30s`, `15m`, `1h` or `1d`.
pub fn parse_window(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| config_error(format!("invalid window format: {:?}", raw), "window"))?;
    let seconds = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => {
            return Err(config_error(
                format!("invalid window unit {:?} in {:?} (expected s, m, h or d)", unit, raw),
                "window",
            ))
        }
    };
    let total = amount
        .checked_mul(seconds)
        .ok_or_else(|| config_error(format!("window {:?} is too long", raw), "window"))?;
    window_from_secs(total)
}

/// Windows are handled in epoch milliseconds, so the length must fit in them.
fn window_from_secs(secs: u64) -> Result<Duration> {
    match secs.checked_mul(1000) {
        Some(_) => Ok(Duration::from_secs(secs)),
        None => Err(config_error(format!("window of {}s is too long", secs), "window")),
    }
}

/// Window length as integer seconds or a unit string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowSpec {
    Seconds(u64),
    Text(String),
}

impl WindowSpec {
    pub fn duration(&self) -> Result<Duration> {
        match self {
            WindowSpec::Seconds(secs) => window_from_secs(*secs),
            WindowSpec::Text(raw) => parse_window(raw),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `None` selects the in-process store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn default_threshold() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_successes() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub name: String,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
}

impl BreakerSettings {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_name(self.name.clone())
            .with_failure_threshold(self.threshold)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_half_open_successes(self.half_open_successes)
    }
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(cfg: &CircuitBreakerConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            threshold: cfg.failure_threshold,
            timeout_ms: cfg.timeout.as_millis() as u64,
            half_open_successes: cfg.half_open_successes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    pub name: String,
    pub limit: u32,
    pub window: WindowSpec,
    /// Defaults to `ratelimit:<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default)]
    pub strategy: LimiterStrategy,
}

impl LimiterSettings {
    pub fn prefix(&self) -> String {
        self.prefix
            .clone()
            .unwrap_or_else(|| format!("ratelimit:{}", self.name))
    }

    pub fn to_config(&self) -> Result<RateLimitConfig> {
        Ok(RateLimitConfig::new(self.limit, self.window.duration()?).with_prefix(self.prefix()))
    }

    fn preset(preset: RateLimitPreset) -> Self {
        let cfg = preset.config();
        Self {
            name: preset.name().to_string(),
            limit: cfg.limit,
            window: WindowSpec::Seconds(cfg.window.as_secs()),
            prefix: Some(cfg.prefix),
            strategy: LimiterStrategy::Sliding,
        }
    }
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            key_prefix: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub store: StoreConfig,
    pub breakers: Vec<BreakerSettings>,
    pub limiters: Vec<LimiterSettings>,
    pub cache: CacheSettings,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            breakers: vec![
                BreakerSettings::from(&CircuitBreakerConfig::store()),
                BreakerSettings::from(&CircuitBreakerConfig::external_api()),
            ],
            limiters: RateLimitPreset::ALL
                .iter()
                .map(|p| LimiterSettings::preset(*p))
                .collect(),
            cache: CacheSettings::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read `path`; `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    /// [`from_file`](Self::from_file), environment overrides, then [`validate`](Self::validate).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            breakers = config.breakers.len(),
            limiters = config.limiters.len(),
            redis = config.store.url.is_some(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(STORE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.store.url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (i, b) in self.breakers.iter().enumerate() {
            let field = |f: &str| format!("breakers[{}].{}", i, f);
            if b.name.trim().is_empty() {
                return Err(config_error("breaker name is empty", field("name")));
            }
            if !names.insert(b.name.as_str()) {
                return Err(config_error(format!("duplicate breaker {:?}", b.name), field("name")));
            }
            if b.threshold == 0 {
                return Err(config_error("threshold must be at least 1", field("threshold")));
            }
            if b.timeout_ms == 0 {
                return Err(config_error("timeout_ms must be positive", field("timeout_ms")));
            }
            if b.half_open_successes == 0 {
                return Err(config_error(
                    "half_open_successes must be at least 1",
                    field("half_open_successes"),
                ));
            }
        }

        let mut names = HashSet::new();
        for (i, l) in self.limiters.iter().enumerate() {
            let field = |f: &str| format!("limiters[{}].{}", i, f);
            if l.name.trim().is_empty() {
                return Err(config_error("limiter name is empty", field("name")));
            }
            if !names.insert(l.name.as_str()) {
                return Err(config_error(format!("duplicate limiter {:?}", l.name), field("name")));
            }
            if l.limit == 0 {
                return Err(config_error("limit must be at least 1", field("limit")));
            }
            let window = l.window.duration().map_err(|e| match e {
                Error::Configuration { message, .. } => config_error(message, field("window")),
                other => other,
            })?;
            if window.is_zero() {
                return Err(config_error("window must be positive", field("window")));
            }
            if l.prefix().trim().is_empty() {
                return Err(config_error("prefix is empty", field("prefix")));
            }
        }

        if self.cache.default_ttl_secs == 0 {
            return Err(config_error("default_ttl_secs must be positive", "cache.default_ttl_secs"));
        }
        Ok(())
    }

    pub fn breaker_registry(&self) -> BreakerRegistry {
        BreakerRegistry::from_configs(self.breakers.iter().map(BreakerSettings::to_config))
    }

    /// Limiters over `store`, one per entry in `limiters`.
    pub fn rate_limiters<S>(&self, store: Arc<S>, clock: Arc<dyn Clock>) -> Result<RateLimiters>
    where
        S: SortedSetStore + 'static,
    {
        let specs = self
            .limiters
            .iter()
            .map(|l| Ok((l.name.clone(), l.to_config()?, l.strategy)))
            .collect::<Result<Vec<_>>>()?;
        Ok(RateLimiters::build(store, clock, specs))
    }

    pub fn cache_config(&self) -> CacheConfig {
        let mut cfg = CacheConfig::new()
            .with_ttl(Duration::from_secs(self.cache.default_ttl_secs))
            .with_enabled(self.cache.enabled);
        if let Some(prefix) = &self.cache.key_prefix {
            cfg = cfg.with_key_prefix(prefix.clone());
        }
        cfg
    }
}
