use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Read-only view of a breaker, as returned by [`CircuitBreaker::state`].
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub timeout: Duration,
    /// Consecutive half-open successes required to close again.
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_successes: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open-state timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_half_open_successes(mut self, successes: u32) -> Self {
        self.half_open_successes = successes.max(1);
        self
    }

    /// Breaker guarding the shared cache / pub-sub store.
    pub fn store() -> Self {
        Self::new()
            .with_name("store")
            .with_failure_threshold(5)
            .with_timeout(Duration::from_secs(60))
    }

    /// Breaker guarding third-party HTTP APIs.
    pub fn external_api() -> Self {
        Self::new()
            .with_name("external-api")
            .with_failure_threshold(3)
            .with_timeout(Duration::from_secs(30))
    }
}

/// Error returned by [`CircuitBreaker::execute`] when no fallback is supplied.
#[derive(Debug)]
pub enum CallError<E> {
    /// The circuit was open; the operation was not invoked.
    Open { name: String },
    /// The operation ran and failed with its own error.
    Failed(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Failed(e) => Some(e),
            CallError::Open { .. } => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Open { name } => write!(f, "Circuit breaker is open for {}", name),
            CallError::Failed(e) => e.fmt(f),
        }
    }
}

impl<E> std::error::Error for CallError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Failed(e) => Some(e),
            CallError::Open { .. } => None,
        }
    }
}

impl From<CallError<crate::Error>> for crate::Error {
    fn from(err: CallError<crate::Error>) -> Self {
        match err {
            CallError::Open { name } => crate::Error::CircuitOpen { name },
            CallError::Failed(e) => e,
        }
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    last_failure_wall: Option<SystemTime>,
    half_open_successes: u32,
}

/// Per-dependency circuit breaker.
///
/// - Opens after `failure_threshold` consecutive failures
/// - Short-circuits while open until `timeout` has passed since the last failure
/// - Probes in half-open; one failure reopens, `half_open_successes` successes close
///
/// State is process-local. The decision to call is time-gated, the call itself is not.
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                last_failure_wall: None,
                half_open_successes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Decide whether the operation may run, moving open -> half-open once the timeout has passed.
    fn admit(&self) -> bool {
        let mut st = self.lock();
        if st.state != CircuitState::Open {
            return true;
        }
        let cooled = st
            .last_failure_at
            .map(|at| at.elapsed() >= self.cfg.timeout)
            .unwrap_or(true);
        if cooled {
            st.state = CircuitState::HalfOpen;
            st.half_open_successes = 0;
            tracing::info!(breaker = %self.cfg.name, "circuit transitioning to half-open");
        }
        cooled
    }

    fn on_success(&self) {
        let mut st = self.lock();
        match st.state {
            CircuitState::HalfOpen => {
                st.half_open_successes += 1;
                if st.half_open_successes >= self.cfg.half_open_successes {
                    st.state = CircuitState::Closed;
                    st.failure_count = 0;
                    st.half_open_successes = 0;
                    tracing::info!(breaker = %self.cfg.name, "circuit closed after recovery");
                }
            }
            CircuitState::Closed => st.failure_count = 0,
            // A call admitted before the circuit opened finished late; it does not vote.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut st = self.lock();
        st.failure_count = st.failure_count.saturating_add(1);
        st.last_failure_at = Some(Instant::now());
        st.last_failure_wall = Some(SystemTime::now());
        match st.state {
            CircuitState::HalfOpen => {
                st.state = CircuitState::Open;
                tracing::warn!(breaker = %self.cfg.name, "circuit opened (half-open probe failed)");
            }
            CircuitState::Closed if st.failure_count >= self.cfg.failure_threshold => {
                st.state = CircuitState::Open;
                tracing::warn!(
                    breaker = %self.cfg.name,
                    threshold = self.cfg.failure_threshold,
                    "circuit opened (failure threshold reached)"
                );
            }
            _ => {}
        }
    }

    /// Run `operation` under the breaker. While open, the operation is not
    /// invoked and [`CallError::Open`] is returned.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            tracing::debug!(breaker = %self.cfg.name, "circuit is open, rejecting call");
            return Err(CallError::Open {
                name: self.cfg.name.clone(),
            });
        }
        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(CallError::Failed(e))
            }
        }
    }

    /// Run `operation` under the breaker, answering with `fallback` when the
    /// circuit is open or the operation fails. Failures still count.
    pub async fn execute_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            tracing::warn!(breaker = %self.cfg.name, "circuit is open, using fallback");
            return fallback().await;
        }
        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(_) => {
                self.on_failure();
                tracing::warn!(breaker = %self.cfg.name, "operation failed, using fallback");
                fallback().await
            }
        }
    }

    pub fn state(&self) -> CircuitSnapshot {
        let st = self.lock();
        CircuitSnapshot {
            name: self.cfg.name.clone(),
            state: st.state,
            failures: st.failure_count,
            last_failure: st.last_failure_wall,
        }
    }

    /// Administrative override: force the circuit closed and clear counters.
    pub fn reset(&self) {
        let mut st = self.lock();
        st.state = CircuitState::Closed;
        st.failure_count = 0;
        st.half_open_successes = 0;
        tracing::info!(breaker = %self.cfg.name, "circuit manually reset");
    }
}

/// Named breakers created once at startup and shared by reference.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `store` and `external-api` breakers.
    pub fn with_presets() -> Self {
        Self::from_configs([
            CircuitBreakerConfig::store(),
            CircuitBreakerConfig::external_api(),
        ])
    }

    pub fn from_configs(configs: impl IntoIterator<Item = CircuitBreakerConfig>) -> Self {
        let registry = Self::new();
        for cfg in configs {
            registry.insert(cfg);
        }
        registry
    }

    fn map(&self) -> MutexGuard<'_, BTreeMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a breaker, replacing any existing one with the same name.
    pub fn insert(&self, cfg: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(cfg));
        self.map()
            .insert(breaker.name().to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.map().get(name).cloned()
    }

    /// Existing breaker for `cfg.name`, or a new one built from `cfg`.
    pub fn get_or_insert(&self, cfg: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = self.map();
        Arc::clone(
            map.entry(cfg.name.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(cfg))),
        )
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.map().values().map(|b| b.state()).collect()
    }
}
