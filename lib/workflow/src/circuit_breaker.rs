//! Circuit breakers for shared downstream dependencies.
//!
//! A breaker tracks failures of one named dependency across every caller in
//! the process. It opens after `failure_threshold` failures inside the
//! sliding window, rejects calls while open, and lets calls through again as
//! `half_open` once `timeout` has passed. While half-open a single failure
//! reopens it and `success_threshold` successes close it.
//!
//! Breaker state is per process. Workers in other processes keep their own.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::node::NodeError;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds and timings for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the breaker.
    pub failure_threshold: u32,
    /// Successes while half-open that close the breaker.
    pub success_threshold: u32,
    /// Time spent open before calls are let through again.
    pub timeout: Duration,
    /// Failures older than this are forgotten.
    pub window: Duration,
    /// Whether rate-limit failures count toward opening.
    pub count_rate_limits: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            window: Duration::from_secs(60),
            count_rate_limits: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Profile for AI providers: opens sooner, recovers slower.
    #[must_use]
    pub fn ai(self) -> Self {
        Self {
            failure_threshold: 3,
            timeout: Duration::from_secs(60),
            ..self
        }
    }

    /// Profile for HTTP services.
    #[must_use]
    pub fn http(self) -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            ..self
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Failures currently inside the window.
    pub failure_count: u32,
    /// Successes counted toward closing while half-open.
    pub success_count: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
}

/// Result of a breaker-guarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// The breaker is open; the call was not attempted.
    Open { name: String },
    /// The call ran and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { name } => {
                write!(f, "circuit breaker '{name}' is open, service unavailable")
            }
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for BreakerError<E> {}

impl From<BreakerError<NodeError>> for NodeError {
    fn from(err: BreakerError<NodeError>) -> Self {
        match err {
            BreakerError::Open { name } => NodeError::BreakerOpen { name },
            BreakerError::Inner(e) => e,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            half_open_successes: 0,
            probe_in_flight: false,
            opened_at: None,
            total_calls: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
    }
}

/// Failure gate for one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the stored state. An expired `open` only turns `half_open` when
    /// the next call is admitted.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Runs `operation` if the breaker admits it and records the outcome.
    ///
    /// While half-open only one call is in flight at a time; concurrent
    /// callers are rejected as if the breaker were open.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] without running `operation` while the
    /// breaker is open, or [`BreakerError::Inner`] with the operation's error.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let probe = ProbeGuard {
            breaker: self,
            armed: self.admit::<E>()?,
        };
        let result = operation().await;
        probe.disarm();

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure(&e.to_string());
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Returns whether the admitted call is the half-open probe.
    fn admit<E>(&self) -> Result<bool, BreakerError<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(Duration::MAX, |opened| opened.elapsed());
                if elapsed < self.config.timeout {
                    inner.total_rejections += 1;
                    return Err(BreakerError::Open {
                        name: self.name.clone(),
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                tracing::info!(breaker = %self.name, "circuit breaker half-open, probing");
            }
            CircuitState::HalfOpen if inner.probe_in_flight => {
                inner.total_rejections += 1;
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                });
            }
            CircuitState::HalfOpen | CircuitState::Closed => {}
        }
        inner.total_calls += 1;
        let probing = inner.state == CircuitState::HalfOpen;
        inner.probe_in_flight = probing;
        Ok(probing)
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
        inner.total_successes += 1;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.half_open_successes = 0;
                tracing::info!(breaker = %self.name, "circuit breaker closed");
            }
        }
    }

    /// Records a failed call with its error text.
    pub fn record_failure(&self, message: &str) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.probe_in_flight = false;
        inner.total_failures += 1;

        if !self.config.count_rate_limits && is_rate_limit(message) {
            tracing::debug!(breaker = %self.name, "rate limit not counted toward breaker");
            return;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.open(now);
                tracing::warn!(breaker = %self.name, "circuit breaker reopened");
            }
            CircuitState::Closed => {
                inner.failures.push_back(now);
                inner.prune(now, self.config.window);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    inner.open(now);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failures.len(),
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Returns the breaker to `closed` and clears its window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.half_open_successes = 0;
        inner.probe_in_flight = false;
    }

    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.lock();
        inner.prune(Instant::now(), self.config.window);
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: u32::try_from(inner.failures.len()).unwrap_or(u32::MAX),
            success_count: inner.half_open_successes,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_rejections: inner.total_rejections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // A panic while holding the lock leaves counters intact, so poisoning is ignored.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the half-open slot if a probe call is dropped before it finishes.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

fn is_rate_limit(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("429") || lowered.contains("rate limit")
}

/// Process-wide set of named breakers.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Creates a registry whose breakers start from `defaults`.
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker named `name`, creating it with `config` if needed.
    ///
    /// The config of an existing breaker is left unchanged.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Returns the breaker named `name` with the registry defaults.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.defaults)
    }

    /// Shared breaker for AI providers.
    pub fn ai(&self) -> Arc<CircuitBreaker> {
        self.get_or_create("ai", self.defaults.ai())
    }

    /// Breaker for one HTTP service.
    pub fn http(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(&format!("http:{name}"), self.defaults.http())
    }

    /// Snapshot of every breaker, sorted by name.
    #[must_use]
    pub fn stats(&self) -> Vec<BreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<BreakerStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Closes every breaker.
    pub fn reset_all(&self) {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            window: Duration::from_secs(60),
            count_rate_limits: true,
        }
    }

    async fn fail(breaker: &CircuitBreaker, message: &str) -> BreakerError<String> {
        breaker
            .call(|| async { Err::<(), _>(message.to_string()) })
            .await
            .expect_err("should fail")
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        breaker.call(|| async { Ok::<_, String>(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let breaker = CircuitBreaker::new("api", config());
        for _ in 0..3 {
            fail(&breaker, "503").await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert_eq!(
            result,
            Err(BreakerError::Open {
                name: "api".to_string()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let stats = breaker.stats();
        assert_eq!(stats.total_rejections, 1);
        assert_eq!(stats.total_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("api", config());
        for _ in 0..3 {
            fail(&breaker, "503").await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        fail(&breaker, "still down").await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // The reopen restarts the timeout.
        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::Open { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_successes_close() {
        let breaker = CircuitBreaker::new("api", config());
        for _ in 0..3 {
            fail(&breaker, "503").await;
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(succeed(&breaker).await, Ok(7));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&breaker).await, Ok(7));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_call_at_a_time() {
        let breaker = CircuitBreaker::new("api", config());
        for _ in 0..3 {
            fail(&breaker, "503").await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let slow = breaker.call(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, String>(1)
        });
        let (first, second) = tokio::join!(slow, succeed(&breaker));

        assert_eq!(first, Ok(1));
        assert!(matches!(second, Err(BreakerError::Open { .. })));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.stats().total_rejections, 1);

        // The slot is free again once the first call finished.
        assert_eq!(succeed(&breaker).await, Ok(7));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_frees_the_half_open_slot() {
        let breaker = CircuitBreaker::new("api", config());
        for _ in 0..3 {
            fail(&breaker, "503").await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let hung = breaker.call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(0)
        });
        assert!(
            tokio::time::timeout(Duration::from_secs(1), hung)
                .await
                .is_err()
        );

        assert_eq!(succeed(&breaker).await, Ok(7));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_leave_the_window() {
        let breaker = CircuitBreaker::new("api", config());
        fail(&breaker, "503").await;
        fail(&breaker, "503").await;

        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&breaker, "503").await;

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_can_be_excluded() {
        let breaker = CircuitBreaker::new(
            "api",
            CircuitBreakerConfig {
                count_rate_limits: false,
                ..config()
            },
        );
        for _ in 0..5 {
            fail(&breaker, "HTTP 429 Too Many Requests").await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 5);
        assert_eq!(stats.total_failures, 5);
        assert_eq!(stats.failure_count, 0);
    }

    #[test]
    fn open_rejection_becomes_node_error() {
        let err: NodeError = BreakerError::<NodeError>::Open {
            name: "openai".to_string(),
        }
        .into();
        assert_eq!(
            err,
            NodeError::BreakerOpen {
                name: "openai".to_string()
            }
        );
    }

    #[test]
    fn registry_shares_breakers_by_name() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.http("sheets");
        let b = registry.http("sheets");
        assert!(Arc::ptr_eq(&a, &b));

        let ai = registry.ai();
        assert_eq!(ai.config().failure_threshold, 3);
        assert_eq!(ai.config().timeout, Duration::from_secs(60));

        let names: Vec<String> = registry.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["ai".to_string(), "http:sheets".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_all_closes_breakers() {
        let registry = BreakerRegistry::new(config());
        let breaker = registry.get("db");
        for _ in 0..3 {
            fail(&breaker, "connection reset").await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        registry.reset_all();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
