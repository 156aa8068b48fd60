//! Per-stage circuit breakers.
//!
//! A breaker counts consecutive failures of one stage name across every task
//! that uses it. After `failure_threshold` failures it opens and rejects calls
//! until `recovery_timeout` has passed; then it lets trial calls through
//! (half-open) and closes again after `success_threshold` successes.

use crate::errors::StageError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Breaker mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls are rejected.
    Open,
    /// Trial calls pass through to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    2
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds to stay open before probing.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Half-open successes needed to close.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Sub-second override of the recovery timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_timeout_ms: Option<u64>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
            recovery_timeout_ms: None,
        }
    }
}

impl BreakerConfig {
    /// Creates a config with explicit thresholds.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_secs: recovery_timeout.as_secs(),
            success_threshold,
            recovery_timeout_ms: Some(u64::try_from(recovery_timeout.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Returns the recovery timeout.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout_ms.map_or_else(
            || Duration::from_secs(self.recovery_timeout_secs),
            Duration::from_millis,
        )
    }
}

/// A point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Stage name the breaker guards.
    pub name: String,
    /// Current mode.
    pub state: CircuitState,
    /// Consecutive failures.
    pub failure_count: u32,
    /// Half-open successes.
    pub success_count: u32,
    /// When the breaker last opened.
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.opened_at = Some(now);
        self.opened_at_utc = Some(Utc::now());
    }
}

/// Fault isolator for one stage name.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Returns the guarded stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current mode.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Asks permission for one call.
    pub fn try_acquire(&self) -> Result<(), StageError> {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> Result<(), StageError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(Duration::MAX, |opened| now.saturating_duration_since(opened));
                if elapsed >= self.config.recovery_timeout() {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    tracing::info!(breaker = %self.name, "Circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(StageError::circuit_open(self.name.clone()))
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    *inner = BreakerInner::default();
                    tracing::info!(breaker = %self.name, "Circuit breaker closed");
                }
            }
            // A call admitted before the breaker opened; it proves nothing.
            CircuitState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.open(now);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.open(now);
                tracing::warn!(breaker = %self.name, "Trial call failed, circuit breaker reopened");
            }
            CircuitState::Open => inner.failure_count += 1,
        }
    }

    /// Runs `f` through the breaker.
    ///
    /// Rejected calls never invoke `f`. Errors that do not count against the
    /// breaker (precondition failures) leave its counters untouched.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, StageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        self.try_acquire()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.trips_breaker() {
                    self.record_failure();
                }
                Err(e)
            }
        }
    }

    /// Returns a snapshot of the breaker.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            opened_at: inner.opened_at_utc,
        }
    }

    /// Forces the breaker closed and clears its counters.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::default();
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }
}

/// Keyed breakers, created lazily on first use of a stage name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose breakers share one config.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for a name, creating it if needed.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return breaker.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Returns stats for every breaker, sorted by name.
    #[must_use]
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Resets one breaker. Returns false if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        self.breakers.get(name).map(|b| b.reset()).is_some()
    }

    /// Resets every breaker.
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }

    /// Returns the number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(failures: u32, recovery: Duration, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new("plan", BreakerConfig::new(failures, recovery, successes))
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), StageError> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StageError::failed("plan", "boom"))
        })
        .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let b = breaker(3, Duration::from_secs(60), 1);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(fail(&b, &calls).await.is_err());
        }
        assert_eq!(b.state(), CircuitState::Open);

        let err = fail(&b, &calls).await.unwrap_err();
        assert!(matches!(err, StageError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker(3, Duration::from_secs(60), 1);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();

        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().failure_count, 1);
    }

    #[test]
    fn test_recovery_timeout_moves_to_half_open() {
        let b = breaker(1, Duration::from_secs(30), 1);
        let opened = Instant::now();
        b.record_failure_at(opened);

        assert!(b.try_acquire_at(opened + Duration::from_secs(10)).is_err());
        assert_eq!(b.state(), CircuitState::Open);

        assert!(b.try_acquire_at(opened + Duration::from_secs(30)).is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker(1, Duration::from_secs(30), 2);
        let opened = Instant::now();
        b.record_failure_at(opened);

        let retry_at = opened + Duration::from_secs(31);
        b.try_acquire_at(retry_at).unwrap();
        b.record_success();
        b.record_failure_at(retry_at);

        let stats = b.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.success_count, 0);
        assert!(b.try_acquire_at(retry_at + Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let b = breaker(1, Duration::ZERO, 2);
        b.record_failure();
        b.try_acquire().unwrap();

        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();

        let stats = b.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert!(stats.opened_at.is_none());
    }

    #[tokio::test]
    async fn test_precondition_errors_do_not_trip() {
        let b = breaker(1, Duration::from_secs(60), 1);
        let result: Result<(), _> = b
            .call(|| async {
                Err(StageError::PreconditionFailed {
                    stage: crate::core::StageName::Plan,
                    missing: vec![],
                    present: vec![],
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_shares_breakers_by_name() {
        let registry = CircuitBreakerRegistry::new(BreakerConfig::new(1, Duration::from_secs(60), 1));

        registry.get("validate").record_failure();
        assert_eq!(registry.get("validate").state(), CircuitState::Open);
        assert_eq!(registry.get("plan").state(), CircuitState::Closed);
        assert_eq!(registry.len(), 2);

        let names: Vec<_> = registry.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["plan".to_string(), "validate".to_string()]);

        assert!(registry.reset("validate"));
        assert!(!registry.reset("missing"));
        assert_eq!(registry.get("validate").state(), CircuitState::Closed);
    }
}
