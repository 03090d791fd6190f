//! Per-name circuit breakers guarding upstream calls.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::duration_ms;

/// Runtime circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "duration_ms")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    rejected: u64,
}

impl CircuitInner {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            rejected: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
    }
}

/// Point-in-time view of one circuit, exposed through error metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub rejected: u64,
}

/// Thread-safe circuit breaker.
///
/// State checks and transitions happen under one lock, so a failure count
/// increment and the resulting transition are never observed separately.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(CircuitInner::new(config)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admits a call. After the cooldown exactly one trial is admitted until
    /// its outcome is recorded.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|opened_at| opened_at.elapsed() >= inner.config.open_timeout);

                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = None;
                    inner.trial_in_flight = true;
                    info!(circuit = %self.name, "circuit half-open; admitting trial call");
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            inner.rejected = inner.rejected.saturating_add(1);
        }
        allowed
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(circuit = %self.name, "circuit closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if inner.state == CircuitState::HalfOpen {
            inner.open();
            warn!(circuit = %self.name, "trial call failed; circuit re-opened");
        } else if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= inner.config.failure_threshold
        {
            inner.open();
            warn!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                cooldown_ms = inner.config.open_timeout.as_millis() as u64,
                "failure threshold reached; circuit opened"
            );
        }
    }

    /// Called when an admitted trial ends without an outcome (for example the
    /// caller dropped the future). The circuit goes back to open.
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.open();
            warn!(circuit = %self.name, "trial call abandoned; circuit re-opened");
        }
    }

    /// New thresholds apply from the next recorded outcome; the current state is kept.
    pub fn reconfigure(&self, config: CircuitBreakerConfig) {
        self.lock().config = config;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            rejected: inner.rejected,
        }
    }
}

/// Lazily created breakers keyed by circuit name.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    config: Mutex<CircuitBreakerConfig>,
    breakers: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Mutex::new(config),
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Breaker for `name`, created with the current config on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let config = *self.config.lock().unwrap_or_else(PoisonError::into_inner);
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    /// Applies to existing circuits and to those created later.
    pub fn set_config(&self, config: CircuitBreakerConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        for breaker in breakers.values() {
            breaker.reconfigure(config);
        }
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers.values().map(|breaker| breaker.snapshot()).collect()
    }

    /// Drop every circuit; the next call to [`Self::get`] starts closed.
    pub fn reset(&self) {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = breaker(2, 10);

        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
        assert_eq!(breaker.snapshot().rejected, 1);
    }

    #[test]
    fn transitions_to_half_open_after_timeout_then_closes_on_success() {
        let breaker = breaker(1, 1);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(2));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn half_open_admits_a_single_trial() {
        let breaker = breaker(1, 1);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(2));

        assert!(breaker.allow_request());
        assert!(!breaker.allow_request());
        assert!(!breaker.allow_request());
    }

    #[test]
    fn failed_trial_reopens_and_restarts_cooldown() {
        let breaker = breaker(1, 20);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(25));

        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());

        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.allow_request());
    }

    #[test]
    fn abandoned_trial_reopens_circuit() {
        let breaker = breaker(1, 1);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(2));

        assert!(breaker.allow_request());
        breaker.release_trial();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn registry_shares_breakers_by_name() {
        let registry = CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_secs(60),
        });

        registry.get("quote_analysis").record_failure();
        assert_eq!(registry.get("quote_analysis").state(), CircuitState::Open);
        assert_eq!(registry.get("anomaly_detection").state(), CircuitState::Closed);
        assert_eq!(registry.snapshots().len(), 2);

        registry.reset();
        assert!(registry.snapshots().is_empty());
        assert_eq!(registry.get("quote_analysis").state(), CircuitState::Closed);
    }

    #[test]
    fn new_config_reaches_existing_circuits() {
        let registry = CircuitRegistry::new(CircuitBreakerConfig::default());
        let breaker = registry.get("anomaly_detection");
        breaker.record_failure();

        registry.set_config(CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout: Duration::from_secs(60),
        });
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
