use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CircuitOpenError, Classify};

// ═══════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip Closed → Open.
    pub failure_threshold: u32,
    /// Minimum time since the last failure before a probe is admitted.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one breaker, for operators and batch summaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// How a call was let through. Probes settle the HalfOpen state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Probe,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

// ═══════════════════════════════════════════════════════════
// Breaker
// ═══════════════════════════════════════════════════════════

/// Three-state circuit breaker for one named dependency.
///
/// All state lives behind one mutex: admission (including the
/// Open → HalfOpen transition and probe reservation) happens in a single
/// critical section, so concurrent callers can never run two probes.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic inside a guarded call never holds this lock, so poisoning
        // only means another thread panicked between two field updates.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state. Does not perform the lazy Open → HalfOpen transition.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_time: inner.last_failure_at,
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// Open breakers move to HalfOpen here, lazily, once the recovery timeout
    /// has elapsed since the last failure; that caller becomes the probe.
    pub fn try_acquire(&self) -> Result<Admission, CircuitOpenError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.recovery_timeout);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(breaker = %self.name, "Circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(self.rejection())
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.rejection())
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match (admission, inner.state) {
            (Admission::Probe, BreakerState::HalfOpen) => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                tracing::info!(breaker = %self.name, "Probe succeeded, circuit closed");
            }
            (_, BreakerState::Closed) => inner.consecutive_failures = 0,
            // A normal call that started before the breaker tripped; its
            // success says nothing about the current probe.
            _ => {}
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        match (admission, inner.state) {
            (Admission::Probe, BreakerState::HalfOpen) => {
                inner.state = BreakerState::Open;
                inner.probe_in_flight = false;
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                tracing::warn!(breaker = %self.name, "Probe failed, circuit re-opened");
            }
            (_, BreakerState::Closed) => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Failure threshold reached, circuit opened"
                    );
                }
            }
            _ => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            }
        }
    }

    /// Give back an admission without counting it either way. A released
    /// probe lets the next caller probe instead.
    pub fn release(&self, admission: Admission) {
        let mut inner = self.lock();
        if admission == Admission::Probe && inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Run `op` through the breaker. Rejected calls never invoke `op`.
    ///
    /// Only failures of the dependency itself are counted; errors caused by
    /// the caller's input release the admission untouched. A panicking `op`
    /// counts as a failure.
    pub fn call<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<CircuitOpenError> + Classify,
    {
        let mut pending = PendingAdmission {
            breaker: self,
            admission: Some(self.try_acquire()?),
        };
        let result = op();
        let Some(admission) = pending.admission.take() else {
            return result;
        };
        match &result {
            Ok(_) => self.record_success(admission),
            Err(err) if err.kind().is_dependency_failure() => self.record_failure(admission),
            Err(err) => {
                tracing::debug!(breaker = %self.name, kind = ?err.kind(), "Input error not counted");
                self.release(admission);
            }
        }
        result
    }

    /// Operator override: force Closed and clear counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
        tracing::info!(breaker = %self.name, "Circuit manually reset");
    }

    fn rejection(&self) -> CircuitOpenError {
        CircuitOpenError {
            dependency: self.name.clone(),
        }
    }
}

/// Admission held across a guarded call. Dropped unsettled (the call
/// unwound), it records a failure so a probe slot is never leaked.
struct PendingAdmission<'a> {
    breaker: &'a CircuitBreaker,
    admission: Option<Admission>,
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            tracing::error!(breaker = %self.breaker.name, "Guarded call panicked, counted as failure");
            self.breaker.record_failure(admission);
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════

/// Owns one breaker per dependency name for the life of the process.
///
/// Breakers are created lazily on first lookup and never removed.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut map = self.map();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.defaults.clone())))
            .clone()
    }

    /// Snapshots of every breaker created so far, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<CircuitBreakerState> =
            self.map().values().map(|b| b.snapshot()).collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Reset one breaker. Returns false when no breaker has that name.
    pub fn reset(&self, name: &str) -> bool {
        let breaker = self.map().get(name).cloned();
        match breaker {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }
}
