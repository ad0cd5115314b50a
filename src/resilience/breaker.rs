//! Circuit breaker
//!
//! ```text
//!            failures >= threshold (within window)
//!   Closed ─────────────────────────────────────────▶ Open
//!     ▲                                                │
//!     │ trial succeeds                                 │ cool-down elapsed
//!     │                                                ▼
//!     └────────────────────────────────────────── Half-Open
//!                  trial fails: back to Open, cool-down restarts
//! ```
//!
//! State lives behind a `std::sync::Mutex` that is held only while deciding a
//! transition, never across the guarded call. Breakers are scoped per target
//! through [`BreakerRegistry`].

use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Capacity of the transition notification channel
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// A single trial call is allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Notification emitted on every state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub target: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub target: String,
    pub state: CircuitState,
    pub recent_failures: usize,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

/// Failure-isolation state machine guarding one target
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    transitions: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `target`
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                total_calls: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
            transitions,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state. An open circuit whose cool-down has elapsed still
    /// reports `Open` until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Subscribe to state-transition notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }

    /// Ask for permission to call the dependency.
    ///
    /// The returned permit must be settled with [`CallPermit::success`] or
    /// [`CallPermit::failure`]. Dropping it unsettled (e.g. the caller was
    /// cancelled) frees a half-open trial slot without recording a result.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>> {
        let mut transition = None;
        let permit = {
            let mut inner = self.lock();
            let state = inner.state;
            let decision = match state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let cooled = inner
                        .opened_at
                        .map_or(true, |at| at.elapsed() >= self.config.cooldown());
                    if cooled {
                        transition = Some(self.transition(&mut inner, CircuitState::HalfOpen));
                        inner.trial_in_flight = true;
                        Ok(true)
                    } else {
                        Err(())
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        Err(())
                    } else {
                        inner.trial_in_flight = true;
                        Ok(true)
                    }
                }
            };
            match decision {
                Ok(_) => inner.total_calls += 1,
                Err(()) => inner.total_rejections += 1,
            }
            decision
        };
        self.notify(transition);

        match permit {
            Ok(trial) => Ok(CallPermit {
                breaker: self,
                trial,
                settled: false,
            }),
            Err(()) => Err(Error::CircuitOpen {
                target: self.target.clone(),
            }),
        }
    }

    /// Run `f` under the breaker. Only transient errors count as failures;
    /// validation and not-found results prove the dependency is reachable.
    /// Pool errors are raised before the dependency is reached, so they
    /// settle nothing and a half-open trial slot is simply freed.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        let result = f().await;
        match &result {
            Err(Error::PoolExhausted { .. } | Error::PoolClosed) => drop(permit),
            Err(e) if e.is_transient() => permit.failure(),
            _ => permit.success(),
        }
        result
    }

    /// Statistics snapshot
    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            target: self.target.clone(),
            state: inner.state,
            recent_failures: inner.failures.len(),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.failures.clear();
            inner.opened_at = None;
            inner.trial_in_flight = false;
            (inner.state != CircuitState::Closed)
                .then(|| self.transition(&mut inner, CircuitState::Closed))
        };
        self.notify(transition);
    }

    fn record_success(&self, trial: bool) {
        let transition = {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                CircuitState::Closed => {
                    inner.failures.clear();
                    None
                }
                CircuitState::HalfOpen if trial => {
                    inner.trial_in_flight = false;
                    inner.failures.clear();
                    inner.opened_at = None;
                    Some(self.transition(&mut inner, CircuitState::Closed))
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    fn record_failure(&self, trial: bool) {
        let transition = {
            let mut inner = self.lock();
            inner.total_failures += 1;
            let now = Instant::now();
            let state = inner.state;
            match state {
                CircuitState::Closed => {
                    inner.failures.push_back(now);
                    let window = self.config.window();
                    while inner
                        .failures
                        .front()
                        .is_some_and(|at| now.duration_since(*at) > window)
                    {
                        inner.failures.pop_front();
                    }
                    if inner.failures.len() >= self.config.failure_threshold as usize {
                        inner.failures.clear();
                        inner.opened_at = Some(now);
                        Some(self.transition(&mut inner, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if trial => {
                    inner.trial_in_flight = false;
                    inner.opened_at = Some(now);
                    Some(self.transition(&mut inner, CircuitState::Open))
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) -> CircuitTransition {
        let from = inner.state;
        inner.state = to;
        CircuitTransition {
            target: self.target.clone(),
            from,
            to,
        }
    }

    fn notify(&self, transition: Option<CircuitTransition>) {
        if let Some(t) = transition {
            if t.to == CircuitState::Open {
                tracing::warn!(target_name = %t.target, from = %t.from, "Circuit opened");
            } else {
                tracing::info!(target_name = %t.target, from = %t.from, to = %t.to, "Circuit transition");
            }
            // No subscribers is fine
            let _ = self.transitions.send(t);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Permission to make one guarded call
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this permit holds the half-open trial slot
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Per-target breaker registry
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the breaker for `target`, creating it on first use
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
            .clone()
    }

    /// Snapshot of every registered breaker
    pub fn stats(&self) -> Vec<BreakerStats> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stats: Vec<BreakerStats> = breakers.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.target.cmp(&b.target));
        stats
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
