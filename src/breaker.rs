//! Circuit breaker for reference service clients
//!
//! One breaker per client name. Outcomes of the last N calls are kept in a
//! sliding window; when the window is full and the failure share reaches the
//! threshold, the breaker opens and callers get a synthetic transient error
//! instead of hitting the sick dependency. After the cooldown a single probe
//! is allowed through; its outcome closes or re-opens the circuit.
//!
//! Only transport-class failures (timeouts, 5xx, connection errors) count
//! against the window. A 404 or a 4xx is an answered call.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker tuning. Defaults: window 10 calls, open at 50% failures,
/// cooldown 60 s.
#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    pub window_size: usize,
    pub failure_threshold: f64,
    pub open_cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_threshold: 0.5,
            open_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    opened_at: Option<Instant>,
    /// true = success, false = failure; capped at `window_size`.
    window: VecDeque<bool>,
}

/// Sliding-window circuit breaker for one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    policy: BreakerPolicy,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            inner: Mutex::new(Inner {
                state: State::Closed,
                opened_at: None,
                window: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may go out right now. An open breaker transitions to
    /// half-open once the cooldown has elapsed, letting the caller probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.policy.open_cooldown)
                    .unwrap_or(true);
                if elapsed {
                    info!("[breaker:{}] cooldown elapsed, half-open probe", self.name);
                    inner.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record an answered call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::HalfOpen => {
                info!("[breaker:{}] probe succeeded, closing", self.name);
                inner.state = State::Closed;
                inner.opened_at = None;
                inner.window.clear();
            }
            _ => self.push_outcome(&mut inner, true),
        }
    }

    /// Record a transport-class failure.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::HalfOpen => {
                warn!("[breaker:{}] probe failed, re-opening", self.name);
                self.open(&mut inner);
            }
            _ => {
                self.push_outcome(&mut inner, false);
                if self.should_open(&inner) {
                    warn!(
                        "[breaker:{}] failure threshold reached over last {} calls, opening for {:?}",
                        self.name, self.policy.window_size, self.policy.open_cooldown
                    );
                    self.open(&mut inner);
                }
            }
        }
    }

    fn push_outcome(&self, inner: &mut Inner, ok: bool) {
        if inner.window.len() == self.policy.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(ok);
    }

    fn should_open(&self, inner: &Inner) -> bool {
        if inner.window.len() < self.policy.window_size {
            return false;
        }
        let failures = inner.window.iter().filter(|ok| !**ok).count();
        failures as f64 / inner.window.len() as f64 >= self.policy.failure_threshold
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = State::Open;
        inner.opened_at = Some(Instant::now());
        inner.window.clear();
    }
}

/// Lazily-created breakers keyed by client name, shared policy.
pub struct BreakerRegistry {
    policy: BreakerPolicy,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            breakers: DashMap::new(),
        }
    }

    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.policy.clone())))
            .clone()
    }
}
