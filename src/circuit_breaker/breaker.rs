use super::types::{CircuitBreakerConfig, CircuitState};
use crate::metrics::record_store_circuit_state;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker guarding the shared bucket store.
///
/// While open, the rate limiter reports the store unavailable without a
/// network round trip, so an outage costs one fallback decision per
/// request instead of one timeout per request.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
    store: &'static str,
}

#[derive(Debug)]
struct State {
    circuit_state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    /// Bumped on every transition so permits from an earlier state are ignored
    generation: u64,
}

/// Permission for one store call.
///
/// Report the outcome with [`CallPermit::record_success`] or
/// [`CallPermit::record_failure`]. A permit dropped without an outcome,
/// e.g. when the request future is cancelled, gives its half-open trial
/// slot back.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation, self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation, self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            debug!(store = self.breaker.store, "Half-open store call abandoned");
            let mut state = self.breaker.lock();
            release_trial_slot(&mut state, self.generation);
        }
    }
}

fn release_trial_slot(state: &mut State, generation: u64) {
    if state.generation == generation && state.circuit_state == CircuitState::HalfOpen {
        state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
    }
}

impl CircuitBreaker {
    pub fn new(store: &'static str, config: CircuitBreakerConfig) -> Self {
        info!(
            store,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            cooldown_ms = config.cooldown_ms,
            "Creating store circuit breaker"
        );

        Self {
            config,
            state: Mutex::new(State {
                circuit_state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
                generation: 0,
            }),
            store,
        }
    }

    /// A permit for one store call, or `None` while the circuit is open or
    /// every half-open slot is taken
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut state = self.lock();

        let trial = match state.circuit_state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled_down = state
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.cooldown())
                    .unwrap_or(true);
                if !cooled_down {
                    debug!(store = self.store, "Circuit open, skipping store call");
                    return None;
                }
                self.transition(&mut state, CircuitState::HalfOpen);
                state.half_open_in_flight = 1;
                true
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight >= self.config.half_open_requests {
                    return None;
                }
                state.half_open_in_flight += 1;
                true
            }
        };

        Some(CallPermit {
            breaker: self,
            generation: state.generation,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, generation: u64, trial: bool) {
        let mut state = self.lock();
        if trial {
            release_trial_slot(&mut state, generation);
        }

        match state.circuit_state {
            CircuitState::Closed => state.consecutive_failures = 0,
            CircuitState::HalfOpen if state.generation == generation => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed);
                }
            }
            _ => {}
        }
    }

    fn on_failure(&self, generation: u64, trial: bool) {
        let mut state = self.lock();
        if trial {
            release_trial_slot(&mut state, generation);
        }

        match state.circuit_state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if state.generation == generation => {
                warn!(store = self.store, "Half-open store call failed, reopening circuit");
                self.transition(&mut state, CircuitState::Open);
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().circuit_state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // State is plain counters; a panic mid-update leaves nothing to repair.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, state: &mut State, to: CircuitState) {
        let from = state.circuit_state;
        state.circuit_state = to;
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        state.half_open_in_flight = 0;
        state.generation += 1;
        state.opened_at = match to {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };

        match to {
            CircuitState::Open => warn!(store = self.store, %from, "Store circuit opened"),
            _ => info!(store = self.store, %from, %to, "Store circuit transition"),
        }
        record_store_circuit_state(self.store, to);
    }
}
