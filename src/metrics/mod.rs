//! Decision and latency instrumentation.
//!
//! Everything goes through the `metrics` facade; the host process installs
//! whichever recorder/exporter its pipeline uses. Without a recorder these
//! calls are no-ops.

use crate::circuit_breaker::CircuitState;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::Once;
use tracing::debug;

static REGISTER: Once = Once::new();

/// Register all metrics with descriptions
pub fn register_metrics() {
    REGISTER.call_once(|| {
        describe_counter!(
            "authgate_decisions_total",
            "Gate verdicts by outcome (admitted, rejected, fail_open, unavailable)"
        );
        describe_counter!(
            "authgate_auth_failures_total",
            "Token verification failures by reason code"
        );
        describe_counter!(
            "authgate_rate_limited_total",
            "Requests rejected by a token bucket, by policy"
        );
        describe_counter!(
            "authgate_store_unavailable_total",
            "Bucket store calls that failed or timed out"
        );
        describe_histogram!(
            "authgate_store_latency_seconds",
            "Bucket store check-and-consume latencies in seconds"
        );
        describe_gauge!(
            "authgate_store_circuit_state",
            "Store circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
        );

        debug!("All metrics registered with descriptions");
    });
}

/// Record the final outcome of one gate evaluation
pub fn record_decision(outcome: &'static str) {
    counter!("authgate_decisions_total", "outcome" => outcome).increment(1);
}

/// Record a token verification failure
pub fn record_auth_failure(reason: &'static str) {
    counter!("authgate_auth_failures_total", "reason" => reason).increment(1);
}

/// Record a bucket rejection
pub fn record_rate_limited(policy: &str) {
    counter!("authgate_rate_limited_total", "policy" => policy.to_string()).increment(1);
}

/// Record a failed or timed out store call
pub fn record_store_unavailable(store: &'static str) {
    counter!("authgate_store_unavailable_total", "store" => store).increment(1);
}

/// Record store call latency
pub fn record_store_latency(store: &'static str, seconds: f64) {
    histogram!("authgate_store_latency_seconds", "store" => store).record(seconds);
}

/// Record circuit breaker state
pub fn record_store_circuit_state(store: &'static str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    gauge!("authgate_store_circuit_state", "store" => store).set(value);
}
