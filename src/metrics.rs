//! Prometheus counters/gauges for the reconciliation pipeline. The
//! exporter itself (`metrics_exporter_prometheus`) is wired in `main.rs`;
//! this module is the set of named instruments every component reports
//! through, following the same metric-name-constants-plus-free-functions
//! shape used for Prometheus elsewhere in the stack.

use metrics::{counter, describe_counter};

pub const RECONCILE_PASSES_TOTAL: &str = "ingressd_reconcile_passes_total";
pub const CIRCUIT_BREAKER_TRIPS_TOTAL: &str = "ingressd_circuit_breaker_trips_total";
pub const SUPERVISOR_RESTARTS_TOTAL: &str = "ingressd_supervisor_restarts_total";

/// Register metric descriptions. Called once at startup; a missing
/// `describe_*` call doesn't prevent recording, it only drops the HELP
/// text from `/metrics`.
pub fn describe() {
    describe_counter!(
        RECONCILE_PASSES_TOTAL,
        "Total number of reconcile passes, labeled by outcome"
    );
    describe_counter!(
        CIRCUIT_BREAKER_TRIPS_TOTAL,
        "Total number of circuit breaker trips into the open state, labeled by breaker name"
    );
    describe_counter!(
        SUPERVISOR_RESTARTS_TOTAL,
        "Total number of times the supervised nginx child was (re)started, labeled by trigger"
    );
}

/// `result` is one of "committed", "noop", "failed".
pub fn record_reconcile_pass(result: &str) {
    counter!(RECONCILE_PASSES_TOTAL, "result" => result.to_string()).increment(1);
}

pub fn record_circuit_breaker_trip(breaker: &str) {
    counter!(CIRCUIT_BREAKER_TRIPS_TOTAL, "breaker" => breaker.to_string()).increment(1);
}

/// `trigger` is one of "not_running" (the reconciler found the child down
/// at reload time) or "unexpected_exit" (the supervisor's monitor
/// observed the child die on its own).
pub fn record_supervisor_restart(trigger: &str) {
    counter!(SUPERVISOR_RESTARTS_TOTAL, "trigger" => trigger.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_follow_prometheus_conventions() {
        assert!(RECONCILE_PASSES_TOTAL.ends_with("_total"));
        assert!(CIRCUIT_BREAKER_TRIPS_TOTAL.ends_with("_total"));
        assert!(SUPERVISOR_RESTARTS_TOTAL.ends_with("_total"));
    }
}
