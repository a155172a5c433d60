//! Metric instrument factories for playbook-runner.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"playbook-runner"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for playbook-runner instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("playbook-runner")
}

/// Counter: markers persisted as pending.
/// Labels: `duration_unit`.
pub fn markers_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("runner.markers.scheduled")
        .with_description("Number of markers scheduled")
        .build()
}

/// Counter: marker state transitions.
/// Labels: `from`, `to`.
pub fn marker_transitions() -> Counter<u64> {
    meter()
        .u64_counter("runner.markers.transitions")
        .with_description("Number of marker state transitions")
        .build()
}

/// Counter: dispatch cycles run.
/// Labels: `result` ("ok" | "error").
pub fn dispatch_cycles() -> Counter<u64> {
    meter()
        .u64_counter("runner.dispatch.cycles")
        .with_description("Number of dispatch cycles")
        .build()
}

/// Counter: playbook run triggers.
/// Labels: `result` ("ok" | "error").
pub fn playbooks_triggered() -> Counter<u64> {
    meter()
        .u64_counter("runner.playbooks.triggered")
        .with_description("Number of playbook runs triggered")
        .build()
}

/// Counter: REST calls against the platform.
/// Labels: `http.request.method`, `outcome` ("ok" | "transport" | "status" | "parse").
pub fn rest_requests() -> Counter<u64> {
    meter()
        .u64_counter("runner.rest.requests")
        .with_description("Number of platform REST requests")
        .build()
}

/// Histogram: dispatch cycle duration in milliseconds.
pub fn cycle_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("runner.dispatch.duration_ms")
        .with_description("Dispatch cycle duration in milliseconds")
        .with_unit("ms")
        .build()
}
