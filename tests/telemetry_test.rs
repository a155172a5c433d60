//! Integration tests for telemetry initialization and span helpers.

use playbook_runner::config::Config;
use playbook_runner::model::{CaseId, MarkerId};
use playbook_runner::telemetry::{TelemetryConfig, dispatch, init_telemetry};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // init_telemetry uses try_init(), so a second call in the same
    // process returns an error instead of panicking.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "playbook-runner-test".to_string(),
        default_directive: "info".to_string(),
    };
    let _guard = init_telemetry(config);
}

#[test]
fn telemetry_config_follows_runner_config() {
    let config = Config::from_toml_str(
        r#"
        debug = true
        otel_endpoint = "http://localhost:4317"
        "#,
    )
    .unwrap();
    let telemetry = TelemetryConfig::from_config(&config);
    assert_eq!(telemetry.endpoint.as_deref(), Some("http://localhost:4317"));
    assert_eq!(telemetry.default_directive, "debug");
    assert_eq!(telemetry.service_name, "playbook-runner");
}

#[test]
fn cycle_span_creates() {
    let span = dispatch::start_cycle_span(4);
    span.record("cycle.dispatched", 2);
}

#[test]
fn marker_span_creates_and_records_transition() {
    let span = dispatch::start_marker_span(MarkerId(12), CaseId(3));
    dispatch::record_state_transition(&span, "pending", "complete");
}
