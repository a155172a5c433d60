//! Dispatch span helpers.
//!
//! One span per poll cycle, one child span per marker examined.

use tracing::Span;

use crate::model::{CaseId, MarkerId};

/// Start a span covering one dispatch cycle.
///
/// `cycle.dispatched` is declared empty and filled in when the cycle ends.
pub fn start_cycle_span(limit: usize) -> Span {
    tracing::info_span!(
        "dispatch.cycle",
        "cycle.limit" = limit,
        "cycle.dispatched" = tracing::field::Empty,
    )
}

/// Start a span for examining a single marker.
pub fn start_marker_span(marker_id: MarkerId, case_id: CaseId) -> Span {
    tracing::info_span!(
        "dispatch.marker",
        "marker.id" = marker_id.0,
        "case.id" = case_id.0,
        "marker.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("marker.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
