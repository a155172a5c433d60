//! Expiration and dispatch: one pass over every pending marker.
//!
//! Markers are examined oldest id first. A marker whose delay has not run
//! out is left alone and costs nothing. An expired marker is either run
//! (`complete`) or rejected (`invalid playbook`), after which the owning
//! case's waiting tag is reconciled against the markers still pending.
//! At most `limit` playbooks are triggered per cycle; the rest wait for
//! the next one.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::error::Result;
use crate::model::*;
use crate::playbook::PlaybookResolver;
use crate::repository::MarkerRepository;
use crate::telemetry::dispatch::{record_state_transition, start_cycle_span, start_marker_span};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// What one cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Pending markers examined.
    pub scanned: usize,
    /// Examined but not yet expired.
    pub waiting: usize,
    /// Playbooks triggered and markers completed.
    pub dispatched: usize,
    /// Expired markers moved to `invalid playbook`.
    pub invalid: usize,
    /// Stopped early because the budget ran out.
    pub budget_exhausted: bool,
}

/// Per-marker decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerOutcome {
    Waiting,
    Dispatched,
    Invalid,
}

pub struct DispatchEngine {
    markers: MarkerRepository,
    playbooks: PlaybookResolver,
    limit: usize,
}

impl DispatchEngine {
    /// `limit` is the per-cycle dispatch budget and is clamped to at least one.
    pub fn new(markers: MarkerRepository, playbooks: PlaybookResolver, limit: usize) -> Self {
        Self {
            markers,
            playbooks,
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run one cycle against the wall clock.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as if the current time were `now`.
    ///
    /// An error aborts the rest of the cycle. Markers already moved during
    /// the cycle keep their new state.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let span = start_cycle_span(self.limit);
        let started = Instant::now();

        let result = self.cycle(now).instrument(span.clone()).await;

        metrics::cycle_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        match &result {
            Ok(report) => {
                span.record("cycle.dispatched", report.dispatched);
                metrics::dispatch_cycles().add(1, &[KeyValue::new("result", "ok")]);
                info!(
                    scanned = report.scanned,
                    dispatched = report.dispatched,
                    invalid = report.invalid,
                    budget_exhausted = report.budget_exhausted,
                    "{} playbooks executed",
                    report.dispatched
                );
            }
            Err(e) => {
                metrics::dispatch_cycles().add(1, &[KeyValue::new("result", "error")]);
                error!(error = %e, "error processing markers and playbooks");
            }
        }
        result
    }

    async fn cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let pending = match self.markers.list_pending_system_wide().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "could not list pending markers, nothing to do this cycle");
                return Ok(report);
            }
        };
        debug!(count = pending.len(), "pending markers found");

        let total = pending.len();
        for (index, marker) in pending.iter().enumerate() {
            report.scanned += 1;

            let span = start_marker_span(marker.id, marker.case_id);
            let outcome = self
                .process(marker, now, &span)
                .instrument(span.clone())
                .await?;
            match outcome {
                MarkerOutcome::Waiting => report.waiting += 1,
                MarkerOutcome::Dispatched => report.dispatched += 1,
                MarkerOutcome::Invalid => report.invalid += 1,
            }

            if report.dispatched >= self.limit {
                report.budget_exhausted = index + 1 < total;
                if report.budget_exhausted {
                    info!(limit = self.limit, "execution limit reached, deferring remaining markers");
                }
                break;
            }
        }

        Ok(report)
    }

    async fn process(
        &self,
        marker: &Marker,
        now: DateTime<Utc>,
        span: &Span,
    ) -> Result<MarkerOutcome> {
        let (payload, created_at) = match marker.schedule() {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(error = %e, "marker schedule is unreadable, retiring it");
                let note = annotation(format!("Execution run at {now}; unreadable schedule: {e}"));
                self.retire(marker, MarkerState::InvalidPlaybook, note, span)
                    .await?;
                return Ok(MarkerOutcome::Invalid);
            }
        };

        if !payload.is_expired(created_at, now) {
            debug!(expires_at = ?payload.expires_at(created_at), "marker not expired yet");
            return Ok(MarkerOutcome::Waiting);
        }
        info!(playbook = %payload.playbook, "marker wait time has expired");

        let case = self.markers.get_case(marker.case_id).await?;
        if !self
            .playbooks
            .is_valid_for_case(&payload.playbook, &case.label)
            .await?
        {
            warn!(playbook = %payload.playbook, label = %case.label, "playbook is invalid for case");
            let note = annotation(format!("Execution run at {now}"));
            self.retire(marker, MarkerState::InvalidPlaybook, note, span)
                .await?;
            return Ok(MarkerOutcome::Invalid);
        }

        let mut note = annotation(format!("Execution run at {now}"));
        match self.playbooks.trigger(&marker.run_request(&payload)).await {
            Ok(response) => {
                note.insert("rest_response".into(), response);
            }
            Err(e) => {
                note.insert(
                    "exeComment".into(),
                    Value::String(format!("Execution run at {now}; trigger failed: {e}")),
                );
            }
        }
        self.retire(marker, MarkerState::Complete, note, span).await?;
        Ok(MarkerOutcome::Dispatched)
    }

    /// Move a marker out of pending, then reconcile its case's waiting tag.
    async fn retire(
        &self,
        marker: &Marker,
        state: MarkerState,
        annotations: Map<String, Value>,
        span: &Span,
    ) -> Result<()> {
        self.markers.update(marker, state, annotations).await?;
        record_state_transition(span, marker.state.as_label(), state.as_label());
        self.settle_waiting_tag(marker.case_id).await
    }

    /// Clear the waiting tag once no pending marker is left on the case.
    async fn settle_waiting_tag(&self, case_id: CaseId) -> Result<()> {
        let remaining = self.markers.count_pending_for_case(case_id).await?;
        if remaining == 0 {
            debug!(%case_id, "no markers pending, clearing waiting tag");
            self.markers.remove_tag(case_id, WAITING_TAG).await?;
        } else {
            debug!(%case_id, remaining, "markers still pending");
        }
        Ok(())
    }
}

fn annotation(comment: String) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("exeComment".into(), Value::String(comment));
    map
}
