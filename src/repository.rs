//! Marker repository: create, query and update scheduling markers, and keep
//! the case-level waiting tag in step with them.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::*;
use crate::rest::{RestGateway, quoted};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Everything needed to create a marker.
///
/// With both `comment` and `duration_unit` present the marker is persisted as
/// pending; otherwise only an unpersisted [`MarkerDraft`] is built, which is
/// what immediate execution needs.
#[derive(Debug, Clone)]
pub struct NewMarker {
    pub comment: Option<String>,
    pub duration_unit: Option<DurationUnit>,
    pub duration: Option<u32>,
    pub playbook: String,
    pub scope: Scope,
    /// Owning case; `None` means the case the invocation is attached to.
    pub case_id: Option<CaseId>,
    pub inputs: Option<Value>,
}

/// What [`MarkerRepository::create`] did.
#[derive(Debug)]
pub enum CreateResult {
    /// Stored as a pending marker.
    Persisted {
        id: Option<MarkerId>,
        case_id: CaseId,
    },
    /// Not stored; carries the shape needed to trigger the playbook.
    Draft(MarkerDraft),
}

/// Outcome of halting a case's pending markers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HaltSummary {
    pub halted: Vec<MarkerId>,
    pub failed: Vec<MarkerId>,
}

/// Request body for artifact creation.
#[derive(Serialize)]
struct ArtifactCreate {
    cef: Map<String, Value>,
    container_id: CaseId,
    label: &'static str,
    name: &'static str,
    source_data_identifier: String,
    run_automation: bool,
}

/// Store-backed marker operations.
#[derive(Clone)]
pub struct MarkerRepository {
    gateway: RestGateway,
    /// The case the current invocation is attached to.
    current_case: Option<CaseId>,
}

impl MarkerRepository {
    pub fn new(gateway: RestGateway, current_case: Option<CaseId>) -> Self {
        Self {
            gateway,
            current_case,
        }
    }

    pub fn gateway(&self) -> &RestGateway {
        &self.gateway
    }

    /// Explicit case, else the invocation's case.
    pub fn resolve_case(&self, explicit: Option<CaseId>) -> Result<CaseId> {
        explicit.or(self.current_case).ok_or_else(|| {
            Error::InputFormat("no case id given and the invocation has no case".to_string())
        })
    }

    /// Persist a pending marker, or build a draft for immediate execution.
    pub async fn create(&self, new: NewMarker) -> Result<CreateResult> {
        let case_id = self.resolve_case(new.case_id)?;

        let (comment, unit) = match (new.comment, new.duration_unit) {
            (Some(comment), Some(unit)) => (comment, unit),
            _ => {
                debug!(%case_id, "marker is for immediate execution, not persisting");
                return Ok(CreateResult::Draft(MarkerDraft {
                    case_id,
                    playbook: new.playbook,
                    scope: new.scope,
                    inputs: new.inputs,
                }));
            }
        };

        let duration = new
            .duration
            .filter(|d| *d > 0)
            .ok_or_else(|| Error::InputFormat("delay duration must be a positive integer".into()))?;

        let payload = MarkerPayload {
            comment,
            duration_unit: unit,
            duration,
            playbook: new.playbook,
            scope: new.scope,
            inputs: new.inputs,
        };
        let cef = match serde_json::to_value(&payload) {
            Ok(Value::Object(cef)) => cef,
            Ok(_) => return Err(Error::Other("marker payload did not serialize to a map".into())),
            Err(e) => return Err(Error::Other(format!("marker payload: {e}"))),
        };

        let origin = self
            .current_case
            .map(|c| c.to_string())
            .unwrap_or_else(|| case_id.to_string());
        let body = ArtifactCreate {
            cef,
            container_id: case_id,
            label: MarkerState::Pending.as_label(),
            name: MARKER_NAME,
            source_data_identifier: format!("runner-{}-{origin}", Utc::now()),
            run_automation: false,
        };

        debug!(%case_id, playbook = %payload.playbook, "posting marker");
        let response = self
            .gateway
            .post("rest/artifact", &body)
            .await
            .map_err(Error::rest("marker creation"))?;
        let id = response.get("id").and_then(Value::as_i64).map(MarkerId);

        metrics::markers_scheduled().add(
            1,
            &[KeyValue::new("duration_unit", unit.to_string())],
        );
        info!(%case_id, marker_id = ?id, playbook = %payload.playbook, %unit, duration, "marker scheduled");

        Ok(CreateResult::Persisted { id, case_id })
    }

    /// All pending runner markers across every case, oldest id first.
    pub async fn list_pending_system_wide(&self) -> Result<Vec<Marker>> {
        let endpoint = format!(
            "rest/artifact?page_size=0&_filter_label={}&_filter_name__contains={}&sort=id&order=asc",
            quoted(MarkerState::Pending.as_label()),
            quoted(MARKER_NAME),
        );
        let data = self
            .gateway
            .get(&endpoint)
            .await
            .map_err(Error::rest("pending marker scan"))?;
        let mut markers = parse_markers(data)?;
        markers.sort_by_key(|m| m.id);
        Ok(markers)
    }

    /// Pending runner markers of one case.
    pub async fn list_pending_for_case(&self, case_id: CaseId) -> Result<Vec<Marker>> {
        let body = self
            .gateway
            .get(&pending_for_case_endpoint(case_id))
            .await
            .map_err(Error::rest("case marker lookup"))?;
        parse_markers(body.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Number of pending runner records on a case, readable or not.
    ///
    /// Decides the waiting tag, so it counts raw rows rather than the
    /// markers that survive parsing.
    pub async fn count_pending_for_case(&self, case_id: CaseId) -> Result<u64> {
        let body = self
            .gateway
            .get(&pending_for_case_endpoint(case_id))
            .await
            .map_err(Error::rest("case marker count"))?;
        match body.get("count").and_then(Value::as_u64) {
            Some(count) => Ok(count),
            None => body
                .get("data")
                .and_then(Value::as_array)
                .map(|rows| rows.len() as u64)
                .ok_or_else(|| Error::Malformed("pending marker list has no count".into())),
        }
    }

    /// Set or clear the waiting tag to match what is still pending.
    pub async fn reconcile_waiting_tag(&self, case_id: CaseId) -> Result<bool> {
        if self.count_pending_for_case(case_id).await? > 0 {
            self.add_waiting_tag(case_id).await
        } else {
            self.remove_tag(case_id, WAITING_TAG).await
        }
    }

    /// Move a pending marker to `state`, merging `annotations` into its
    /// payload. Existing payload fields are kept.
    pub async fn update(
        &self,
        marker: &Marker,
        state: MarkerState,
        annotations: Map<String, Value>,
    ) -> Result<()> {
        if !marker.state.can_transition_to(state) {
            return Err(Error::InvalidTransition {
                from: marker.state,
                to: state,
            });
        }

        let mut cef = marker.cef.clone();
        cef.extend(annotations);
        let body = json!({
            "id": marker.id,
            "label": state.as_label(),
            "cef": cef,
        });

        self.gateway
            .post(&format!("rest/artifact/{}", marker.id), &body)
            .await
            .map_err(Error::rest("marker update"))?;

        metrics::marker_transitions().add(
            1,
            &[
                KeyValue::new("from", marker.state.as_label()),
                KeyValue::new("to", state.as_label()),
            ],
        );
        debug!(marker_id = %marker.id, from = %marker.state, to = %state, "marker updated");
        Ok(())
    }

    /// Halt every pending marker of a case, one at a time.
    ///
    /// There is no multi-record atomicity: a failed update is logged and
    /// recorded in the summary, and the remaining markers are still tried.
    pub async fn halt_all_pending_for_case(
        &self,
        case_id: CaseId,
        reason: &str,
    ) -> Result<HaltSummary> {
        let pending = self.list_pending_for_case(case_id).await?;
        let mut summary = HaltSummary::default();

        for marker in &pending {
            let mut annotations = Map::new();
            annotations.insert("exeComment".into(), Value::String(reason.to_string()));
            match self.update(marker, MarkerState::Halted, annotations).await {
                Ok(()) => summary.halted.push(marker.id),
                Err(e) => {
                    warn!(marker_id = %marker.id, %case_id, error = %e, "failed to halt marker");
                    summary.failed.push(marker.id);
                }
            }
        }

        info!(
            %case_id,
            halted = summary.halted.len(),
            failed = summary.failed.len(),
            "pending markers halted"
        );
        Ok(summary)
    }

    /// Fetch a case record.
    pub async fn get_case(&self, case_id: CaseId) -> Result<Case> {
        let body = self
            .gateway
            .get(&format!("rest/container/{case_id}"))
            .await
            .map_err(Error::rest("case lookup"))?;
        serde_json::from_value(body).map_err(|e| Error::Malformed(format!("case {case_id}: {e}")))
    }

    /// Add the waiting tag. Returns whether the tag set changed.
    pub async fn add_waiting_tag(&self, case_id: CaseId) -> Result<bool> {
        self.edit_tags(case_id, |tags| {
            if tags.iter().any(|t| t == WAITING_TAG) {
                false
            } else {
                tags.push(WAITING_TAG.to_string());
                true
            }
        })
        .await
    }

    /// Remove `tag` if present. Returns whether the tag set changed.
    pub async fn remove_tag(&self, case_id: CaseId, tag: &str) -> Result<bool> {
        self.edit_tags(case_id, |tags| {
            let before = tags.len();
            tags.retain(|t| t != tag);
            tags.len() != before
        })
        .await
    }

    /// Read-modify-write of the tag set; skips the write when nothing changed.
    async fn edit_tags<F>(&self, case_id: CaseId, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut Vec<String>) -> bool,
    {
        let mut case = self.get_case(case_id).await?;
        if !edit(&mut case.tags) {
            return Ok(false);
        }
        self.gateway
            .post(
                &format!("rest/container/{case_id}"),
                &json!({"tags": case.tags}),
            )
            .await
            .map_err(Error::rest("case tag update"))?;
        debug!(%case_id, tags = ?case.tags, "case tags updated");
        Ok(true)
    }

    /// Count runner markers on a case, optionally narrowed by playbook
    /// reference and state label.
    pub async fn count(
        &self,
        case_id: CaseId,
        playbook: Option<&str>,
        label: Option<&str>,
    ) -> Result<u64> {
        let mut params = vec![format!("_filter_name={}", quoted(MARKER_NAME)), "page_size=0".to_string()];
        if let Some(playbook) = playbook {
            params.push(format!("_filter_cef__playbook={}", quoted(playbook)));
        }
        if let Some(label) = label {
            params.push(format!("_filter_label={}", quoted(label)));
        }
        let endpoint = format!("rest/container/{case_id}/artifacts?{}", params.join("&"));

        let body = self
            .gateway
            .get(&endpoint)
            .await
            .map_err(Error::rest("marker count"))?;
        body.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Malformed("count response has no count".to_string()))
    }
}

fn pending_for_case_endpoint(case_id: CaseId) -> String {
    format!(
        "rest/container/{case_id}/artifacts?page_size=0&_filter_label={}&_filter_name__contains={}",
        quoted(MarkerState::Pending.as_label()),
        quoted(MARKER_NAME),
    )
}

/// Records without a usable id, container or label cannot be addressed and
/// are skipped. They still count toward the case's waiting tag.
fn parse_markers(data: Value) -> Result<Vec<Marker>> {
    let rows = match data {
        Value::Null => return Ok(Vec::new()),
        Value::Array(rows) => rows,
        other => {
            return Err(Error::Malformed(format!(
                "expected a marker list, got {other}"
            )));
        }
    };

    let mut markers = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.get("id").cloned();
        match serde_json::from_value::<Marker>(row) {
            Ok(marker) => markers.push(marker),
            Err(e) => warn!(record = ?id, error = %e, "skipping unreadable marker record"),
        }
    }
    Ok(markers)
}
