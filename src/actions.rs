//! Action handlers: the caller-facing operations.
//!
//! Each handler runs to completion against the store and returns an
//! [`ActionOutcome`]. This is the boundary where errors become a status and
//! a message; nothing past it sees an `Err`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::DispatchEngine;
use crate::error::{Error, Result};
use crate::model::*;
use crate::playbook::{PlaybookRef, PlaybookResolver};
use crate::repository::{CreateResult, MarkerRepository, NewMarker};
use crate::rest::{HttpTransport, RestGateway, Transport};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters of `schedule_playbook`.
#[derive(Debug, Clone, Default)]
pub struct ScheduleRequest {
    pub delay_purpose: String,
    pub duration_unit: String,
    pub delay_duration: i64,
    pub playbook: String,
    pub playbook_scope: String,
    pub artifact_id: Option<String>,
    pub container_id: Option<String>,
    pub input_data: Option<String>,
}

/// Parameters of `execute_playbook`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub playbook: String,
    pub playbook_scope: String,
    pub artifact_id: Option<String>,
    pub container_id: Option<String>,
    pub input_data: Option<String>,
}

/// Parameters of `clear_scheduled_playbooks`.
#[derive(Debug, Clone, Default)]
pub struct ClearRequest {
    pub cancellation_reason: String,
    pub container_id: Option<String>,
}

/// Parameters of `count_runner_artifacts`.
#[derive(Debug, Clone, Default)]
pub struct CountRequest {
    pub playbook_filter: Option<String>,
    pub label_filter: Option<String>,
}

/// One invocation of the action surface.
#[derive(Debug, Clone)]
pub enum Action {
    SchedulePlaybook(ScheduleRequest),
    ExecutePlaybook(ExecuteRequest),
    ClearScheduledPlaybooks(ClearRequest),
    CountRunnerArtifacts(CountRequest),
    OnPoll,
    TestConnectivity,
}

impl Action {
    /// Identifier of the action, as named on the action surface.
    pub fn id(&self) -> &'static str {
        match self {
            Action::SchedulePlaybook(_) => "schedule_playbook",
            Action::ExecutePlaybook(_) => "execute_playbook",
            Action::ClearScheduledPlaybooks(_) => "clear_scheduled_playbooks",
            Action::CountRunnerArtifacts(_) => "count_runner_artifacts",
            Action::OnPoll => "on_poll",
            Action::TestConnectivity => "test_connectivity",
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failure,
}

/// Caller-visible result of an action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ActionOutcome {
    pub fn success(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            status: ActionStatus::Success,
            message: message.into(),
            data,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failure,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Input normalization
// ---------------------------------------------------------------------------

/// Turn the caller's scope selector into a stored scope plus an optional
/// explicit case.
///
/// - `"artifact"` targets the single artifact `artifact_id`.
/// - `"container all"` / `"container new"` target the case `container_id`
///   (or the invocation's case when that is empty).
/// - `"all"` / `"new"` target the invocation's case.
pub fn normalize_scope(
    scope_spec: &str,
    artifact_id: Option<&str>,
    container_id: Option<&str>,
) -> Result<(Scope, Option<CaseId>)> {
    let spec = scope_spec.split_whitespace().collect::<Vec<_>>().join(" ");

    if spec == "artifact" {
        let id = artifact_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InputFormat("artifact scope requires an artifact id".into()))?;
        return Ok((Scope::Targets(vec![id.to_string()]), None));
    }

    let (keyword, container_qualified) = match spec.strip_prefix("container ") {
        Some(keyword) => (keyword, true),
        None => (spec.as_str(), false),
    };
    let scope = match keyword {
        "all" => Scope::all(),
        "new" => Scope::new_artifacts(),
        _ => {
            return Err(Error::InputFormat(format!(
                "unrecognized playbook scope '{spec}'"
            )));
        }
    };

    let case_id = match container_id.map(str::trim).filter(|c| !c.is_empty()) {
        Some(raw) if container_qualified => Some(raw.parse::<CaseId>()?),
        _ => None,
    };
    Ok((scope, case_id))
}

/// Parse `input_data` as a JSON object, falling back to single-quoted
/// dictionary syntax by swapping quote characters.
pub fn parse_input_data(raw: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };

    let parsed = serde_json::from_str::<Value>(raw)
        .or_else(|_| serde_json::from_str::<Value>(&raw.replace('\'', "\"")))
        .map_err(|_| {
            Error::InputFormat(
                "input data was provided but could not be loaded as json".to_string(),
            )
        })?;

    if !parsed.is_object() {
        return Err(Error::InputFormat(
            "input data must be a key/value object".to_string(),
        ));
    }
    Ok(Some(parsed))
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Composes the repository, resolver and engine for one invocation context.
pub struct Runner {
    markers: MarkerRepository,
    playbooks: PlaybookResolver,
    engine: Arc<DispatchEngine>,
}

impl Runner {
    /// `current_case` is the case this invocation is attached to, if any.
    pub fn new(gateway: RestGateway, current_case: Option<CaseId>, limit: usize) -> Self {
        let markers = MarkerRepository::new(gateway.clone(), current_case);
        let playbooks = PlaybookResolver::new(gateway);
        let engine = Arc::new(DispatchEngine::new(
            markers.clone(),
            playbooks.clone(),
            limit,
        ));
        Self {
            markers,
            playbooks,
            engine,
        }
    }

    /// Runner talking HTTPS to the configured platform.
    pub fn from_config(config: &Config, current_case: Option<CaseId>) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::from_config(config)?);
        let gateway = RestGateway::new(transport, config.base_url());
        Ok(Self::new(gateway, current_case, config.playbook_limit))
    }

    pub fn engine(&self) -> Arc<DispatchEngine> {
        Arc::clone(&self.engine)
    }

    pub fn markers(&self) -> &MarkerRepository {
        &self.markers
    }

    /// Run one action.
    pub async fn handle(&self, action: Action) -> ActionOutcome {
        info!(action_id = action.id(), "handling action");
        match action {
            Action::SchedulePlaybook(req) => self.schedule_playbook(req).await,
            Action::ExecutePlaybook(req) => self.execute_playbook(req).await,
            Action::ClearScheduledPlaybooks(req) => self.clear_scheduled_playbooks(req).await,
            Action::CountRunnerArtifacts(req) => self.count_runner_artifacts(req).await,
            Action::OnPoll => self.on_poll().await,
            Action::TestConnectivity => self.test_connectivity().await,
        }
    }

    /// Store a pending marker and tag its case as waiting.
    pub async fn schedule_playbook(&self, req: ScheduleRequest) -> ActionOutcome {
        match self.try_schedule(req).await {
            Ok((id, case_id)) => ActionOutcome::success(
                "Successfully completed execution delay",
                Some(json!({"marker_id": id, "case_id": case_id})),
            ),
            Err(e) => fail("artifact creation failed", e),
        }
    }

    async fn try_schedule(&self, req: ScheduleRequest) -> Result<(Option<MarkerId>, CaseId)> {
        let comment = req.delay_purpose.trim();
        if comment.is_empty() {
            return Err(Error::InputFormat("delay purpose is required".into()));
        }
        let unit: DurationUnit = req.duration_unit.parse()?;
        let duration = u32::try_from(req.delay_duration)
            .ok()
            .filter(|d| *d > 0)
            .ok_or_else(|| {
                Error::InputFormat(format!(
                    "delay duration must be a positive integer (got {})",
                    req.delay_duration
                ))
            })?;
        if unit.after(duration, Utc::now()).is_none() {
            return Err(Error::InputFormat(format!(
                "delay of {duration} {unit} is too far in the future"
            )));
        }
        PlaybookRef::parse(&req.playbook)?;
        let (scope, case_id) = normalize_scope(
            &req.playbook_scope,
            req.artifact_id.as_deref(),
            req.container_id.as_deref(),
        )?;
        let inputs = parse_input_data(req.input_data.as_deref())?;

        let created = self
            .markers
            .create(NewMarker {
                comment: Some(comment.to_string()),
                duration_unit: Some(unit),
                duration: Some(duration),
                playbook: req.playbook.trim().to_string(),
                scope,
                case_id,
                inputs,
            })
            .await?;
        let CreateResult::Persisted { id, case_id } = created else {
            return Err(Error::Other("scheduled marker was not persisted".into()));
        };

        self.markers.add_waiting_tag(case_id).await?;
        Ok((id, case_id))
    }

    /// Trigger a playbook right away, without a pending marker.
    pub async fn execute_playbook(&self, req: ExecuteRequest) -> ActionOutcome {
        match self.try_execute(req).await {
            Ok(response) => {
                ActionOutcome::success("Successfully completed execution", Some(response))
            }
            Err(e) => fail("playbook execution failed", e),
        }
    }

    async fn try_execute(&self, req: ExecuteRequest) -> Result<Value> {
        PlaybookRef::parse(&req.playbook)?;
        let (scope, case_id) = normalize_scope(
            &req.playbook_scope,
            req.artifact_id.as_deref(),
            req.container_id.as_deref(),
        )?;
        let inputs = parse_input_data(req.input_data.as_deref())?;

        let created = self
            .markers
            .create(NewMarker {
                comment: None,
                duration_unit: None,
                duration: None,
                playbook: req.playbook.trim().to_string(),
                scope,
                case_id,
                inputs,
            })
            .await?;
        let CreateResult::Draft(draft) = created else {
            return Err(Error::Other("immediate execution produced a stored marker".into()));
        };

        self.playbooks
            .trigger(&draft.run_request())
            .await
            .map_err(Error::rest("playbook run"))
    }

    /// Clear the waiting tag and halt every pending marker of a case.
    pub async fn clear_scheduled_playbooks(&self, req: ClearRequest) -> ActionOutcome {
        match self.try_clear(req).await {
            Ok((case_id, summary)) => ActionOutcome::success(
                "Successfully halted execution",
                Some(json!({
                    "case_id": case_id,
                    "halted": summary.halted,
                    "failed": summary.failed,
                })),
            ),
            Err(e) => fail("halting scheduled playbooks failed", e),
        }
    }

    async fn try_clear(
        &self,
        req: ClearRequest,
    ) -> Result<(CaseId, crate::repository::HaltSummary)> {
        let explicit = match req.container_id.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(raw.parse::<CaseId>()?),
            _ => None,
        };
        let case_id = self.markers.resolve_case(explicit)?;

        self.markers.remove_tag(case_id, WAITING_TAG).await?;
        let summary = self
            .markers
            .halt_all_pending_for_case(case_id, &req.cancellation_reason)
            .await?;
        if self.markers.reconcile_waiting_tag(case_id).await? {
            warn!(%case_id, failed = summary.failed.len(), "markers left pending, waiting tag restored");
        }
        Ok((case_id, summary))
    }

    /// Count runner markers on the invocation's case.
    pub async fn count_runner_artifacts(&self, req: CountRequest) -> ActionOutcome {
        let result: Result<u64> = async {
            let case_id = self.markers.resolve_case(None)?;
            self.markers
                .count(
                    case_id,
                    non_empty(req.playbook_filter.as_deref()),
                    non_empty(req.label_filter.as_deref()),
                )
                .await
        }
        .await;

        match result {
            Ok(count) => {
                info!(count, "runner artifact count");
                ActionOutcome::success(
                    "Successfully completed artifact count",
                    Some(json!({"runner_artifact_count": count})),
                )
            }
            Err(e) => fail("failed to retrieve runner artifact count", e),
        }
    }

    /// Run one dispatch cycle against the wall clock.
    pub async fn on_poll(&self) -> ActionOutcome {
        self.on_poll_at(Utc::now()).await
    }

    /// Run one dispatch cycle as if the time were `now`.
    pub async fn on_poll_at(&self, now: DateTime<Utc>) -> ActionOutcome {
        match self.engine.run_cycle_at(now).await {
            Ok(report) => ActionOutcome::success(
                format!("{} playbooks executed", report.dispatched),
                serde_json::to_value(&report).ok(),
            ),
            Err(e) => fail("error processing artifacts and playbooks", e),
        }
    }

    /// Check the version endpoint.
    pub async fn test_connectivity(&self) -> ActionOutcome {
        let gateway = self.markers.gateway();
        let url = gateway.url_for("rest/version");
        info!(%url, "attempting connectivity test");

        match gateway.get("rest/version").await {
            Ok(body) => match body.get("version").and_then(Value::as_str) {
                Some(version) => {
                    info!(version, "passed connection test");
                    ActionOutcome::success(
                        format!("Passed connection test (platform version {version})"),
                        Some(json!({"version": version})),
                    )
                }
                None => {
                    error!(%url, "version endpoint answered without a version");
                    ActionOutcome::failure(format!("Failed to reach test url {url}"))
                }
            },
            Err(e) => {
                error!(%url, error = %e, "failed connection test, check the cluster base url");
                ActionOutcome::failure(format!("Failed to reach test url {url}"))
            }
        }
    }
}

fn fail(context: &str, e: Error) -> ActionOutcome {
    error!(error = %e, "{context}");
    ActionOutcome::failure(format!("{context}: {e}"))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
