//! Core data model.
//!
//! A marker is a scheduled playbook request stored in the case-management
//! platform as an artifact. Its payload (the artifact `cef` map) carries the
//! schedule; its label carries the lifecycle state. A case is the platform
//! container the marker hangs off.

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Artifact name that identifies records created by this runner.
pub const MARKER_NAME: &str = "scheduled playbook";

/// Case tag present while at least one marker is pending.
pub const WAITING_TAG: &str = "waiting";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Record id of a marker, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerId(pub i64);

impl std::fmt::Display for MarkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record id of a case (platform container).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(pub i64);

impl std::fmt::Display for CaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse()
            .map(CaseId)
            .map_err(|_| Error::InputFormat(format!("case id must be numeric: {s}")))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a marker, stored as the artifact label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerState {
    /// Waiting for its delay to expire.
    #[serde(rename = "pending")]
    Pending,
    /// Playbook was triggered. Terminal.
    #[serde(rename = "complete")]
    Complete,
    /// Playbook missing or not allowed for the case label. Terminal.
    #[serde(rename = "invalid playbook")]
    InvalidPlaybook,
    /// Cancelled before expiry. Terminal.
    #[serde(rename = "halted")]
    Halted,
}

impl MarkerState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: MarkerState) -> bool {
        use MarkerState::*;
        matches!(
            (self, to),
            (Pending, Complete) | (Pending, InvalidPlaybook) | (Pending, Halted)
        )
    }

    pub fn as_label(self) -> &'static str {
        match self {
            MarkerState::Pending => "pending",
            MarkerState::Complete => "complete",
            MarkerState::InvalidPlaybook => "invalid playbook",
            MarkerState::Halted => "halted",
        }
    }
}

impl std::fmt::Display for MarkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Unit the delay magnitude is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurationUnit {
    Minutes,
    Hours,
    Days,
}

impl DurationUnit {
    /// Span covered by `amount` of this unit, or `None` if out of range.
    pub fn span(self, amount: u32) -> Option<TimeDelta> {
        let amount = i64::from(amount);
        match self {
            DurationUnit::Minutes => TimeDelta::try_minutes(amount),
            DurationUnit::Hours => TimeDelta::try_hours(amount),
            DurationUnit::Days => TimeDelta::try_days(amount),
        }
    }

    /// `from` plus `amount` of this unit, or `None` past chrono's range.
    pub fn after(self, amount: u32, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.span(amount)
            .and_then(|span| from.checked_add_signed(span))
    }
}

impl std::fmt::Display for DurationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DurationUnit::Minutes => "Minutes",
            DurationUnit::Hours => "Hours",
            DurationUnit::Days => "Days",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DurationUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Minutes" => Ok(DurationUnit::Minutes),
            "Hours" => Ok(DurationUnit::Hours),
            "Days" => Ok(DurationUnit::Days),
            other => Err(Error::InputFormat(format!(
                "duration unit must be one of Minutes, Hours, Days (got '{other}')"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Target set a playbook runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scope {
    /// `"all"` or `"new"` artifacts of the case.
    Keyword(ScopeKeyword),
    /// Explicit artifact ids.
    Targets(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKeyword {
    All,
    New,
}

impl Scope {
    pub fn all() -> Self {
        Scope::Keyword(ScopeKeyword::All)
    }

    pub fn new_artifacts() -> Self {
        Scope::Keyword(ScopeKeyword::New)
    }
}

// ---------------------------------------------------------------------------
// Marker payload
// ---------------------------------------------------------------------------

/// Typed view of a marker's `cef` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerPayload {
    pub comment: String,
    #[serde(rename = "durationUnit")]
    pub duration_unit: DurationUnit,
    #[serde(deserialize_with = "duration_from_number_or_string")]
    pub duration: u32,
    pub playbook: String,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
}

impl MarkerPayload {
    /// Instant the delay runs out, anchored on the store's creation time.
    ///
    /// `None` if the sum does not fit a timestamp; such a marker never expires.
    pub fn expires_at(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration_unit.after(self.duration, created_at)
    }

    /// Expired iff `now` is at or past the expiration instant.
    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.expires_at(created_at)
            .is_some_and(|expiration| expiration <= now)
    }
}

/// Other creators store the magnitude as a string.
fn duration_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| de::Error::custom(format!("duration out of range: {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("duration is not a number: {s}"))),
        other => Err(de::Error::custom(format!("duration has wrong type: {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Marker
// ---------------------------------------------------------------------------

/// A marker record as read back from the store.
///
/// The payload is kept as the raw `cef` map so updates can merge into it
/// without dropping fields this crate does not know about.
///
/// Only `id`, `container` and `label` are required. A record with an
/// unreadable `create_time` or a non-map `cef` still loads, so it can be
/// retired instead of sitting in `pending` forever.
#[derive(Debug, Clone, Deserialize)]
pub struct Marker {
    pub id: MarkerId,
    #[serde(rename = "container")]
    pub case_id: CaseId,
    #[serde(rename = "label")]
    pub state: MarkerState,
    #[serde(rename = "create_time", default, deserialize_with = "lenient_time")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "map_or_empty")]
    pub cef: Map<String, Value>,
}

fn lenient_time<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse::<DateTime<Utc>>().ok(),
        _ => None,
    })
}

fn map_or_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

impl Marker {
    /// Parse the typed schedule out of the raw payload.
    pub fn payload(&self) -> Result<MarkerPayload> {
        serde_json::from_value(Value::Object(self.cef.clone()))
            .map_err(|e| Error::Malformed(format!("marker {} payload: {e}", self.id)))
    }

    /// Payload plus creation instant: everything expiry needs.
    pub fn schedule(&self) -> Result<(MarkerPayload, DateTime<Utc>)> {
        let payload = self.payload()?;
        let created_at = self.created_at.ok_or_else(|| {
            Error::Malformed(format!("marker {} has no readable create_time", self.id))
        })?;
        Ok((payload, created_at))
    }

    /// Request that runs this marker's playbook against its case.
    pub fn run_request(&self, payload: &MarkerPayload) -> PlaybookRun {
        PlaybookRun::new(
            self.case_id,
            payload.playbook.clone(),
            payload.scope.clone(),
            payload.inputs.clone(),
        )
    }
}

/// Transient marker shape for immediate execution. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerDraft {
    pub case_id: CaseId,
    pub playbook: String,
    pub scope: Scope,
    pub inputs: Option<Value>,
}

impl MarkerDraft {
    pub fn run_request(&self) -> PlaybookRun {
        PlaybookRun::new(
            self.case_id,
            self.playbook.clone(),
            self.scope.clone(),
            self.inputs.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Case and playbook
// ---------------------------------------------------------------------------

/// The slice of a platform container this crate reads.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Case {
    pub id: CaseId,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Resolved playbook: id plus the case labels it may run against.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlaybookInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl PlaybookInfo {
    /// Label is in the allow-list, or the allow-list has the `*` wildcard.
    pub fn allows_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == "*" || l == label)
    }
}

/// Body of a `playbook_run` trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybookRun {
    pub container_id: CaseId,
    /// `<repo>/<name>` reference; the platform resolves it.
    pub playbook_id: String,
    pub scope: Scope,
    pub run: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
}

impl PlaybookRun {
    pub fn new(case_id: CaseId, playbook: String, scope: Scope, inputs: Option<Value>) -> Self {
        Self {
            container_id: case_id,
            playbook_id: playbook,
            scope,
            run: "true",
            inputs,
        }
    }
}
