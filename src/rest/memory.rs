//! In-memory simulation of the platform REST surface.
//!
//! Covers exactly the endpoints the runner uses: containers, artifacts,
//! source repositories, playbooks, playbook runs and the version endpoint.
//! The clock is settable so expiration can be driven deterministically.
//! Used by the test suite and for dry runs of the CLI.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use super::{Method, RestError, RestRequest, RestResponse, Transport};
use crate::model::{CaseId, MarkerId};

/// Store state behind the transport.
#[derive(Debug)]
struct Store {
    now: DateTime<Utc>,
    next_id: i64,
    containers: BTreeMap<i64, Value>,
    artifacts: BTreeMap<i64, Value>,
    repos: Vec<Value>,
    playbooks: Vec<Value>,
    runs: Vec<Value>,
    failing: Vec<String>,
    offline: bool,
    version: String,
}

impl Store {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct MemoryTransport {
    store: Mutex<Store>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store {
                now: Utc::now(),
                next_id: 0,
                containers: BTreeMap::new(),
                artifacts: BTreeMap::new(),
                repos: Vec::new(),
                playbooks: Vec::new(),
                runs: Vec::new(),
                failing: Vec::new(),
                offline: false,
                version: "6.3.0".to_string(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- clock ---------------------------------------------------------------

    pub fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.lock().now = now;
    }

    // -- seeding -------------------------------------------------------------

    /// Add a case with the given label and no tags.
    pub fn add_case(&self, label: &str) -> CaseId {
        self.add_case_with_tags(label, &[])
    }

    pub fn add_case_with_tags(&self, label: &str, tags: &[&str]) -> CaseId {
        let mut store = self.lock();
        let id = store.allocate_id();
        store.containers.insert(
            id,
            json!({
                "id": id,
                "label": label,
                "tags": tags,
                "data": {},
            }),
        );
        CaseId(id)
    }

    /// Register a source repository and return its id.
    pub fn add_repo(&self, name: &str) -> i64 {
        let mut store = self.lock();
        let id = store.allocate_id();
        store.repos.push(json!({"id": id, "name": name}));
        id
    }

    /// Register a playbook in `repo_id` allowed for `labels`.
    pub fn add_playbook(&self, repo_id: i64, name: &str, labels: &[&str]) -> i64 {
        let mut store = self.lock();
        let id = store.allocate_id();
        store.playbooks.push(json!({
            "id": id,
            "name": name,
            "scm": repo_id,
            "labels": labels,
        }));
        id
    }

    /// Insert an artifact record verbatim, filling in id and create_time.
    pub fn insert_artifact(&self, mut record: Value) -> MarkerId {
        let mut store = self.lock();
        let id = store.allocate_id();
        let created = format_time(store.now);
        if let Some(obj) = record.as_object_mut() {
            obj.insert("id".into(), json!(id));
            obj.entry("create_time").or_insert(json!(created));
        }
        store.artifacts.insert(id, record);
        MarkerId(id)
    }

    // -- inspection ----------------------------------------------------------

    pub fn case(&self, id: CaseId) -> Option<Value> {
        self.lock().containers.get(&id.0).cloned()
    }

    pub fn tags(&self, id: CaseId) -> Vec<String> {
        self.case(id)
            .and_then(|c| serde_json::from_value(c["tags"].clone()).ok())
            .unwrap_or_default()
    }

    pub fn artifact(&self, id: MarkerId) -> Option<Value> {
        self.lock().artifacts.get(&id.0).cloned()
    }

    /// Artifacts in id order.
    pub fn artifacts(&self) -> Vec<Value> {
        self.lock().artifacts.values().cloned().collect()
    }

    /// Label of an artifact, e.g. `"pending"`.
    pub fn label_of(&self, id: MarkerId) -> Option<String> {
        self.artifact(id)
            .and_then(|a| a["label"].as_str().map(str::to_string))
    }

    /// Bodies of every `playbook_run` trigger, in order.
    pub fn runs(&self) -> Vec<Value> {
        self.lock().runs.clone()
    }

    // -- fault injection -----------------------------------------------------

    /// Answer 500 to any request whose path and query contain `fragment`.
    pub fn fail_requests_matching(&self, fragment: &str) {
        self.lock().failing.push(fragment.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Fail every request at the transport level.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    // -- routing -------------------------------------------------------------

    fn handle(&self, request: RestRequest) -> Result<RestResponse, RestError> {
        let mut store = self.lock();
        if store.offline {
            return Err(RestError::Transport(format!(
                "connection refused: {}",
                request.url
            )));
        }

        let target = match request.url.find("/rest/") {
            Some(pos) => request.url[pos + 1..].to_string(),
            None => return Ok(respond(404, json!({"message": "not found"}))),
        };
        if store.failing.iter().any(|f| target.contains(f.as_str())) {
            return Ok(respond(500, json!({"message": "injected failure"})));
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), parse_query(query)),
            None => (target.clone(), Vec::new()),
        };
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let response = match (request.method, segments.as_slice()) {
            (Method::Get, ["rest", "version"]) => {
                respond(200, json!({"version": store.version.clone()}))
            }
            (Method::Get, ["rest", "container", id]) => match lookup(&store.containers, id) {
                Some(container) => respond(200, container.clone()),
                None => not_found("container"),
            },
            (Method::Get, ["rest", "container", id, "artifacts"]) => {
                let Some(case_id) = id.parse::<i64>().ok() else {
                    return Ok(not_found("container"));
                };
                let rows = store
                    .artifacts
                    .values()
                    .filter(|a| a["container"].as_i64() == Some(case_id))
                    .cloned()
                    .collect();
                list(rows, &query)
            }
            (Method::Get, ["rest", "artifact"]) => {
                list(store.artifacts.values().cloned().collect(), &query)
            }
            (Method::Get, ["rest", "scm"]) => list(store.repos.clone(), &query),
            (Method::Get, ["rest", "playbook"]) => list(store.playbooks.clone(), &query),
            (Method::Post, ["rest", "container", id]) => {
                let body = request.body.unwrap_or(Value::Null);
                match id.parse::<i64>().ok().and_then(|k| store.containers.get_mut(&k)) {
                    Some(container) => {
                        merge_into(container, &body);
                        respond(200, json!({"success": true, "id": container["id"].clone()}))
                    }
                    None => not_found("container"),
                }
            }
            (Method::Post, ["rest", "artifact"]) => {
                let mut body = request.body.unwrap_or(Value::Null);
                let Some(obj) = body.as_object_mut() else {
                    return Ok(respond(400, json!({"message": "body must be an object"})));
                };
                let Some(container) = obj.remove("container_id") else {
                    return Ok(respond(400, json!({"message": "container_id is required"})));
                };
                let id = store.allocate_id();
                obj.insert("id".into(), json!(id));
                obj.insert("container".into(), container);
                obj.insert("create_time".into(), json!(format_time(store.now)));
                store.artifacts.insert(id, body);
                respond(200, json!({"success": true, "id": id}))
            }
            (Method::Post, ["rest", "artifact", id]) => {
                let body = request.body.unwrap_or(Value::Null);
                match id.parse::<i64>().ok().and_then(|k| store.artifacts.get_mut(&k)) {
                    Some(artifact) => {
                        merge_into(artifact, &body);
                        respond(200, json!({"success": true, "id": artifact["id"].clone()}))
                    }
                    None => not_found("artifact"),
                }
            }
            (Method::Post, ["rest", "playbook_run"]) => {
                let body = request.body.unwrap_or(Value::Null);
                store.runs.push(body);
                let run_id = store.runs.len();
                respond(
                    200,
                    json!({"playbook_run_id": run_id, "message": "playbook run submitted"}),
                )
            }
            _ => not_found("endpoint"),
        };
        Ok(response)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, request: RestRequest) -> Result<RestResponse, RestError> {
        self.handle(request)
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn respond(status: u16, body: Value) -> RestResponse {
    RestResponse {
        status,
        body: body.to_string(),
    }
}

fn not_found(what: &str) -> RestResponse {
    respond(404, json!({"failed": true, "message": format!("{what} not found")}))
}

fn lookup<'a>(rows: &'a BTreeMap<i64, Value>, id: &str) -> Option<&'a Value> {
    id.parse::<i64>().ok().and_then(|k| rows.get(&k))
}

/// Top-level keys of `patch` replace those of `target`.
fn merge_into(target: &mut Value, patch: &Value) {
    if let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) {
        for (k, v) in patch {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k.to_string(), unquote(v).to_string())
        })
        .collect()
}

fn unquote(v: &str) -> &str {
    v.strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(v)
}

/// Apply `_filter_*`, `sort`/`order` and `page_size` to a collection and
/// wrap it the way platform list endpoints do.
fn list(mut rows: Vec<Value>, query: &[(String, String)]) -> RestResponse {
    for (key, expected) in query {
        let Some(field) = key.strip_prefix("_filter_") else {
            continue;
        };
        let (path, contains) = match field.strip_suffix("__contains") {
            Some(path) => (path, true),
            None => (field, false),
        };
        rows.retain(|row| {
            let actual = field_text(row, path);
            match actual {
                Some(actual) if contains => actual.contains(expected.as_str()),
                Some(actual) => actual == *expected,
                None => false,
            }
        });
    }

    let param = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };
    if let Some(sort) = param("sort") {
        rows.sort_by_key(|row| row[sort].as_i64().unwrap_or(i64::MAX));
        if param("order") == Some("desc") {
            rows.reverse();
        }
    }

    let count = rows.len();
    let page_size = param("page_size")
        .and_then(|p| p.parse::<usize>().ok())
        .unwrap_or(10);
    if page_size > 0 {
        rows.truncate(page_size);
    }
    let num_pages = if page_size == 0 || count == 0 {
        1
    } else {
        count.div_ceil(page_size)
    };

    respond(
        200,
        json!({"count": count, "num_pages": num_pages, "data": rows}),
    )
}

/// Text of a (possibly nested, `__`-separated) field, for filter matching.
fn field_text(row: &Value, path: &str) -> Option<String> {
    let mut current = row;
    for part in path.split("__") {
        current = current.as_object().and_then(|o: &Map<String, Value>| o.get(part))?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
