//! Playbook resolution and execution trigger.
//!
//! A playbook is addressed as `<repo>/<name>`. Resolution is done fresh for
//! every decision; nothing is cached between calls.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{PlaybookInfo, PlaybookRun};
use crate::rest::{RestError, RestGateway, quoted};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// A `<repo>/<name>` reference split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybookRef<'a> {
    pub repo: &'a str,
    pub name: &'a str,
}

impl<'a> PlaybookRef<'a> {
    /// Split at the first `/`. Both halves must be non-empty.
    pub fn parse(reference: &'a str) -> Result<Self> {
        match reference.split_once('/') {
            Some((repo, name)) if !repo.trim().is_empty() && !name.trim().is_empty() => {
                Ok(Self {
                    repo: repo.trim(),
                    name: name.trim(),
                })
            }
            _ => Err(Error::PlaybookReference(reference.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct PlaybookResolver {
    gateway: RestGateway,
}

impl PlaybookResolver {
    pub fn new(gateway: RestGateway) -> Self {
        Self { gateway }
    }

    /// Look up a playbook by reference.
    ///
    /// `Ok(None)` when the reference is malformed or either the repository
    /// or the playbook does not exist. `Err` only when a lookup itself
    /// failed, so callers can tell "missing" from "could not ask".
    pub async fn resolve(&self, reference: &str) -> Result<Option<PlaybookInfo>> {
        let parsed = match PlaybookRef::parse(reference) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(reference, "{e}");
                return Ok(None);
            }
        };

        let repos = self
            .gateway
            .get(&format!(
                "rest/scm?page_size=0&_filter_name={}",
                quoted(parsed.repo)
            ))
            .await
            .map_err(Error::rest("repository lookup"))?;
        let Some(repo_id) = first(&repos).and_then(|r| r.get("id")).and_then(Value::as_i64)
        else {
            debug!(repo = parsed.repo, "repository not found");
            return Ok(None);
        };

        let playbooks = self
            .gateway
            .get(&format!(
                "rest/playbook?page_size=1&_filter_name={}&_filter_scm={repo_id}",
                quoted(parsed.name)
            ))
            .await
            .map_err(Error::rest("playbook lookup"))?;
        let Some(playbook) = first(&playbooks) else {
            debug!(repo = parsed.repo, name = parsed.name, "playbook not found");
            return Ok(None);
        };

        serde_json::from_value(playbook.clone())
            .map(Some)
            .map_err(|e| Error::Malformed(format!("playbook {reference}: {e}")))
    }

    /// True iff the playbook resolves and may run on a case with `case_label`.
    pub async fn is_valid_for_case(&self, reference: &str, case_label: &str) -> Result<bool> {
        Ok(self
            .resolve(reference)
            .await?
            .is_some_and(|playbook| playbook.allows_label(case_label)))
    }

    /// Ask the platform to run a playbook. Returns the raw trigger response.
    pub async fn trigger(&self, run: &PlaybookRun) -> std::result::Result<Value, RestError> {
        debug!(playbook = %run.playbook_id, case_id = %run.container_id, "triggering playbook");
        let result = self.gateway.post("rest/playbook_run", run).await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::playbooks_triggered().add(1, &[KeyValue::new("result", outcome)]);
        match &result {
            Ok(_) => info!(playbook = %run.playbook_id, case_id = %run.container_id, "playbook triggered"),
            Err(e) => warn!(playbook = %run.playbook_id, case_id = %run.container_id, error = %e, "playbook trigger failed"),
        }
        result
    }
}

fn first(list: &Value) -> Option<&Value> {
    list.as_array().and_then(|rows| rows.first())
}
