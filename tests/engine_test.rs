//! Integration tests for the dispatch engine against the in-memory platform.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use playbook_runner::actions::{Runner, ScheduleRequest};
use playbook_runner::engine::{Poller, PollerConfig};
use playbook_runner::model::*;
use playbook_runner::rest::{MemoryTransport, RestGateway, Transport};
use serde_json::{Value, json};

struct Fixture {
    platform: Arc<MemoryTransport>,
    t0: DateTime<Utc>,
}

impl Fixture {
    fn new() -> Self {
        let platform = Arc::new(MemoryTransport::new());
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        platform.set_now(t0);
        Self { platform, t0 }
    }

    fn runner(&self, current_case: Option<CaseId>, limit: usize) -> Runner {
        let transport: Arc<dyn Transport> = self.platform.clone();
        Runner::new(
            RestGateway::new(transport, "https://soar.test"),
            current_case,
            limit,
        )
    }

    fn at(&self, secs: i64) -> DateTime<Utc> {
        self.t0 + TimeDelta::seconds(secs)
    }

    /// Case labelled `events` with a `local/triage` playbook allowed on it.
    fn events_case(&self) -> CaseId {
        let case = self.platform.add_case("events");
        let repo = self.platform.add_repo("local");
        self.platform.add_playbook(repo, "triage", &["events"]);
        case
    }

    /// Store a pending marker directly, bypassing the action surface.
    fn raw_marker(&self, case: CaseId, cef: Value) -> MarkerId {
        self.platform.insert_artifact(json!({
            "container": case.0,
            "label": "pending",
            "name": MARKER_NAME,
            "cef": cef,
        }))
    }
}

fn minutes(n: u32, playbook: &str) -> ScheduleRequest {
    ScheduleRequest {
        delay_purpose: "wait for enrichment".into(),
        duration_unit: "Minutes".into(),
        delay_duration: i64::from(n),
        playbook: playbook.into(),
        playbook_scope: "all".into(),
        ..Default::default()
    }
}

fn marker_ids(platform: &MemoryTransport) -> Vec<MarkerId> {
    platform
        .artifacts()
        .iter()
        .filter_map(|a| a["id"].as_i64().map(MarkerId))
        .collect()
}

// ---------------------------------------------------------------------------
// Expiration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn marker_waits_until_expired_then_runs() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 4);

    let scheduled = runner.schedule_playbook(minutes(1, "local/triage")).await;
    assert!(scheduled.is_success(), "{}", scheduled.message);
    assert!(fx.platform.tags(case).contains(&WAITING_TAG.to_string()));
    let marker = marker_ids(&fx.platform)[0];
    assert_eq!(fx.platform.label_of(marker).as_deref(), Some("pending"));

    let report = runner.engine().run_cycle_at(fx.at(30)).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.waiting, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(fx.platform.label_of(marker).as_deref(), Some("pending"));
    assert!(fx.platform.runs().is_empty());

    let report = runner.engine().run_cycle_at(fx.at(61)).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(fx.platform.label_of(marker).as_deref(), Some("complete"));
    assert!(!fx.platform.tags(case).contains(&WAITING_TAG.to_string()));

    let runs = fx.platform.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["container_id"], json!(case.0));
    assert_eq!(runs[0]["playbook_id"], "local/triage");
    assert_eq!(runs[0]["scope"], "all");
    assert_eq!(runs[0]["run"], "true");

    let stored = fx.platform.artifact(marker).unwrap();
    assert_eq!(stored["cef"]["comment"], "wait for enrichment");
    assert!(
        stored["cef"]["exeComment"]
            .as_str()
            .unwrap()
            .starts_with("Execution run at")
    );
    assert!(stored["cef"]["rest_response"]["playbook_run_id"].is_number());
}

#[tokio::test]
async fn expiration_boundary_is_inclusive() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 4);
    runner.schedule_playbook(minutes(1, "local/triage")).await;

    let report = runner.engine().run_cycle_at(fx.at(60)).await.unwrap();
    assert_eq!(report.dispatched, 1);
}

#[tokio::test]
async fn hours_and_days_use_their_own_span() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 4);

    let hours = ScheduleRequest {
        duration_unit: "Hours".into(),
        ..minutes(2, "local/triage")
    };
    let days = ScheduleRequest {
        duration_unit: "Days".into(),
        ..minutes(1, "local/triage")
    };
    assert!(runner.schedule_playbook(hours).await.is_success());
    assert!(runner.schedule_playbook(days).await.is_success());

    let report = runner.engine().run_cycle_at(fx.at(119 * 60)).await.unwrap();
    assert_eq!(report.dispatched, 0);

    let report = runner.engine().run_cycle_at(fx.at(2 * 3600)).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.waiting, 1);

    let report = runner.engine().run_cycle_at(fx.at(86_400)).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert!(!fx.platform.tags(case).contains(&WAITING_TAG.to_string()));
}

#[tokio::test]
async fn waiting_tag_stays_while_another_marker_is_pending() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 4);
    runner.schedule_playbook(minutes(1, "local/triage")).await;
    runner.schedule_playbook(minutes(10, "local/triage")).await;

    runner.engine().run_cycle_at(fx.at(60)).await.unwrap();
    assert!(fx.platform.tags(case).contains(&WAITING_TAG.to_string()));

    runner.engine().run_cycle_at(fx.at(600)).await.unwrap();
    assert!(!fx.platform.tags(case).contains(&WAITING_TAG.to_string()));
}

#[tokio::test]
async fn string_duration_is_accepted() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(None, 4);
    let marker = fx.raw_marker(
        case,
        json!({
            "comment": "legacy",
            "durationUnit": "Minutes",
            "duration": "5",
            "playbook": "local/triage",
            "scope": "new",
        }),
    );

    let report = runner.engine().run_cycle_at(fx.at(300)).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(fx.platform.label_of(marker).as_deref(), Some("complete"));
    assert_eq!(fx.platform.runs()[0]["scope"], "new");
}

// ---------------------------------------------------------------------------
// Ordering and budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn budget_caps_dispatches_and_oldest_run_first() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 2);
    for _ in 0..3 {
        assert!(runner.schedule_playbook(minutes(1, "local/triage")).await.is_success());
    }
    let ids = marker_ids(&fx.platform);

    let report = runner.engine().run_cycle_at(fx.at(120)).await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert!(report.budget_exhausted);
    assert_eq!(fx.platform.label_of(ids[0]).as_deref(), Some("complete"));
    assert_eq!(fx.platform.label_of(ids[1]).as_deref(), Some("complete"));
    assert_eq!(fx.platform.label_of(ids[2]).as_deref(), Some("pending"));
    assert!(fx.platform.tags(case).contains(&WAITING_TAG.to_string()));

    let report = runner.engine().run_cycle_at(fx.at(180)).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert!(!report.budget_exhausted);
    assert_eq!(fx.platform.label_of(ids[2]).as_deref(), Some("complete"));
    assert_eq!(fx.platform.runs().len(), 3);
}

#[tokio::test]
async fn invalid_markers_do_not_use_budget() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 1);
    runner.schedule_playbook(minutes(1, "local/missing")).await;
    runner.schedule_playbook(minutes(1, "local/triage")).await;
    let ids = marker_ids(&fx.platform);

    let report = runner.engine().run_cycle_at(fx.at(60)).await.unwrap();
    assert_eq!(report.invalid, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(fx.platform.label_of(ids[0]).as_deref(), Some("invalid playbook"));
    assert_eq!(fx.platform.label_of(ids[1]).as_deref(), Some("complete"));
}

#[tokio::test]
async fn exact_budget_is_not_reported_as_exhausted() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 2);
    runner.schedule_playbook(minutes(1, "local/triage")).await;
    runner.schedule_playbook(minutes(1, "local/triage")).await;

    let report = runner.engine().run_cycle_at(fx.at(60)).await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert!(!report.budget_exhausted);
}

// ---------------------------------------------------------------------------
// Playbook validity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn playbook_not_allowed_for_label_is_invalid() {
    let fx = Fixture::new();
    let case = fx.platform.add_case("events");
    let repo = fx.platform.add_repo("local");
    fx.platform.add_playbook(repo, "triage", &["incident"]);
    let runner = fx.runner(Some(case), 4);
    runner.schedule_playbook(minutes(1, "local/triage")).await;
    let marker = marker_ids(&fx.platform)[0];

    let report = runner.engine().run_cycle_at(fx.at(60)).await.unwrap();
    assert_eq!(report.invalid, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(fx.platform.label_of(marker).as_deref(), Some("invalid playbook"));
    assert!(fx.platform.runs().is_empty());
    assert!(!fx.platform.tags(case).contains(&WAITING_TAG.to_string()));
}

#[tokio::test]
async fn wildcard_label_allows_any_case() {
    let fx = Fixture::new();
    let case = fx.platform.add_case("phishing");
    let repo = fx.platform.add_repo("community");
    fx.platform.add_playbook(repo, "notify", &["*"]);
    let runner = fx.runner(Some(case), 4);
    runner.schedule_playbook(minutes(1, "community/notify")).await;

    let report = runner.engine().run_cycle_at(fx.at(60)).await.unwrap();
    assert_eq!(report.dispatched, 1);
}

#[tokio::test]
async fn unknown_repository_is_invalid() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 4);
    runner.schedule_playbook(minutes(1, "elsewhere/triage")).await;

    let report = runner.engine().run_cycle_at(fx.at(60)).await.unwrap();
    assert_eq!(report.invalid, 1);
}

#[tokio::test]
async fn unreadable_schedule_is_retired_as_invalid() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(None, 4);
    let marker = fx.raw_marker(
        case,
        json!({
            "comment": "bad unit",
            "durationUnit": "Weeks",
            "duration": 1,
            "playbook": "local/triage",
            "scope": "all",
        }),
    );

    let report = runner.engine().run_cycle_at(fx.at(1)).await.unwrap();
    assert_eq!(report.invalid, 1);
    assert_eq!(fx.platform.label_of(marker).as_deref(), Some("invalid playbook"));
    let stored = fx.platform.artifact(marker).unwrap();
    assert!(
        stored["cef"]["exeComment"]
            .as_str()
            .unwrap()
            .contains("unreadable")
    );
    assert_eq!(stored["cef"]["durationUnit"], "Weeks");
}

#[tokio::test]
async fn unreadable_creation_time_is_retired_and_tag_follows() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 4);
    runner.schedule_playbook(minutes(1, "local/triage")).await;
    let good = marker_ids(&fx.platform)[0];
    let bad = fx.platform.insert_artifact(json!({
        "container": case.0,
        "label": "pending",
        "name": MARKER_NAME,
        "create_time": "not-a-time",
        "cef": {
            "comment": "imported",
            "durationUnit": "Minutes",
            "duration": 1,
            "playbook": "local/triage",
            "scope": "all",
        },
    }));

    let report = runner.engine().run_cycle_at(fx.at(300)).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.invalid, 1);
    assert_eq!(fx.platform.label_of(good).as_deref(), Some("complete"));
    assert_eq!(fx.platform.label_of(bad).as_deref(), Some("invalid playbook"));
    assert!(fx.platform.tags(case).is_empty());
    assert_eq!(fx.platform.runs().len(), 1);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pending_scan_failure_is_an_empty_cycle() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 4);
    runner.schedule_playbook(minutes(1, "local/triage")).await;
    fx.platform.fail_requests_matching("rest/artifact?");

    let outcome = runner.on_poll_at(fx.at(60)).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.message, "0 playbooks executed");

    fx.platform.clear_failures();
    let outcome = runner.on_poll_at(fx.at(60)).await;
    assert_eq!(outcome.message, "1 playbooks executed");
}

#[tokio::test]
async fn case_lookup_failure_aborts_cycle_keeping_earlier_transitions() {
    let fx = Fixture::new();
    let first_case = fx.events_case();
    let second_case = fx.platform.add_case("events");
    let first = fx.runner(Some(first_case), 4);
    let second = fx.runner(Some(second_case), 4);
    first.schedule_playbook(minutes(1, "local/triage")).await;
    second.schedule_playbook(minutes(1, "local/triage")).await;
    let ids = marker_ids(&fx.platform);

    fx.platform
        .fail_requests_matching(&format!("rest/container/{}", second_case.0));
    let result = first.engine().run_cycle_at(fx.at(60)).await;
    assert!(result.is_err());
    assert_eq!(fx.platform.label_of(ids[0]).as_deref(), Some("complete"));
    assert_eq!(fx.platform.label_of(ids[1]).as_deref(), Some("pending"));

    let outcome = first.on_poll_at(fx.at(60)).await;
    assert!(!outcome.is_success());

    fx.platform.clear_failures();
    let report = first.engine().run_cycle_at(fx.at(60)).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(fx.platform.label_of(ids[1]).as_deref(), Some("complete"));
}

#[tokio::test]
async fn trigger_failure_still_completes_marker() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 4);
    runner.schedule_playbook(minutes(1, "local/triage")).await;
    let marker = marker_ids(&fx.platform)[0];
    fx.platform.fail_requests_matching("rest/playbook_run");

    let report = runner.engine().run_cycle_at(fx.at(60)).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(fx.platform.label_of(marker).as_deref(), Some("complete"));
    let stored = fx.platform.artifact(marker).unwrap();
    assert!(
        stored["cef"]["exeComment"]
            .as_str()
            .unwrap()
            .contains("trigger failed")
    );
}

#[tokio::test]
async fn terminal_markers_are_never_rescanned() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 4);
    runner.schedule_playbook(minutes(1, "local/triage")).await;

    runner.engine().run_cycle_at(fx.at(60)).await.unwrap();
    let report = runner.engine().run_cycle_at(fx.at(600)).await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(fx.platform.runs().len(), 1);
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poller_dispatches_until_shut_down() {
    let fx = Fixture::new();
    let case = fx.events_case();
    let runner = fx.runner(Some(case), 4);
    // Stored at t0, long before the wall clock the poller uses.
    runner.schedule_playbook(minutes(1, "local/triage")).await;
    let marker = marker_ids(&fx.platform)[0];

    let poller = Poller::new(
        runner.engine(),
        PollerConfig {
            interval: std::time::Duration::from_millis(10),
        },
    );
    let handle = tokio::spawn({
        let poller = poller.clone();
        async move { poller.run().await }
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    poller.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(fx.platform.label_of(marker).as_deref(), Some("complete"));
    assert_eq!(fx.platform.runs().len(), 1);
}
