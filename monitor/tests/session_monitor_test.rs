//! Integration tests for the session monitor lifecycle.
//!
//! Sessions are driven through in-memory transports under a paused clock, so
//! grace delays, poll intervals and timeouts elapse deterministically.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, Instant};

use common::{
    record, settle, FakeJobApi, NeverOpens, Recorder, Refusing, ScriptedTransport, Seen,
    SESSION_ID,
};
use pagelens_monitor::config::MonitorTimings;
use pagelens_monitor::error::MonitorError;
use pagelens_monitor::monitor::SessionMonitor;
use pagelens_monitor::progress::{Condition, Estimate, ProgressHeuristic, ProgressRule};
use pagelens_monitor::terminal::TerminalDetector;
use pagelens_monitor::transport::TransportError;
use pagelens_monitor::types::{ConnectionState, EventType, JobStatus};

// =============================================================================
// Test Helpers
// =============================================================================

/// Starts a monitor over a scripted transport and waits for it to connect.
async fn open_session(api: Arc<FakeJobApi>, recorder: &Recorder) -> (SessionMonitor, common::Feed) {
    let (transport, feed) = ScriptedTransport::new();
    let mut monitor = recorder.attach(SessionMonitor::new(SESSION_ID, transport, api));
    monitor.start();
    settle().await;
    (monitor, feed)
}

// =============================================================================
// Reference Scenarios
// =============================================================================

/// Step text drives progress through the rule table, and `final_result`
/// completes the job exactly once.
#[tokio::test(start_paused = true)]
async fn test_progress_sequence_and_single_completion() {
    let recorder = Recorder::new();
    let (monitor, feed) = open_session(FakeJobApi::new(), &recorder).await;

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.connection_state, ConnectionState::Open);
    assert_eq!(snapshot.job_status, JobStatus::Analyzing);
    assert_eq!(snapshot.progress, 10);

    feed.event("session", json!({ "session_id": SESSION_ID, "status": "connected" }));
    feed.step("analyzing元素 0%");
    feed.step("analyzing elements");
    feed.event("final_result", json!({ "result": { "elements": [] } }));
    settle().await;

    assert_eq!(recorder.progress(), vec![10, 20, 40, 100]);
    assert_eq!(recorder.completions(), 1);
    assert!(recorder.errors().is_empty());
    assert_eq!(
        recorder.statuses(),
        vec![JobStatus::Connecting, JobStatus::Analyzing, JobStatus::Completed]
    );

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.job_status, JobStatus::Completed);
    assert_eq!(snapshot.progress, 100);
    assert_eq!(
        snapshot.last_step_description.as_deref(),
        Some("analyzing elements")
    );
    assert!(snapshot.terminal_fired);
    assert!(!snapshot.is_closed());

    sleep(Duration::from_millis(1000)).await;

    let snapshot = monitor.snapshot();
    assert!(snapshot.is_closed());
    assert_eq!(snapshot.pending_timers, 0);
}

/// A backend error event fails the session once and closes it after the
/// failure grace delay.
#[tokio::test(start_paused = true)]
async fn test_error_event_fails_once_then_closes() {
    let recorder = Recorder::new();
    let (monitor, feed) = open_session(FakeJobApi::new(), &recorder).await;

    feed.event("error", json!({ "message": "model unavailable" }));
    feed.event("error", json!({ "message": "second error" }));
    settle().await;

    assert_eq!(recorder.errors(), vec!["model unavailable".to_string()]);
    assert_eq!(recorder.completions(), 0);
    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.job_status, JobStatus::Failed);
    assert_eq!(snapshot.error_reason.as_deref(), Some("model unavailable"));
    assert!(!snapshot.is_closed());

    let started = Instant::now();
    monitor.closed().await;
    assert!(started.elapsed() >= Duration::from_millis(2900));
    assert_eq!(monitor.snapshot().pending_timers, 0);
}

/// A connection that never opens ends in a timeout failure and a complete
/// teardown.
#[tokio::test(start_paused = true)]
async fn test_connection_never_opens_times_out() {
    let recorder = Recorder::new();
    let mut monitor = recorder.attach(SessionMonitor::new(
        SESSION_ID,
        Arc::new(NeverOpens),
        FakeJobApi::new(),
    ));
    let started = Instant::now();
    monitor.start();

    monitor.closed().await;

    assert!(started.elapsed() >= Duration::from_secs(30));
    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.job_status, JobStatus::Failed);
    assert_eq!(snapshot.pending_timers, 0);
    assert!(snapshot
        .error_reason
        .as_deref()
        .is_some_and(|reason| reason.contains("did not open within 30s")));
    assert_eq!(recorder.errors().len(), 1);
    assert_eq!(recorder.completions(), 0);
}

/// With a connect deadline longer than the watchdog, the watchdog fails the
/// session instead.
#[tokio::test(start_paused = true)]
async fn test_watchdog_fires_before_connect_deadline() {
    let recorder = Recorder::new();
    let timings = MonitorTimings {
        connect_timeout: Duration::from_secs(600),
        watchdog: Duration::from_secs(5),
        ..MonitorTimings::default()
    };
    let mut monitor = recorder.attach(
        SessionMonitor::new(SESSION_ID, Arc::new(NeverOpens), FakeJobApi::new())
            .with_timings(timings),
    );
    monitor.start();

    monitor.closed().await;

    assert_eq!(
        recorder.errors(),
        vec!["timed out: no terminal event within 5s".to_string()]
    );
    assert_eq!(monitor.snapshot().pending_timers, 0);
}

/// A poll that sees completion first wins; the later `final_result` is
/// ignored.
#[tokio::test(start_paused = true)]
async fn test_poll_completion_suppresses_later_final_result() {
    let recorder = Recorder::new();
    let api = FakeJobApi::new();
    api.set_records(vec![record("other", "failed"), record(SESSION_ID, "completed")]);
    let (monitor, feed) = open_session(Arc::clone(&api), &recorder).await;

    sleep(Duration::from_millis(2000)).await;

    assert_eq!(recorder.completions(), 1);
    assert_eq!(monitor.snapshot().job_status, JobStatus::Completed);
    assert_eq!(monitor.snapshot().progress, 100);

    feed.event("final_result", json!({ "result": {} }));
    settle().await;

    assert_eq!(recorder.completions(), 1);
    assert!(!recorder
        .all()
        .iter()
        .any(|seen| matches!(seen, Seen::Message { event_type: EventType::FinalResult, .. })));
    assert!(recorder.errors().is_empty());

    monitor.closed().await;
    assert_eq!(monitor.snapshot().pending_timers, 0);
}

// =============================================================================
// Terminal Signals
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_completion_phrase_completes_job() {
    let recorder = Recorder::new();
    let (monitor, feed) = open_session(FakeJobApi::new(), &recorder).await;

    feed.step("saving result to knowledge base");
    feed.step("✅ page analysis result storage complete");
    settle().await;

    assert_eq!(recorder.progress(), vec![80, 100]);
    assert_eq!(recorder.completions(), 1);
    assert_eq!(monitor.snapshot().job_status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_final_hint_on_message_completes_job() {
    let recorder = Recorder::new();
    let (monitor, feed) = open_session(FakeJobApi::new(), &recorder).await;

    feed.event("message", json!({ "content": "done", "is_final": true }));
    settle().await;

    assert_eq!(recorder.completions(), 1);
    assert_eq!(monitor.snapshot().job_status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_close_event_completes_job() {
    let recorder = Recorder::new();
    let (monitor, feed) = open_session(FakeJobApi::new(), &recorder).await;

    feed.event("close", json!({ "message": "stream closed" }));
    settle().await;

    assert_eq!(recorder.completions(), 1);
    assert_eq!(monitor.snapshot().job_status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_polled_failure_reports_record_error() {
    let recorder = Recorder::new();
    let api = FakeJobApi::new();
    let mut failed = record(SESSION_ID, "failed");
    failed.error = Some("script crashed".to_string());
    api.set_records(vec![failed]);
    let (monitor, _feed) = open_session(api, &recorder).await;

    sleep(Duration::from_millis(2000)).await;

    assert_eq!(recorder.errors(), vec!["script crashed".to_string()]);
    assert_eq!(monitor.snapshot().job_status, JobStatus::Failed);
}

// =============================================================================
// Transport Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_refused_connection_fails_session() {
    let recorder = Recorder::new();
    let mut monitor = recorder.attach(SessionMonitor::new(
        SESSION_ID,
        Arc::new(Refusing),
        FakeJobApi::new(),
    ));
    monitor.start();
    settle().await;

    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("503"));
    assert_eq!(monitor.snapshot().job_status, JobStatus::Failed);

    monitor.closed().await;
    assert_eq!(monitor.snapshot().pending_timers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stream_ending_early_fails_session() {
    let recorder = Recorder::new();
    let (monitor, mut feed) = open_session(FakeJobApi::new(), &recorder).await;

    feed.step("analyzing elements");
    feed.end();
    settle().await;

    assert_eq!(recorder.progress(), vec![40]);
    assert_eq!(
        recorder.errors(),
        vec![format!("transport error: {}", TransportError::EndedEarly)]
    );
    assert_eq!(monitor.snapshot().job_status, JobStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_read_error_fails_session() {
    let recorder = Recorder::new();
    let (monitor, feed) = open_session(FakeJobApi::new(), &recorder).await;

    feed.fail(TransportError::Read("connection reset".to_string()));
    settle().await;

    assert_eq!(recorder.errors().len(), 1);
    assert!(recorder.errors()[0].contains("connection reset"));
    assert_eq!(monitor.snapshot().job_status, JobStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_is_skipped() {
    let recorder = Recorder::new();
    let (monitor, feed) = open_session(FakeJobApi::new(), &recorder).await;

    feed.raw("message", "{not json");
    feed.raw("message", "");
    feed.step("analyzing elements");
    settle().await;

    assert_eq!(recorder.progress(), vec![40]);
    assert!(recorder.errors().is_empty());
    assert_eq!(monitor.snapshot().job_status, JobStatus::Analyzing);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_and_unknown_events_are_silent() {
    let recorder = Recorder::new();
    let (monitor, feed) = open_session(FakeJobApi::new(), &recorder).await;
    let before = recorder.len();

    feed.event("heartbeat", json!({ "timestamp": "2026-10-19T08:00:00Z" }));
    feed.event("message", json!({ "timestamp": "2026-10-19T08:00:05Z" }));
    feed.event("progress_v2", json!({ "content": "analyzing 50%" }));
    settle().await;

    assert_eq!(recorder.len(), before);
    assert_eq!(monitor.snapshot().progress, 10);
}

/// Status updates are forwarded as sent, whether typed in the payload or by
/// the transport event name.
#[tokio::test(start_paused = true)]
async fn test_backend_status_updates_reach_subscriber() {
    let recorder = Recorder::new();
    let (monitor, feed) = open_session(FakeJobApi::new(), &recorder).await;

    feed.event("message", json!({ "type": "status", "status": "running" }));
    feed.event("status", json!({ "status": "saving" }));
    feed.event("message", json!({ "status": "ignored without a status type" }));
    settle().await;

    assert_eq!(recorder.reported(), vec!["running", "saving"]);
    assert_eq!(monitor.snapshot().job_status, JobStatus::Analyzing);
    assert_eq!(recorder.completions(), 0);
}

// =============================================================================
// Custom Rules
// =============================================================================

/// A custom rule table and completion phrase replace the defaults.
#[tokio::test(start_paused = true)]
async fn test_custom_rules_and_completion_phrase_drive_session() {
    let (transport, feed) = ScriptedTransport::new();
    let recorder = Recorder::new();
    let heuristic = ProgressHeuristic::default().with_rules(vec![
        ProgressRule::new(Estimate::Fixed(70)).when(Condition::contains_any(&["halfway"])),
    ]);
    let detector = TerminalDetector::default().with_completion_phrases(["All Done"]);
    let mut monitor = recorder.attach(
        SessionMonitor::new(SESSION_ID, transport, FakeJobApi::new())
            .with_heuristic(heuristic)
            .with_detector(detector),
    );
    monitor.start();
    settle().await;

    feed.step("warming up");
    feed.step("Halfway there");
    feed.step("✅ result saved");
    settle().await;

    assert_eq!(recorder.progress(), vec![30, 70, 70]);
    assert_eq!(recorder.completions(), 0);

    feed.step("all done, bye");
    settle().await;

    assert_eq!(recorder.progress(), vec![30, 70, 70, 100]);
    assert_eq!(recorder.completions(), 1);
    assert_eq!(monitor.snapshot().job_status, JobStatus::Completed);
}

// =============================================================================
// Stopping
// =============================================================================

/// Stop tears down at once, can be repeated, and silences every timer.
#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_silences_timers() {
    let recorder = Recorder::new();
    let api = FakeJobApi::new();
    let (mut monitor, _feed) = open_session(Arc::clone(&api), &recorder).await;

    monitor.stop().await;
    let snapshot = monitor.snapshot();
    assert!(snapshot.is_closed());
    assert_eq!(snapshot.pending_timers, 0);

    monitor.stop().await;
    let seen = recorder.len();
    let polls = api.polls();

    sleep(Duration::from_secs(400)).await;

    assert_eq!(recorder.len(), seen);
    assert_eq!(api.polls(), polls);
    assert!(recorder.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_start_closes_without_connecting() {
    let (transport, _feed) = ScriptedTransport::new();
    let mut monitor = SessionMonitor::new(SESSION_ID, Arc::clone(&transport) as _, FakeJobApi::new());

    monitor.stop().await;
    monitor.start();
    settle().await;

    assert!(monitor.snapshot().is_closed());
    assert!(monitor.handle().is_none());
    assert_eq!(transport.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_connects_once() {
    let (transport, _feed) = ScriptedTransport::new();
    let mut monitor = SessionMonitor::new(SESSION_ID, Arc::clone(&transport) as _, FakeJobApi::new());

    monitor.start();
    monitor.start();
    settle().await;

    assert_eq!(transport.connects(), 1);
    assert_eq!(monitor.snapshot().connection_state, ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_stop_execution_notifies_backend() {
    let recorder = Recorder::new();
    let api = FakeJobApi::new();
    let (mut monitor, _feed) = open_session(Arc::clone(&api), &recorder).await;

    monitor.stop_execution().await.unwrap();

    assert_eq!(api.cancels(), 1);
    assert!(monitor.snapshot().is_closed());
}

/// A failed cancel request is reported, but the session is still torn down.
#[tokio::test(start_paused = true)]
async fn test_stop_execution_failure_still_tears_down() {
    let recorder = Recorder::new();
    let api = FakeJobApi::new();
    api.fail_cancel();
    let (mut monitor, _feed) = open_session(Arc::clone(&api), &recorder).await;

    let err = monitor.stop_execution().await.unwrap_err();

    assert!(matches!(err, MonitorError::CancelNotification(_)));
    assert!(err.to_string().contains("session not found"));
    let snapshot = monitor.snapshot();
    assert!(snapshot.is_closed());
    assert_eq!(snapshot.pending_timers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_handle_stop_closes_monitor() {
    let recorder = Recorder::new();
    let (monitor, _feed) = open_session(FakeJobApi::new(), &recorder).await;
    let handle = monitor.handle().unwrap();

    handle.stop().await;

    assert!(handle.is_closed());
    assert!(monitor.snapshot().is_closed());
}

// =============================================================================
// Polling Fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_polling_stops_at_ceiling() {
    let recorder = Recorder::new();
    let api = FakeJobApi::new();
    let (monitor, _feed) = open_session(Arc::clone(&api), &recorder).await;

    sleep(Duration::from_secs(61)).await;
    let polls = api.polls();
    assert!(polls >= 25, "expected regular polling, got {polls}");

    sleep(Duration::from_secs(30)).await;
    assert_eq!(api.polls(), polls);
    assert!(!monitor.snapshot().terminal_fired);
}

#[tokio::test(start_paused = true)]
async fn test_list_refresh_reaches_subscriber() {
    let recorder = Recorder::new();
    let api = FakeJobApi::new();
    api.set_records(vec![record("a", "analyzing"), record("b", "completed")]);
    let (_monitor, _feed) = open_session(api, &recorder).await;

    sleep(Duration::from_millis(1500)).await;

    assert!(recorder.all().contains(&Seen::Listing(2)));
    assert_eq!(recorder.completions(), 0);
}

// =============================================================================
// Observation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_watch_receives_progress_updates() {
    let recorder = Recorder::new();
    let (monitor, feed) = open_session(FakeJobApi::new(), &recorder).await;
    let mut updates = monitor.watch();

    feed.step("analyzing 35%");
    settle().await;

    assert!(updates.has_changed().unwrap());
    assert_eq!(updates.borrow_and_update().progress, 55);
}

#[tokio::test(start_paused = true)]
async fn test_callback_registered_after_start_is_ignored() {
    let (transport, feed) = ScriptedTransport::new();
    let late = Recorder::new();
    let mut monitor = SessionMonitor::new(SESSION_ID, transport, FakeJobApi::new());
    monitor.start();
    let monitor = late.attach(monitor);
    settle().await;

    feed.event("final_result", json!({ "result": {} }));
    settle().await;

    assert_eq!(monitor.snapshot().job_status, JobStatus::Completed);
    assert_eq!(late.len(), 0);
}
