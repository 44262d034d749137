use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use super::*;
use crate::events::{Source, StreamEvent, TaskStep};
use crate::observability::metrics::outcome;
use crate::persistence::{InMemorySnapshotStore, SnapshotStore};
use crate::sessions::{Session, SessionFilter, SessionKind, SessionState, SessionStatus, TaskState};
use crate::stream::{ChannelTransport, StaticSourcesResolver};

struct Harness {
    engine: Engine,
    transport: Arc<ChannelTransport>,
    resolver: Arc<StaticSourcesResolver>,
    store: Arc<InMemorySnapshotStore>,
}

fn harness() -> Harness {
    harness_with(
        Arc::new(InMemorySnapshotStore::new("streamkeep.sessions.v1:test")),
        EngineOptions::default(),
    )
}

fn harness_with(store: Arc<InMemorySnapshotStore>, options: EngineOptions) -> Harness {
    let transport = Arc::new(ChannelTransport::new());
    let resolver = Arc::new(StaticSourcesResolver::new());
    let engine = Engine::new(transport.clone(), resolver.clone(), store.clone(), options).unwrap();
    Harness {
        engine,
        transport,
        resolver,
        store,
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn wait_for(engine: &Engine, id: &str, pred: impl Fn(&Session) -> bool) -> Session {
    eventually(|| engine.get(id).is_some_and(|s| pred(&s))).await;
    engine.get(id).unwrap()
}

/// Give in-flight handle tasks a chance to run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn collect_changes(engine: &Engine) -> (Arc<Mutex<Vec<Session>>>, ListenerHandle) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = engine.on_change(move |s| sink.lock().push(s.clone()));
    (seen, handle)
}

fn text(session: &Session) -> &str {
    &session.state.as_exchange().unwrap().text
}

fn task_state(session: &Session) -> &TaskState {
    session.state.as_task().unwrap()
}

#[tokio::test]
async fn task_happy_path() {
    let h = harness();
    let id = h
        .engine
        .start(SessionKind::Task, "t1", SessionSeed::with_id("upload-7"))
        .unwrap();
    assert_eq!(id, "upload-7");

    h.transport.push_event("t1", "status", json!({"progress": 30, "step": "extract"}));
    h.transport.push_event("t1", "status", json!({"progress": 80, "step": "embed"}));
    h.transport.push_event("t1", "complete", json!({"resultId": "doc_42"}));

    let done = wait_for(&h.engine, &id, Session::is_terminal).await;
    assert_eq!(done.status, SessionStatus::Complete);
    let state = task_state(&done);
    assert_eq!(state.progress, 80);
    assert_eq!(state.current_step, TaskStep::Embed);
    assert_eq!(state.result_id.as_deref(), Some("doc_42"));

    assert_eq!(h.engine.open_handle_count(), 0);
    let metrics = h.engine.metrics();
    assert_eq!(metrics.frames_total(outcome::APPLIED), 3);
    assert_eq!(metrics.finished_total(SessionStatus::Complete), 1);
}

#[tokio::test]
async fn exchange_with_citations() {
    let h = harness();
    let id = h
        .engine
        .start(SessionKind::Exchange, "x1", SessionSeed::default())
        .unwrap();
    assert!(id.starts_with("exchange_"));

    h.transport.push_event("x1", "content_delta", json!({"delta": "Par"}));
    h.transport.push_event("x1", "content_delta", json!({"delta": "is is"}));
    h.transport.push_event("x1", "sources", json!({"sources": [{"id": "d1"}]}));
    h.transport.push_event("x1", "complete", json!({}));

    let done = wait_for(&h.engine, &id, Session::is_terminal).await;
    assert_eq!(done.status, SessionStatus::Complete);
    assert_eq!(text(&done), "Paris is");
    assert_eq!(done.state.as_exchange().unwrap().sources, vec![Source::new("d1")]);
}

#[tokio::test]
async fn bad_frame_between_deltas_is_dropped() {
    let h = harness();
    let id = h
        .engine
        .start(SessionKind::Exchange, "x1", SessionSeed::default())
        .unwrap();

    h.transport.push_event("x1", "content_delta", json!({"delta": "a"}));
    h.transport.push_raw("x1", "content_delta", "{\"delta\": ");
    h.transport.push_event("x1", "content_delta", json!({"delta": "b"}));

    let session = wait_for(&h.engine, &id, |s| text(s) == "ab").await;
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(h.engine.open_handle_count(), 1);
    assert_eq!(h.engine.metrics().frames_total(outcome::MALFORMED), 1);
}

#[tokio::test]
async fn error_frame_with_code_and_message_fails_the_session() {
    let h = harness();
    let id = h
        .engine
        .start(SessionKind::Exchange, "x1", SessionSeed::default())
        .unwrap();

    h.transport.push_event(
        "x1",
        "content_delta",
        json!({"delta": "Par", "content": "Par"}),
    );
    h.transport.push_event(
        "x1",
        "error",
        json!({"error": "rate_limited", "message": "Too many requests"}),
    );

    let done = wait_for(&h.engine, &id, Session::is_terminal).await;
    assert_eq!(done.status, SessionStatus::Error);
    assert_eq!(done.state.error(), Some("Too many requests"));
    assert_eq!(text(&done), "Par");
    assert_eq!(h.engine.open_handle_count(), 0);
    assert_eq!(h.engine.metrics().frames_total(outcome::MALFORMED), 0);
}

#[tokio::test]
async fn cancellation_freezes_state() {
    let h = harness();
    let id = h
        .engine
        .start(SessionKind::Exchange, "x1", SessionSeed::default())
        .unwrap();
    h.transport.push_event("x1", "content_delta", json!({"delta": "Hel"}));
    wait_for(&h.engine, &id, |s| text(s) == "Hel").await;

    h.engine.cancel(&id).unwrap();
    let cancelled = h.engine.get(&id).unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert_eq!(h.engine.open_handle_count(), 0);

    h.transport.push_event("x1", "content_delta", json!({"delta": "lo"}));
    h.transport.push_event("x1", "complete", json!({}));
    h.engine.inject(&id, StreamEvent::ContentDelta("lo".into()));
    settle().await;

    let after = h.engine.get(&id).unwrap();
    assert_eq!(after, cancelled);
    eventually(|| h.transport.live_connections("x1") == 0).await;

    // Cancelling again is a no-op.
    h.engine.cancel(&id).unwrap();
    assert_eq!(h.engine.metrics().finished_total(SessionStatus::Cancelled), 1);
}

#[tokio::test]
async fn terminal_sessions_reject_every_event() {
    let h = harness();
    let ok = h
        .engine
        .start(SessionKind::Task, "t1", SessionSeed::with_id("ok"))
        .unwrap();
    let failed = h
        .engine
        .start(SessionKind::Exchange, "x1", SessionSeed::with_id("failed"))
        .unwrap();
    h.transport.push_event("t1", "complete", json!({"resultId": "r1"}));
    h.transport.push_event("x1", "error", json!({"message": "model overloaded"}));

    let ok_done = wait_for(&h.engine, &ok, Session::is_terminal).await;
    let failed_done = wait_for(&h.engine, &failed, Session::is_terminal).await;
    assert_eq!(failed_done.status, SessionStatus::Error);
    assert_eq!(failed_done.state.error(), Some("model overloaded"));

    let late = [
        StreamEvent::error("late failure"),
        StreamEvent::Complete { result_id: Some("other".into()) },
        StreamEvent::ContentDelta("more".into()),
        StreamEvent::Sources(vec![Source::new("d9")]),
    ];
    for event in late {
        h.engine.inject(&ok, event.clone());
        h.engine.inject(&failed, event);
    }

    assert_eq!(h.engine.get(&ok).unwrap(), ok_done);
    assert_eq!(h.engine.get(&failed).unwrap(), failed_done);
    assert_eq!(h.engine.metrics().frames_total(outcome::REJECTED_TERMINAL), 8);
    assert!(matches!(
        h.engine.subscribe(&ok),
        Err(EngineError::Terminal { status: SessionStatus::Complete, .. })
    ));
}

#[tokio::test]
async fn events_for_unknown_ids_are_dropped() {
    let h = harness();
    h.engine.inject("ghost", StreamEvent::ContentDelta("boo".into()));
    h.engine.inject_from("ghost", 99, StreamEvent::error("boom"));

    assert!(h.engine.get("ghost").is_none());
    assert!(h.engine.list(SessionFilter::All).is_empty());
    assert_eq!(h.engine.metrics().frames_total(outcome::STALE), 2);
}

#[tokio::test]
async fn removed_session_ignores_its_old_stream() {
    let h = harness();
    let id = h
        .engine
        .start(SessionKind::Exchange, "x1", SessionSeed::default())
        .unwrap();
    let generation = h.engine.handle_generation(&id).unwrap();

    let removed = h.engine.remove(&id).unwrap();
    assert_eq!(removed.id, id);
    assert!(h.engine.remove(&id).is_none());

    h.engine.inject_from(&id, generation, StreamEvent::ContentDelta("x".into()));
    assert!(h.engine.get(&id).is_none());
    assert_eq!(h.engine.open_handle_count(), 0);
}

#[tokio::test]
async fn resubscribing_keeps_a_single_handle() {
    let h = harness();
    let id = h
        .engine
        .start(SessionKind::Exchange, "x1", SessionSeed::default())
        .unwrap();
    let first = h.engine.handle_generation(&id).unwrap();

    h.engine.subscribe(&id).unwrap();
    h.engine.subscribe(&id).unwrap();
    let current = h.engine.handle_generation(&id).unwrap();
    assert!(current > first);
    assert_eq!(h.engine.open_handle_count(), 1);

    // Replaced handles may be aborted before they ever connect.
    eventually(|| h.transport.open_count("x1") >= 1 && h.transport.live_connections("x1") == 1).await;

    // Only the current handle's events are applied.
    h.engine.inject_from(&id, first, StreamEvent::ContentDelta("old".into()));
    h.transport.push_event("x1", "content_delta", json!({"delta": "new"}));
    let session = wait_for(&h.engine, &id, |s| !text(s).is_empty()).await;
    settle().await;
    assert_eq!(text(&h.engine.get(&id).unwrap()), "new");
    assert_eq!(session.status, SessionStatus::Active);
}

#[tokio::test]
async fn restore_round_trips_in_flight_sessions() {
    let store = Arc::new(InMemorySnapshotStore::new("streamkeep.sessions.v1:tab"));
    let before = {
        let h = harness_with(store.clone(), EngineOptions::default());
        let task = h
            .engine
            .start(SessionKind::Task, "t1", SessionSeed::with_id("task-1"))
            .unwrap();
        let chat = h
            .engine
            .start(SessionKind::Exchange, "x1", SessionSeed::with_id("chat-1"))
            .unwrap();
        let done = h
            .engine
            .start(SessionKind::Task, "t2", SessionSeed::with_id("done-1"))
            .unwrap();

        h.transport.push_event("t1", "status", json!({"progress": 45, "step": "chunk", "message": "Chunking"}));
        h.transport.push_event("x1", "content_delta", json!({"delta": "Paris"}));
        h.transport.push_event("x1", "sources", json!([{"id": "d1", "score": 0.5}]));
        h.transport.push_event("t2", "complete", json!({}));

        wait_for(&h.engine, &task, |s| task_state(s).progress == 45).await;
        wait_for(&h.engine, &chat, |s| !s.state.as_exchange().unwrap().sources.is_empty()).await;
        wait_for(&h.engine, &done, Session::is_terminal).await;

        let before = h.engine.active();
        h.engine.shutdown();
        assert_eq!(h.engine.open_handle_count(), 0);
        before
    };
    assert_eq!(before.len(), 2);

    let h = harness_with(store, EngineOptions::default());
    let (changes, _listener) = collect_changes(&h.engine);
    let restored = h.engine.restore().unwrap();
    assert_eq!(restored, vec!["task-1".to_string(), "chat-1".to_string()]);
    assert!(h.engine.restore().unwrap().is_empty());

    for original in &before {
        let now = h.engine.get(&original.id).unwrap();
        assert_eq!(now.kind, original.kind);
        assert_eq!(now.stream_ref, original.stream_ref);
        assert_eq!(now.status, SessionStatus::Connecting);
        assert_eq!(
            serde_json::to_string(&now.state).unwrap(),
            serde_json::to_string(&original.state).unwrap()
        );
    }
    assert!(h.engine.get("done-1").is_none());
    assert_eq!(h.engine.open_handle_count(), 2);

    eventually(|| changes.lock().len() == 2).await;
    eventually(|| h.transport.open_count("t1") == 1 && h.transport.open_count("x1") == 1).await;

    // The resumed stream continues where the old one left off.
    h.transport.push_event("x1", "content_delta", json!({"delta": " is"}));
    let resumed = wait_for(&h.engine, "chat-1", |s| s.status == SessionStatus::Active).await;
    assert_eq!(text(&resumed), "Paris is");
}

#[tokio::test]
async fn restore_skips_stale_snapshot_entries() {
    let old = chrono::Utc::now() - chrono::Duration::hours(30);
    let payload = json!([{
        "id": "old", "kind": "task", "streamRef": "t1", "status": "active",
        "state": {"progress": 10, "currentStep": "parse"}, "updatedAt": old.to_rfc3339()
    }])
    .to_string();
    let store = Arc::new(InMemorySnapshotStore::with_payload("k", &payload));
    let h = harness_with(
        store,
        EngineOptions {
            max_snapshot_age: Some(chrono::Duration::hours(24)),
            ..EngineOptions::default()
        },
    );

    assert!(h.engine.restore().unwrap().is_empty());
    assert!(h.engine.get("old").is_none());
    assert_eq!(h.store.payload().as_deref(), Some("[]"));
}

#[tokio::test]
async fn snapshot_tracks_only_in_flight_sessions() {
    let h = harness();
    let id = h
        .engine
        .start(SessionKind::Task, "t1", SessionSeed::with_id("job"))
        .unwrap();

    let persisted: serde_json::Value = serde_json::from_str(&h.store.payload().unwrap()).unwrap();
    assert_eq!(persisted[0]["id"], "job");
    assert_eq!(persisted[0]["status"], "connecting");

    h.transport.push_event("t1", "complete", json!({}));
    wait_for(&h.engine, &id, Session::is_terminal).await;
    assert_eq!(h.store.load().unwrap().as_deref(), Some("[]"));
}

#[tokio::test]
async fn failing_store_does_not_stop_the_session() {
    let h = harness();
    h.store.fail_writes(true);
    let id = h
        .engine
        .start(SessionKind::Exchange, "x1", SessionSeed::default())
        .unwrap();
    h.transport.push_event("x1", "content_delta", json!({"delta": "still here"}));

    let session = wait_for(&h.engine, &id, |s| text(s) == "still here").await;
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(h.store.writes(), 0);
}

#[tokio::test]
async fn sources_ref_is_resolved_and_failures_are_tolerated() {
    let h = harness();
    h.resolver.insert("batch-1", vec![Source::new("d1"), Source::new("d2")]);
    let id = h
        .engine
        .start(SessionKind::Exchange, "x1", SessionSeed::default())
        .unwrap();

    h.transport.push_event("x1", "sources_ref", json!({"ref": "batch-missing"}));
    h.transport.push_event("x1", "content_delta", json!({"delta": "ok"}));
    h.transport.push_event("x1", "sources_ref", json!({"ref": "batch-1"}));
    h.transport.push_event("x1", "complete", json!({}));

    let done = wait_for(&h.engine, &id, Session::is_terminal).await;
    assert_eq!(done.status, SessionStatus::Complete);
    assert_eq!(text(&done), "ok");
    let ids: Vec<&str> = done
        .state
        .as_exchange()
        .unwrap()
        .sources
        .iter()
        .map(|s| s.id.as_str())
        .collect();
    assert_eq!(ids, vec!["d1", "d2"]);
    assert_eq!(h.engine.metrics().frames_total(outcome::RESOLUTION_FAILED), 1);
}

#[tokio::test]
async fn transport_failures_become_error_sessions() {
    let h = harness();
    h.transport.refuse("t-refused", "401 unauthorized");
    let refused = h
        .engine
        .start(SessionKind::Task, "t-refused", SessionSeed::default())
        .unwrap();
    let dropped = h
        .engine
        .start(SessionKind::Exchange, "x-dropped", SessionSeed::default())
        .unwrap();

    let refused = wait_for(&h.engine, &refused, Session::is_terminal).await;
    assert_eq!(refused.status, SessionStatus::Error);
    assert!(refused.state.error().unwrap().starts_with("failed to open stream"));

    h.transport.push_event("x-dropped", "content_delta", json!({"delta": "par"}));
    wait_for(&h.engine, &dropped, |s| text(s) == "par").await;
    h.transport.fail("x-dropped", "connection reset by peer");
    let dropped = wait_for(&h.engine, &dropped, Session::is_terminal).await;
    assert_eq!(dropped.status, SessionStatus::Error);
    assert_eq!(
        dropped.state.error(),
        Some("stream interrupted: connection reset by peer")
    );
    assert_eq!(text(&dropped), "par");
    assert_eq!(h.engine.open_handle_count(), 0);
}

#[tokio::test]
async fn idle_timeout_fails_silent_streams() {
    let h = harness_with(
        Arc::new(InMemorySnapshotStore::new("k")),
        EngineOptions {
            idle_timeout: Some(Duration::from_millis(50)),
            ..EngineOptions::default()
        },
    );
    let id = h
        .engine
        .start(SessionKind::Task, "t1", SessionSeed::default())
        .unwrap();
    let failed = wait_for(&h.engine, &id, Session::is_terminal).await;
    assert_eq!(failed.status, SessionStatus::Error);
    assert!(failed.state.error().unwrap().starts_with("stream idle for"));
}

#[tokio::test]
async fn listeners_see_changes_in_order_until_unsubscribed() {
    let h = harness();
    let (first, first_handle) = collect_changes(&h.engine);
    let (second, _second_handle) = collect_changes(&h.engine);
    assert_eq!(h.engine.listener_count(), 2);

    let id = h
        .engine
        .start(SessionKind::Exchange, "x1", SessionSeed::default())
        .unwrap();
    h.transport.push_event("x1", "content_delta", json!({"delta": "a"}));
    h.transport.push_event("x1", "content_delta", json!({"delta": "b"}));
    wait_for(&h.engine, &id, |s| text(s) == "ab").await;
    eventually(|| first.lock().len() == 3).await;

    let texts: Vec<String> = first.lock().iter().map(|s| text(s).to_string()).collect();
    assert_eq!(texts, vec!["", "a", "ab"]);
    assert_eq!(first.lock()[0].status, SessionStatus::Connecting);

    first_handle.unsubscribe();
    assert_eq!(h.engine.listener_count(), 1);
    h.transport.push_event("x1", "complete", json!({}));
    eventually(|| second.lock().len() == 4).await;
    settle().await;
    assert_eq!(first.lock().len(), 3);
    assert_eq!(second.lock().last().unwrap().status, SessionStatus::Complete);
}

#[tokio::test]
async fn listeners_may_call_back_into_the_engine() {
    let h = harness();
    let engine = h.engine.clone();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    h.engine
        .on_change(move |s| {
            let current = engine.get(&s.id).map(|c| c.status);
            sink.lock().push(current);
        })
        .detach();

    h.engine
        .start(SessionKind::Task, "t1", SessionSeed::with_id("job"))
        .unwrap();
    eventually(|| !observed.lock().is_empty()).await;
    assert_eq!(observed.lock()[0], Some(SessionStatus::Connecting));
    assert_eq!(h.engine.listener_count(), 1);
}

#[tokio::test]
async fn clear_terminal_removes_only_finished_sessions() {
    let h = harness();
    let running = h
        .engine
        .start(SessionKind::Task, "t1", SessionSeed::with_id("running"))
        .unwrap();
    let finished = h
        .engine
        .start(SessionKind::Task, "t2", SessionSeed::with_id("finished"))
        .unwrap();
    let cancelled = h
        .engine
        .start(SessionKind::Task, "t3", SessionSeed::with_id("cancelled"))
        .unwrap();
    h.transport.push_event("t2", "complete", json!({}));
    wait_for(&h.engine, &finished, Session::is_terminal).await;
    h.engine.cancel(&cancelled).unwrap();

    let mut cleared = h.engine.clear_terminal();
    cleared.sort();
    assert_eq!(cleared, vec!["cancelled".to_string(), "finished".to_string()]);
    let remaining: Vec<String> = h
        .engine
        .list(SessionFilter::All)
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(remaining, vec![running]);
    assert!(h.engine.clear_terminal().is_empty());
}

#[tokio::test]
async fn starting_an_existing_id_supersedes_it() {
    let h = harness();
    h.engine
        .start(SessionKind::Task, "t1", SessionSeed::with_id("slot"))
        .unwrap();
    h.engine
        .start(SessionKind::Task, "t2", SessionSeed::with_id("slot"))
        .unwrap();

    assert_eq!(h.engine.list(SessionFilter::All).len(), 1);
    assert_eq!(h.engine.open_handle_count(), 1);
    eventually(|| h.transport.live_connections("t1") == 0).await;

    h.transport.push_event("t1", "status", json!({"progress": 90, "step": "index"}));
    h.transport.push_event("t2", "status", json!({"progress": 10, "step": "parse"}));
    let session = wait_for(&h.engine, "slot", |s| s.status == SessionStatus::Active).await;
    settle().await;
    assert_eq!(session.stream_ref, "t2");
    assert_eq!(task_state(&h.engine.get("slot").unwrap()).progress, 10);
}

#[tokio::test]
async fn invalid_caller_input_is_rejected() {
    let h = harness();
    assert!(matches!(
        h.engine.start(SessionKind::Task, "  ", SessionSeed::default()),
        Err(EngineError::EmptyStreamRef)
    ));

    let seed = SessionSeed {
        id: None,
        state: Some(SessionState::empty(SessionKind::Exchange)),
    };
    assert!(matches!(
        h.engine.start(SessionKind::Task, "t1", seed),
        Err(EngineError::KindMismatch {
            expected: SessionKind::Task,
            actual: SessionKind::Exchange
        })
    ));

    assert!(matches!(h.engine.subscribe("nope"), Err(EngineError::NotFound(_))));
    assert!(matches!(h.engine.cancel("nope"), Err(EngineError::NotFound(_))));
    assert!(h.engine.list(SessionFilter::All).is_empty());
}

#[tokio::test]
async fn seeded_state_is_kept() {
    let h = harness();
    let seed = SessionSeed {
        id: Some("job".into()),
        state: Some(SessionState::Task(TaskState {
            progress: 20,
            current_step: TaskStep::Upload,
            ..TaskState::default()
        })),
    };
    h.engine.start(SessionKind::Task, "t1", seed).unwrap();
    h.transport.push_event("t1", "status", json!({"progress": 5, "step": "parse"}));

    let session = wait_for(&h.engine, "job", |s| s.status == SessionStatus::Active).await;
    assert_eq!(task_state(&session).progress, 20);
    assert_eq!(task_state(&session).current_step, TaskStep::Parse);
}
