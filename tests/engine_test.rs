use chrono::{TimeZone, Utc};
use dutysync::clock::ManualClock;
use dutysync::db::{self, RetryPolicy};
use dutysync::error::{EngineError, TransportError};
use dutysync::model::{ActionStatus, EngineSnapshot, QueuedAction, SyncPhase};
use dutysync::transport::SyncTransport;
use dutysync::{SyncOptions, SyncService};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

async fn setup_pool() -> db::Pool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn test_options() -> SyncOptions {
    SyncOptions {
        settle_window: Duration::from_millis(50),
        retry: RetryPolicy::default(),
    }
}

fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 8, 24, 9, 0, 0).unwrap(),
    ))
}

#[derive(Clone, Default)]
struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<Result<Value, TransportError>>>>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    gates: Arc<Mutex<VecDeque<oneshot::Receiver<()>>>>,
}

impl ScriptedTransport {
    fn with_responses(responses: Vec<Result<Value, TransportError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().await.clone()
    }

    /// Park the next replay until the returned sender fires, so a test can
    /// observe the engine while a drain is mid-flight.
    async fn hold_next(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        self.gates.lock().await.push_back(gate);
        release
    }

    async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if self.calls.lock().await.len() >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transport call count not reached in time")
    }
}

#[async_trait::async_trait]
impl SyncTransport for ScriptedTransport {
    async fn replay(&self, action: &QueuedAction) -> Result<Value, TransportError> {
        self.calls
            .lock()
            .await
            .push((action.action_type.as_str().to_string(), action.payload.clone()));
        let gate = self.gates.lock().await.pop_front();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"ok": true})))
    }
}

async fn wait_until<F>(service: &SyncService, pred: F) -> EngineSnapshot
where
    F: Fn(&EngineSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snap = service.snapshot();
            if pred(&snap) {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("snapshot condition not reached in time")
}

#[tokio::test]
async fn attendance_marked_offline_reconciles_on_reconnect() {
    let pool = setup_pool().await;
    let transport = ScriptedTransport::with_responses(vec![Ok(json!({
        "id": "att-77",
        "status": "on_club_duty",
        "date": "2026-08-24"
    }))]);
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        test_clock(),
        test_options(),
    )
    .await
    .unwrap();

    let id = service
        .queue_action("mark_attendance", json!({"status": "on_club_duty"}), Some(2))
        .await
        .unwrap();

    // Optimistic projection is visible immediately, before any network call.
    let rec = service
        .get_record("attendance:2026-08-24")
        .await
        .unwrap()
        .unwrap();
    assert!(!rec.synced);
    assert_eq!(rec.data["status"], "on_club_duty");
    assert_eq!(service.snapshot().pending_actions, 1);
    assert!(transport.calls().await.is_empty());

    service.report_connectivity(true);
    let snap = wait_until(&service, |s| {
        s.pending_actions == 0 && s.sync_phase == SyncPhase::Completed
    })
    .await;
    assert!(snap.sync_errors.is_empty());
    assert!(snap.last_sync_time.is_some());
    assert_eq!(snap.sync_progress, 100);

    let rec = service
        .get_record("attendance:2026-08-24")
        .await
        .unwrap()
        .unwrap();
    assert!(rec.synced);
    assert_eq!(rec.data["id"], "att-77");
    let action = service.get_action(&id).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Done);
}

#[tokio::test]
async fn rapid_hourly_logs_replay_in_enqueue_order() {
    let pool = setup_pool().await;
    let clock = test_clock();
    let transport = ScriptedTransport::default();
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        clock.clone(),
        test_options(),
    )
    .await
    .unwrap();

    service
        .queue_action(
            "submit_hourly_log",
            json!({"log_id": "l-1", "session_id": "s-4", "text": "first"}),
            None,
        )
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(1));
    service
        .queue_action(
            "submit_hourly_log",
            json!({"log_id": "l-2", "session_id": "s-4", "text": "second"}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(service.snapshot().pending_actions, 2);

    service.report_connectivity(true);
    wait_until(&service, |s| {
        s.pending_actions == 0 && s.sync_phase == SyncPhase::Completed
    })
    .await;

    let calls = transport.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1["text"], "first");
    assert_eq!(calls[1].1["text"], "second");
}

#[tokio::test]
async fn priority_outranks_enqueue_order() {
    let pool = setup_pool().await;
    let clock = test_clock();
    let transport = ScriptedTransport::default();
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        clock.clone(),
        test_options(),
    )
    .await
    .unwrap();

    // The hourly log goes in first but attendance carries higher urgency.
    service
        .queue_action(
            "submit_hourly_log",
            json!({"log_id": "l-1", "session_id": "s-4"}),
            None,
        )
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(1));
    service
        .queue_action("mark_attendance", json!({"status": "present"}), None)
        .await
        .unwrap();

    service.report_connectivity(true);
    wait_until(&service, |s| s.pending_actions == 0).await;

    let kinds: Vec<String> = transport.calls().await.into_iter().map(|c| c.0).collect();
    assert_eq!(kinds, vec!["mark_attendance", "submit_hourly_log"]);
}

#[tokio::test]
async fn rejected_end_session_is_terminal_and_stays_visible() {
    let pool = setup_pool().await;
    let transport = ScriptedTransport::with_responses(vec![Err(TransportError::ServerRejection {
        status: 404,
        message: "session not found".into(),
    })]);
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        test_clock(),
        test_options(),
    )
    .await
    .unwrap();

    let id = service
        .queue_action("end_duty_session", json!({"session_id": "s-9"}), None)
        .await
        .unwrap();

    service.report_connectivity(true);
    let snap = wait_until(&service, |s| s.sync_phase == SyncPhase::Error).await;
    assert_eq!(snap.sync_errors.len(), 1);
    assert_eq!(snap.sync_errors[0].action_id, id);
    assert!(snap.sync_errors[0].message.contains("session not found"));

    let action = service.get_action(&id).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::FailedTerminal);
    // The optimistic record is not rolled back; the user can see what they
    // attempted.
    let rec = service
        .get_record("duty_session:s-9")
        .await
        .unwrap()
        .unwrap();
    assert!(!rec.synced);

    // Discard is the explicit way out of a terminal failure.
    service.discard_action(&id).await.unwrap();
    assert!(service.get_action(&id).await.unwrap().is_none());
    assert!(service.snapshot().sync_errors.is_empty());
    assert!(service
        .get_record("duty_session:s-9")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn stale_duplicate_reply_counts_as_success() {
    let pool = setup_pool().await;
    let transport = ScriptedTransport::with_responses(vec![Err(TransportError::AlreadyApplied {
        current: json!({"id": "att-1", "status": "present", "date": "2026-08-24"}),
    })]);
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        test_clock(),
        test_options(),
    )
    .await
    .unwrap();

    let id = service
        .queue_action("mark_attendance", json!({"status": "present"}), None)
        .await
        .unwrap();
    service.report_connectivity(true);

    let snap = wait_until(&service, |s| {
        s.pending_actions == 0 && s.sync_phase == SyncPhase::Completed
    })
    .await;
    assert!(snap.sync_errors.is_empty());

    let action = service.get_action(&id).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Done);
    let rec = service
        .get_record("attendance:2026-08-24")
        .await
        .unwrap()
        .unwrap();
    assert!(rec.synced);
    assert_eq!(rec.data["id"], "att-1");
}

#[tokio::test]
async fn permanent_network_failure_stops_at_the_attempt_ceiling() {
    let pool = setup_pool().await;
    let clock = test_clock();
    let transport = ScriptedTransport::with_responses(vec![
        Err(TransportError::Network("connection refused".into())),
        Err(TransportError::Network("connection refused".into())),
        Err(TransportError::Network("connection refused".into())),
        Err(TransportError::Network("connection refused".into())),
        Err(TransportError::Network("connection refused".into())),
    ]);
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        clock.clone(),
        test_options(),
    )
    .await
    .unwrap();

    let id = service
        .queue_action("mark_attendance", json!({"status": "present"}), None)
        .await
        .unwrap();
    service.report_connectivity(true);
    wait_until(&service, |s| s.last_sync_time.is_some()).await;
    assert_eq!(
        service.get_action(&id).await.unwrap().unwrap().attempts,
        1
    );

    // Each retry becomes eligible only after its backoff window elapses.
    for expected_attempts in 2..=5 {
        clock.advance(chrono::Duration::hours(2));
        service.force_sync().await.unwrap();
        let action = service.get_action(&id).await.unwrap().unwrap();
        assert_eq!(action.attempts, expected_attempts);
    }

    let action = service.get_action(&id).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::FailedTerminal);
    assert_eq!(transport.calls().await.len(), 5);
    let snap = service.snapshot();
    assert_eq!(snap.sync_phase, SyncPhase::Error);
    assert_eq!(snap.sync_errors.len(), 1);

    // A sixth drain must not touch the terminal action, and its failure
    // stays visible until discarded or retried.
    clock.advance(chrono::Duration::hours(2));
    service.force_sync().await.unwrap();
    assert_eq!(transport.calls().await.len(), 5);
    let snap = service.snapshot();
    assert_eq!(snap.sync_phase, SyncPhase::Error);
    assert_eq!(snap.sync_errors.len(), 1);
}

#[tokio::test]
async fn session_lifecycle_actions_never_interleave() {
    let pool = setup_pool().await;
    let clock = test_clock();
    let transport = ScriptedTransport::default();
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        clock.clone(),
        test_options(),
    )
    .await
    .unwrap();

    service
        .queue_action("start_duty_session", json!({"session_id": "s-1"}), None)
        .await
        .unwrap();

    // A second start for the same session is a duplicate.
    let err = service
        .queue_action("start_duty_session", json!({"session_id": "s-1"}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SessionActionPending { .. }));

    // The end is accepted but runs strictly after the queued start, even when
    // the caller asks for a more urgent priority.
    clock.advance(chrono::Duration::seconds(1));
    service
        .queue_action("end_duty_session", json!({"session_id": "s-1"}), Some(0))
        .await
        .unwrap();

    service.report_connectivity(true);
    wait_until(&service, |s| {
        s.pending_actions == 0 && s.sync_phase == SyncPhase::Completed
    })
    .await;

    let kinds: Vec<String> = transport.calls().await.into_iter().map(|c| c.0).collect();
    assert_eq!(kinds, vec!["start_duty_session", "end_duty_session"]);
}

#[tokio::test]
async fn end_session_holds_while_the_start_is_in_backoff() {
    let pool = setup_pool().await;
    let clock = test_clock();
    let transport = ScriptedTransport::with_responses(vec![Err(TransportError::Network(
        "connection reset".into(),
    ))]);
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        clock.clone(),
        test_options(),
    )
    .await
    .unwrap();

    let start_id = service
        .queue_action("start_duty_session", json!({"session_id": "s-3"}), None)
        .await
        .unwrap();
    service.report_connectivity(true);
    wait_until(&service, |s| s.last_sync_time.is_some()).await;
    let start = service.get_action(&start_id).await.unwrap().unwrap();
    assert_eq!(start.status, ActionStatus::FailedRetryable);

    // The end joins the queue while the start sits in backoff. A drain now
    // must not send it: the server has never seen this session.
    let end_id = service
        .queue_action("end_duty_session", json!({"session_id": "s-3"}), None)
        .await
        .unwrap();
    service.force_sync().await.unwrap();
    let kinds: Vec<String> = transport.calls().await.into_iter().map(|c| c.0).collect();
    assert_eq!(kinds, vec!["start_duty_session"]);
    let end = service.get_action(&end_id).await.unwrap().unwrap();
    assert_eq!(end.status, ActionStatus::Pending);

    // Once the backoff elapses the start confirms and the end follows it
    // within the same drain.
    clock.advance(chrono::Duration::minutes(1));
    service.force_sync().await.unwrap();
    let kinds: Vec<String> = transport.calls().await.into_iter().map(|c| c.0).collect();
    assert_eq!(
        kinds,
        vec!["start_duty_session", "start_duty_session", "end_duty_session"]
    );
    let start = service.get_action(&start_id).await.unwrap().unwrap();
    assert_eq!(start.status, ActionStatus::Done);
    let end = service.get_action(&end_id).await.unwrap().unwrap();
    assert_eq!(end.status, ActionStatus::Done);
}

#[tokio::test]
async fn end_session_holds_when_the_start_fails_mid_drain() {
    let pool = setup_pool().await;
    let clock = test_clock();
    let transport = ScriptedTransport::with_responses(vec![Err(TransportError::Network(
        "connection reset".into(),
    ))]);
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        clock.clone(),
        test_options(),
    )
    .await
    .unwrap();

    // Both lifecycle actions are queued and due before the drain begins.
    let start_id = service
        .queue_action("start_duty_session", json!({"session_id": "s-5"}), None)
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(1));
    let end_id = service
        .queue_action("end_duty_session", json!({"session_id": "s-5"}), None)
        .await
        .unwrap();

    service.report_connectivity(true);
    wait_until(&service, |s| s.last_sync_time.is_some()).await;
    let kinds: Vec<String> = transport.calls().await.into_iter().map(|c| c.0).collect();
    assert_eq!(kinds, vec!["start_duty_session"]);
    let end = service.get_action(&end_id).await.unwrap().unwrap();
    assert_eq!(end.status, ActionStatus::Pending);

    clock.advance(chrono::Duration::minutes(1));
    service.force_sync().await.unwrap();
    let kinds: Vec<String> = transport.calls().await.into_iter().map(|c| c.0).collect();
    assert_eq!(
        kinds,
        vec!["start_duty_session", "start_duty_session", "end_duty_session"]
    );
    let start = service.get_action(&start_id).await.unwrap().unwrap();
    assert_eq!(start.status, ActionStatus::Done);
}

#[tokio::test]
async fn connectivity_blip_inside_the_settle_window_is_swallowed() {
    let pool = setup_pool().await;
    let transport = ScriptedTransport::default();
    let options = SyncOptions {
        settle_window: Duration::from_millis(200),
        retry: RetryPolicy::default(),
    };
    let service = SyncService::start(pool, Arc::new(transport.clone()), test_clock(), options)
        .await
        .unwrap();

    service
        .queue_action("mark_attendance", json!({"status": "present"}), None)
        .await
        .unwrap();

    // Online for less than the settle window, then back offline: no
    // transition commits and no drain fires.
    service.report_connectivity(true);
    tokio::time::sleep(Duration::from_millis(40)).await;
    service.report_connectivity(false);
    tokio::time::sleep(Duration::from_millis(600)).await;
    let snap = service.snapshot();
    assert!(!snap.is_online);
    assert_eq!(snap.sync_phase, SyncPhase::Idle);
    assert_eq!(snap.pending_actions, 1);
    assert!(transport.calls().await.is_empty());

    // A stable edge commits exactly once and drains the queue.
    service.report_connectivity(true);
    let snap = wait_until(&service, |s| {
        s.pending_actions == 0 && s.sync_phase == SyncPhase::Completed
    })
    .await;
    assert!(snap.is_online);
    assert_eq!(transport.calls().await.len(), 1);
}

#[tokio::test]
async fn going_offline_mid_drain_leaves_the_queue_intact() {
    let pool = setup_pool().await;
    let clock = test_clock();
    let transport = ScriptedTransport::default();
    let release = transport.hold_next().await;
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        clock.clone(),
        test_options(),
    )
    .await
    .unwrap();

    service
        .queue_action("mark_attendance", json!({"status": "present"}), None)
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(1));
    service
        .queue_action(
            "submit_hourly_log",
            json!({"log_id": "l-9", "session_id": "s-2", "text": "late entry"}),
            None,
        )
        .await
        .unwrap();

    service.report_connectivity(true);
    transport.wait_for_calls(1).await;
    // Connectivity drops while the first replay is parked in the transport.
    service.report_connectivity(false);
    wait_until(&service, |s| !s.is_online).await;
    release.send(()).unwrap();

    // The drain stops without claiming completion; the untouched action
    // stays queued for the next reconnect.
    let snap = wait_until(&service, |s| {
        s.sync_phase == SyncPhase::Idle && s.pending_actions == 1
    })
    .await;
    assert!(snap.last_sync_time.is_none());
    assert_eq!(transport.calls().await.len(), 1);

    service.report_connectivity(true);
    let snap = wait_until(&service, |s| {
        s.pending_actions == 0 && s.sync_phase == SyncPhase::Completed
    })
    .await;
    assert!(snap.last_sync_time.is_some());
    assert_eq!(transport.calls().await.len(), 2);
}

#[tokio::test]
async fn triggers_during_a_busy_drain_coalesce_into_a_follow_up_pass() {
    let pool = setup_pool().await;
    let transport = ScriptedTransport::default();
    let release = transport.hold_next().await;
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        test_clock(),
        test_options(),
    )
    .await
    .unwrap();

    service
        .queue_action("mark_attendance", json!({"status": "present"}), None)
        .await
        .unwrap();
    service.report_connectivity(true);
    transport.wait_for_calls(1).await;

    // Both arrive while the coordinator is busy inside the transport; they
    // must not interleave a second drain, and must not be lost either.
    service.force_sync().await.unwrap();
    let id = service
        .queue_action("request_leave", json!({"leave_id": "lv-1"}), None)
        .await
        .unwrap();
    release.send(()).unwrap();

    let snap = wait_until(&service, |s| {
        s.pending_actions == 0 && s.sync_phase == SyncPhase::Completed
    })
    .await;
    assert!(snap.sync_errors.is_empty());
    assert_eq!(transport.calls().await.len(), 2);
    let action = service.get_action(&id).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Done);
}

#[tokio::test]
async fn cache_writes_bump_the_snapshot_generation() {
    let pool = setup_pool().await;
    let transport = ScriptedTransport::default();
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        test_clock(),
        test_options(),
    )
    .await
    .unwrap();

    assert_eq!(service.snapshot().cache_generation, 0);
    service
        .queue_action("mark_attendance", json!({"status": "present"}), None)
        .await
        .unwrap();
    // The optimistic write is a cache change subscribers must re-pull for.
    assert_eq!(service.snapshot().cache_generation, 1);

    service.report_connectivity(true);
    let snap = wait_until(&service, |s| {
        s.pending_actions == 0 && s.sync_phase == SyncPhase::Completed
    })
    .await;
    // Reconciliation replaced the projection with the server's value.
    assert_eq!(snap.cache_generation, 2);
}

#[tokio::test]
async fn manual_retry_replays_a_terminal_action() {
    let pool = setup_pool().await;
    let transport = ScriptedTransport::with_responses(vec![
        Err(TransportError::ServerRejection {
            status: 422,
            message: "log text required".into(),
        }),
        Ok(json!({"id": "l-1", "text": "wrote the thing"})),
    ]);
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        test_clock(),
        test_options(),
    )
    .await
    .unwrap();

    let id = service
        .queue_action(
            "submit_hourly_log",
            json!({"log_id": "l-1", "session_id": "s-2", "text": "wrote the thing"}),
            None,
        )
        .await
        .unwrap();
    service.report_connectivity(true);
    wait_until(&service, |s| s.sync_phase == SyncPhase::Error).await;

    service.retry_action(&id).await.unwrap();
    let action = service.get_action(&id).await.unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Done);
    let snap = service.snapshot();
    assert!(snap.sync_errors.is_empty());
    assert_eq!(snap.sync_phase, SyncPhase::Completed);
    let rec = service.get_record("hourly_log:l-1").await.unwrap().unwrap();
    assert!(rec.synced);
}

#[tokio::test]
async fn integration_bugs_raise_at_the_enqueue_call_site() {
    let pool = setup_pool().await;
    let transport = ScriptedTransport::default();
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        test_clock(),
        test_options(),
    )
    .await
    .unwrap();

    let err = service
        .queue_action("fly_to_moon", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidActionType(_)));

    let err = service
        .queue_action("start_duty_session", json!({"note": "no session id"}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPayload { .. }));
}

#[tokio::test]
async fn force_sync_is_a_no_op_while_offline() {
    let pool = setup_pool().await;
    let transport = ScriptedTransport::default();
    let service = SyncService::start(
        pool,
        Arc::new(transport.clone()),
        test_clock(),
        test_options(),
    )
    .await
    .unwrap();

    service
        .queue_action("mark_attendance", json!({"status": "present"}), None)
        .await
        .unwrap();
    service.force_sync().await.unwrap();

    assert!(transport.calls().await.is_empty());
    let snap = service.snapshot();
    assert_eq!(snap.sync_phase, SyncPhase::Idle);
    assert_eq!(snap.pending_actions, 1);
}
