//! Store-backed properties of the claim protocol, worker, reaper, and
//! scheduler.
//!
//! These tests need a scratch Postgres database and are ignored by default:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/ordinaut_test \
//!     cargo test -p ordinaut-runtime -- --ignored --test-threads=1
//! ```
//!
//! The claim protocol is global by design, so the tests assume nothing else
//! is draining the queue while they run.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ordinaut_runtime::model::TaskRun;
use ordinaut_runtime::store::NewTask;
use ordinaut_runtime::tool::{ToolError, ToolTransport};
use ordinaut_runtime::{queue, store, Config, Reaper, Scheduler, SharedState, Worker};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

struct EchoTransport;

#[async_trait]
impl ToolTransport for EchoTransport {
    async fn invoke(&self, _: &str, input: Value, _: Duration) -> Result<Value, ToolError> {
        Ok(input)
    }
}

struct FlakyTransport {
    failures_left: AtomicU32,
    status: u16,
}

#[async_trait]
impl ToolTransport for FlakyTransport {
    async fn invoke(&self, _: &str, input: Value, _: Duration) -> Result<Value, ToolError> {
        if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            n.checked_sub(1)
        }).is_ok()
        {
            return Err(ToolError::Status { status: self.status, body: "injected".into() });
        }
        Ok(input)
    }
}

struct SleepTransport(Duration);

#[async_trait]
impl ToolTransport for SleepTransport {
    async fn invoke(&self, _: &str, input: Value, _: Duration) -> Result<Value, ToolError> {
        tokio::time::sleep(self.0).await;
        Ok(input)
    }
}

async fn shared_with(
    transport: Arc<dyn ToolTransport>,
    tweak: impl FnOnce(&mut Config),
) -> Arc<SharedState> {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must point at a scratch database for these tests");
    let pool = PgPool::connect(&url).await.expect("failed to connect");
    store::migrate(&pool).await.expect("failed to migrate");

    let mut config = Config { backoff_base: Duration::from_secs(1), ..Config::default() };
    tweak(&mut config);

    SharedState::new(pool, config, transport)
}

async fn make_agent(shared: &SharedState) -> Uuid {
    shared
        .store()
        .create_agent(&format!("test-agent-{}", Uuid::new_v4()), &[], None)
        .await
        .expect("failed to create agent")
        .id
}

fn echo_task(agent: Uuid) -> NewTask {
    task_body(
        agent,
        json!({
            "params": {"x": 42},
            "pipeline": [
                {"id": "echo", "uses": "test.echo", "with": {"v": "${params.x}"}, "save_as": "out"}
            ]
        }),
    )
}

fn task_body(agent: Uuid, payload: Value) -> NewTask {
    serde_json::from_value(json!({
        "title": "test task",
        "created_by": agent,
        "schedule_kind": "event",
        "schedule_expr": "test.topic",
        "timezone": "UTC",
        "payload": payload,
        "max_retries": 0,
        "backoff_strategy": "fixed",
    }))
    .unwrap()
}

async fn runs_for(pool: &PgPool, task_id: Uuid) -> Vec<TaskRun> {
    sqlx::query_as::<_, TaskRun>(
        "SELECT * FROM task_run WHERE task_id = $1 ORDER BY attempt",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .unwrap()
}

async fn due_rows_for(pool: &PgPool, task_id: Uuid) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM due_work WHERE task_id = $1")
        .bind(task_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Drive the worker until the task has no due work left, waiting out retry
/// delays along the way.
async fn drain_task(worker: &Worker, pool: &PgPool, task_id: Uuid, deadline: Duration) {
    let start = tokio::time::Instant::now();
    while due_rows_for(pool, task_id).await > 0 {
        assert!(start.elapsed() < deadline, "task {task_id} did not drain in {deadline:?}");
        worker.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
#[ignore = "requires a postgres database (set DATABASE_URL)"]
async fn p1_claims_are_exclusive() {
    let shared = shared_with(Arc::new(EchoTransport), |_| {}).await;
    let agent = make_agent(&shared).await;
    let task = shared.store().create_task(echo_task(agent), "test").await.unwrap();

    const ROWS: usize = 20;
    for _ in 0..ROWS {
        queue::insert(&shared.pool, task.id, Utc::now()).await.unwrap();
    }

    let claimed = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for worker in 0..8 {
        let shared = shared.clone();
        let claimed = claimed.clone();
        let task_id = task.id;
        handles.push(tokio::spawn(async move {
            let worker_id = format!("exclusivity-{worker}");
            let mut misses = 0;
            while misses < 5 {
                match queue::claim_one(&shared.pool, &worker_id, Duration::from_secs(300))
                    .await
                    .unwrap()
                {
                    // Hold the lease; never finalize. A row showing up twice
                    // means two workers claimed it concurrently.
                    Some(work) if work.task.id == task_id => {
                        claimed.lock().await.push(work.work.id);
                        misses = 0;
                    }
                    Some(_) => {}
                    None => {
                        misses += 1;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut ids = claimed.lock().await.clone();
    assert_eq!(ids.len(), ROWS, "every row claimed exactly once");
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), ROWS, "no row claimed twice");
}

#[tokio::test]
#[ignore = "requires a postgres database (set DATABASE_URL)"]
async fn p4_priority_beats_fifo() {
    let shared = shared_with(Arc::new(EchoTransport), |_| {}).await;
    let agent = make_agent(&shared).await;

    let mut low = echo_task(agent);
    low.priority = 1;
    let low = shared.store().create_task(low, "test").await.unwrap();
    let mut high = echo_task(agent);
    high.priority = 9;
    let high = shared.store().create_task(high, "test").await.unwrap();

    // The low-priority row is older, so FIFO alone would pick it first.
    queue::insert(&shared.pool, low.id, Utc::now()).await.unwrap();
    queue::insert(&shared.pool, high.id, Utc::now()).await.unwrap();

    let mut order = Vec::new();
    while order.len() < 2 {
        let work = queue::claim_one(&shared.pool, "priority-test", Duration::from_secs(300))
            .await
            .unwrap()
            .expect("both rows should be claimable");
        if work.task.id == low.id || work.task.id == high.id {
            order.push(work.task.id);
        }
    }

    assert_eq!(order, vec![high.id, low.id]);
}

#[tokio::test]
#[ignore = "requires a postgres database (set DATABASE_URL)"]
async fn scenario_simple_once_pipeline() {
    let shared = shared_with(Arc::new(EchoTransport), |_| {}).await;
    let agent = make_agent(&shared).await;
    let task = shared.store().create_task(echo_task(agent), "test").await.unwrap();

    queue::insert(&shared.pool, task.id, Utc::now()).await.unwrap();

    let worker = Worker::new(shared.clone());
    drain_task(&worker, &shared.pool, task.id, Duration::from_secs(10)).await;

    let runs = runs_for(&shared.pool, task.id).await;
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.success, Some(true));
    assert_eq!(run.attempt, 1);

    let output = run.output.as_ref().expect("successful run has output");
    assert_eq!(output["steps"]["out"]["v"], json!(42));
    assert_eq!(output["output"]["v"], json!(42));
}

#[tokio::test]
#[ignore = "requires a postgres database (set DATABASE_URL)"]
async fn scenario_retry_budget() {
    // Tool fails three times with 503 and then succeeds; with max_retries=3
    // the attempts run 1,2,3,4 and the last one lands the success.
    let transport = Arc::new(FlakyTransport { failures_left: AtomicU32::new(3), status: 503 });
    let shared = shared_with(transport, |c| c.backoff_base = Duration::from_secs(1)).await;
    let agent = make_agent(&shared).await;

    let mut new = echo_task(agent);
    new.max_retries = 3;
    let task = shared.store().create_task(new, "test").await.unwrap();

    queue::insert(&shared.pool, task.id, Utc::now()).await.unwrap();

    let worker = Worker::new(shared.clone());
    drain_task(&worker, &shared.pool, task.id, Duration::from_secs(30)).await;

    let runs = runs_for(&shared.pool, task.id).await;
    assert_eq!(runs.len(), 4);
    for (i, run) in runs.iter().enumerate() {
        assert_eq!(run.attempt, i as i32 + 1, "attempts strictly increase (P3)");
        let expected = i == 3;
        assert_eq!(run.success, Some(expected), "attempt {}", run.attempt);
    }
    assert_eq!(due_rows_for(&shared.pool, task.id).await, 0);
}

#[tokio::test]
#[ignore = "requires a postgres database (set DATABASE_URL)"]
async fn scenario_terminal_failure() {
    let transport = Arc::new(FlakyTransport { failures_left: AtomicU32::new(99), status: 400 });
    let shared = shared_with(transport, |_| {}).await;
    let agent = make_agent(&shared).await;

    let mut new = echo_task(agent);
    new.max_retries = 5;
    let task = shared.store().create_task(new, "test").await.unwrap();

    queue::insert(&shared.pool, task.id, Utc::now()).await.unwrap();

    let worker = Worker::new(shared.clone());
    drain_task(&worker, &shared.pool, task.id, Duration::from_secs(10)).await;

    let runs = runs_for(&shared.pool, task.id).await;
    assert_eq!(runs.len(), 1, "4xx is terminal, no retries");
    assert_eq!(runs[0].success, Some(false));
    let error = runs[0].error.as_deref().unwrap();
    assert!(error.starts_with("terminal:"), "{error}");
}

#[tokio::test]
#[ignore = "requires a postgres database (set DATABASE_URL)"]
async fn p6_dedupe_collapses_repeat_firings() {
    let shared = shared_with(Arc::new(EchoTransport), |_| {}).await;
    let agent = make_agent(&shared).await;

    let mut new = echo_task(agent);
    new.dedupe_key = Some(format!("dedupe-{}", Uuid::new_v4()));
    new.dedupe_window_seconds = Some(3600);
    let task = shared.store().create_task(new, "test").await.unwrap();

    let worker = Worker::new(shared.clone());

    queue::insert(&shared.pool, task.id, Utc::now()).await.unwrap();
    drain_task(&worker, &shared.pool, task.id, Duration::from_secs(10)).await;
    assert_eq!(runs_for(&shared.pool, task.id).await.len(), 1);

    // A second firing inside the window is consumed without a run.
    queue::insert(&shared.pool, task.id, Utc::now()).await.unwrap();
    drain_task(&worker, &shared.pool, task.id, Duration::from_secs(10)).await;

    assert_eq!(runs_for(&shared.pool, task.id).await.len(), 1);

    let skips = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM audit_log WHERE action = 'dedupe_skip' AND subject_id = $1",
    )
    .bind(task.id)
    .fetch_one(&shared.pool)
    .await
    .unwrap();
    assert_eq!(skips, 1);
}

#[tokio::test]
#[ignore = "requires a postgres database (set DATABASE_URL)"]
async fn p5_concurrency_key_serializes_runs() {
    let shared = shared_with(
        Arc::new(SleepTransport(Duration::from_millis(500))),
        |_| {},
    )
    .await;
    let agent = make_agent(&shared).await;

    let key = format!("gate-{}", Uuid::new_v4());
    let mut a = echo_task(agent);
    a.concurrency_key = Some(key.clone());
    let a = shared.store().create_task(a, "test").await.unwrap();
    let mut b = echo_task(agent);
    b.concurrency_key = Some(key);
    let b = shared.store().create_task(b, "test").await.unwrap();

    queue::insert(&shared.pool, a.id, Utc::now()).await.unwrap();
    queue::insert(&shared.pool, b.id, Utc::now()).await.unwrap();

    let worker = Arc::new(Worker::new(shared.clone()));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while due_rows_for(&shared.pool, a.id).await + due_rows_for(&shared.pool, b.id).await > 0 {
        assert!(tokio::time::Instant::now() < deadline);
        // Two slots polling concurrently, like the real worker pool.
        let (r1, r2) = tokio::join!(worker.poll_once(), worker.poll_once());
        r1.unwrap();
        r2.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut intervals: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    for task_id in [a.id, b.id] {
        let runs = runs_for(&shared.pool, task_id).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].success, Some(true));
        intervals.push((runs[0].started_at.unwrap(), runs[0].finished_at.unwrap()));
    }

    intervals.sort();
    assert!(
        intervals[0].1 <= intervals[1].0,
        "runs sharing a concurrency key must not overlap: {intervals:?}"
    );
}

#[tokio::test]
#[ignore = "requires a postgres database (set DATABASE_URL)"]
async fn scenario_dead_worker_recovery() {
    let shared = shared_with(Arc::new(EchoTransport), |_| {}).await;
    let agent = make_agent(&shared).await;

    let mut new = echo_task(agent);
    new.max_retries = 2;
    let task = shared.store().create_task(new, "test").await.unwrap();

    // Simulate a worker that claimed the row, opened a run, and died: both
    // leases are already expired, nothing was finalized.
    let work_id = queue::insert(&shared.pool, task.id, Utc::now()).await.unwrap();
    sqlx::query(
        "UPDATE due_work SET locked_by = 'dead-worker', locked_until = now() - interval '1 second' \
         WHERE id = $1",
    )
    .bind(work_id)
    .execute(&shared.pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO task_run (task_id, lease_owner, leased_until, started_at, attempt) \
         VALUES ($1, 'dead-worker', now() - interval '1 second', now() - interval '5 minutes', 1)",
    )
    .bind(task.id)
    .execute(&shared.pool)
    .await
    .unwrap();
    sqlx::query("UPDATE due_work SET attempt = 1 WHERE id = $1")
        .bind(work_id)
        .execute(&shared.pool)
        .await
        .unwrap();

    Reaper::new(shared.clone()).sweep_once().await.unwrap();

    let runs = runs_for(&shared.pool, task.id).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].success, Some(false));
    assert_eq!(runs[0].error.as_deref(), Some("lease_expired"));
    assert_eq!(due_rows_for(&shared.pool, task.id).await, 1, "firing re-enqueued");

    // Another worker picks the firing up and completes it.
    let worker = Worker::new(shared.clone());
    drain_task(&worker, &shared.pool, task.id, Duration::from_secs(30)).await;

    let runs = runs_for(&shared.pool, task.id).await;
    assert_eq!(runs.len(), 2, "one failed run, one recovery run");
    assert_eq!(runs[1].attempt, 2);
    assert_eq!(runs[1].success, Some(true));
}

#[tokio::test]
#[ignore = "requires a postgres database (set DATABASE_URL)"]
async fn scenario_misfire_coalescing() {
    let shared = shared_with(Arc::new(EchoTransport), |_| {}).await;
    let agent = make_agent(&shared).await;

    let mut new = task_body(agent, json!({
        "pipeline": [{"id": "echo", "uses": "test.echo", "with": {}}]
    }));
    new.schedule_kind = ordinaut_runtime::model::ScheduleKind::Cron;
    new.schedule_expr = "*/5 * * * *".to_string();
    let task = shared.store().create_task(new, "test").await.unwrap();

    // Pretend the scheduler was down for an hour: the recorded next fire is
    // ~12 five-minute firings in the past.
    let stale = Utc::now() - chrono::Duration::hours(1);
    sqlx::query("UPDATE task SET next_run_at = $2 WHERE id = $1")
        .bind(task.id)
        .bind(stale)
        .execute(&shared.pool)
        .await
        .unwrap();

    let handle = tokio::spawn(Scheduler::new(shared.clone()).run());
    tokio::time::sleep(Duration::from_secs(2)).await;
    shared.shutdown.cancel();
    handle.await.unwrap().unwrap();

    // Exactly one catch-up row, at the original missed instant.
    let rows = sqlx::query_as::<_, ordinaut_runtime::model::DueWork>(
        "SELECT * FROM due_work WHERE task_id = $1",
    )
    .bind(task.id)
    .fetch_all(&shared.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    // The catch-up row keeps the original missed instant (modulo the
    // store's microsecond precision).
    assert!((rows[0].run_at - stale).num_milliseconds().abs() <= 1);

    let coalesced = sqlx::query_scalar::<_, Value>(
        "SELECT details FROM audit_log \
         WHERE action = 'misfire' AND subject_id = $1 ORDER BY id DESC LIMIT 1",
    )
    .bind(task.id)
    .fetch_one(&shared.pool)
    .await
    .unwrap();
    let dropped = coalesced["misfire_coalesced"].as_i64().unwrap();
    assert!((10..=12).contains(&dropped), "dropped {dropped} firings");

    // The task is rescheduled in the future.
    let task = shared.store().get_task(task.id).await.unwrap().unwrap();
    assert!(task.next_run_at.unwrap() > Utc::now() - chrono::Duration::seconds(1));
    assert!(matches!(task.status, ordinaut_runtime::model::TaskStatus::Active));
}
