//! The scheduler loop.
//!
//! A single-writer process that keeps an in-memory calendar of active tasks
//! and materializes each firing into the due-work queue. Exactly one
//! scheduler may run per cluster; start every other process with
//! `--no-scheduler`.
//!
//! Task changes arrive over the store's LISTEN/NOTIFY channel; a periodic
//! sweep re-reads changed tasks as the fallback for lost notifications.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use ordinaut_schedule::Schedule;
use sqlx::postgres::PgListener;
use uuid::Uuid;

use crate::model::{Task, TaskStatus};
use crate::store::audit_in;
use crate::{queue, store::Store, SharedState};

const ACTOR: &str = "scheduler";

struct Entry {
    task: Task,
    schedule: Schedule,
}

#[derive(serde::Deserialize)]
struct TaskChange {
    id: Uuid,
}

pub struct Scheduler {
    shared: Arc<SharedState>,
    store: Store,
    entries: HashMap<Uuid, Entry>,
    /// Min-heap of (next fire, task). Entries go stale when a task reloads;
    /// they are skipped on pop by checking against the task's recorded next
    /// fire.
    calendar: BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>>,
    /// Tasks with updated_at past this watermark get reloaded on the next
    /// sweep.
    reload_watermark: DateTime<Utc>,
    fired: u64,
}

impl Scheduler {
    pub fn new(shared: Arc<SharedState>) -> Self {
        let store = shared.store();
        Self {
            shared,
            store,
            entries: HashMap::new(),
            calendar: BinaryHeap::new(),
            reload_watermark: Utc::now(),
            fired: 0,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut listener = PgListener::connect_with(&self.shared.pool)
            .await
            .context("failed to open the task change listener")?;
        listener.listen("ordinaut:task").await?;

        self.load_all().await.context("failed to load the task calendar")?;
        tracing::info!(tasks = self.entries.len(), "scheduler calendar loaded");

        let interval = self.shared.config.scheduler_interval;
        let mut next_sweep = tokio::time::Instant::now();

        loop {
            let sleep_until = match self.earliest_fire() {
                Some(at) => {
                    let delay = (at - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::Instant::now() + delay.min(interval)
                }
                None => tokio::time::Instant::now() + interval,
            };
            let deadline = sleep_until.min(next_sweep);

            tokio::select! {
                biased;

                _ = self.shared.shutdown.cancelled() => break,
                notification = listener.try_recv() => match notification {
                    Ok(Some(event)) => {
                        match serde_json::from_str::<TaskChange>(event.payload()) {
                            Ok(change) => {
                                if let Err(e) = self.reload_task(change.id).await {
                                    tracing::warn!("failed to reload task {}: {e:#}", change.id);
                                    self.shared.note_store_failure();
                                }
                            }
                            Err(e) => tracing::warn!(
                                "invalid payload on the task change channel: {e}"
                            ),
                        }
                    }
                    // The listener reconnected; notifications may have been
                    // lost in between, so rebuild the whole calendar.
                    Ok(None) => {
                        if let Err(e) = self.load_all().await {
                            tracing::warn!("failed to rebuild the calendar: {e:#}");
                            self.shared.note_store_failure();
                        }
                    }
                    Err(e) => {
                        tracing::warn!("task change listener error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {}
            }

            self.fire_due().await;

            if tokio::time::Instant::now() >= next_sweep {
                self.sweep().await;
                next_sweep = tokio::time::Instant::now() + interval;
            }
        }

        Ok(())
    }

    fn earliest_fire(&self) -> Option<DateTime<Utc>> {
        self.calendar.peek().map(|Reverse((at, _))| *at)
    }

    async fn load_all(&mut self) -> anyhow::Result<()> {
        self.entries.clear();
        self.calendar.clear();
        self.reload_watermark = Utc::now();

        let tasks = self.store.list_active_tasks().await?;
        for task in tasks {
            self.install_task(task).await?;
        }

        self.shared.note_store_ok();
        Ok(())
    }

    /// Put a task on the calendar, computing and recording its next fire if
    /// the store does not carry one yet. A task whose expression no longer
    /// parses is flipped to paused with an audit entry.
    async fn install_task(&mut self, task: Task) -> anyhow::Result<()> {
        let schedule = match Schedule::parse(
            task.schedule_kind.into(),
            &task.schedule_expr,
            &task.timezone,
            task.created_at,
        ) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!(task_id = %task.id, "unschedulable task: {e}");
                self.mark_unschedulable(&task, &e.to_string()).await?;
                return Ok(());
            }
        };

        if !schedule.kind().is_wall_clock() {
            // Event/condition tasks never appear on the calendar; their
            // firings are inserted by the external publisher.
            self.entries.remove(&task.id);
            return Ok(());
        }

        let next = match task.next_run_at {
            Some(at) => Some(at),
            None => {
                let next = schedule.next_fire(Utc::now());
                Store::record_next_fire(&self.shared.pool, task.id, next).await?;
                next
            }
        };

        let id = task.id;
        let mut entry = Entry { task, schedule };
        entry.task.next_run_at = next;
        self.entries.insert(id, entry);

        if let Some(at) = next {
            self.calendar.push(Reverse((at, id)));
        }

        Ok(())
    }

    async fn mark_unschedulable(&self, task: &Task, error: &str) -> anyhow::Result<()> {
        let mut tx = self.shared.pool.begin().await?;
        sqlx::query("UPDATE task SET status = 'paused', updated_at = now() WHERE id = $1")
            .bind(task.id)
            .execute(&mut *tx)
            .await?;
        audit_in(
            &mut *tx,
            ACTOR,
            "schedule_invalid",
            Some(task.id),
            serde_json::json!({ "error": error }),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reload_task(&mut self, id: Uuid) -> anyhow::Result<()> {
        match self.store.get_task(id).await? {
            Some(task) if task.status == TaskStatus::Active => {
                self.install_task(task).await?;
            }
            Some(_) | None => {
                self.entries.remove(&id);
                // Status transitions through the store already purge the
                // queue; this covers direct store edits.
                sqlx::query(
                    "DELETE FROM due_work WHERE task_id = $1 AND locked_until IS NULL",
                )
                .bind(id)
                .execute(&self.shared.pool)
                .await?;
            }
        }

        self.shared.note_store_ok();
        Ok(())
    }

    async fn fire_due(&mut self) {
        let now = Utc::now();

        while let Some(Reverse((at, id))) = self.calendar.peek().copied() {
            if at > now {
                break;
            }
            self.calendar.pop();

            let Some(entry) = self.entries.get(&id) else { continue };
            if entry.task.next_run_at != Some(at) {
                // Superseded by a reload.
                continue;
            }

            let schedule = entry.schedule.clone();
            match self.fire(id, &schedule, at, now).await {
                Ok(next) => {
                    self.fired += 1;
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.task.next_run_at = next;
                    }
                    if let Some(next) = next {
                        self.calendar.push(Reverse((next, id)));
                    }
                    self.shared.note_store_ok();
                }
                Err(e) => {
                    tracing::warn!(task_id = %id, "failed to enqueue firing: {e:#}");
                    self.shared.note_store_failure();
                    // Leave the firing on the calendar and retry on the next
                    // wakeup.
                    self.calendar.push(Reverse((at, id)));
                    break;
                }
            }
        }
    }

    /// Enqueue one firing and record the next.
    ///
    /// A late wakeup may have passed several nominal firings; those coalesce
    /// to the single catch-up row at the original `run_at`, and the dropped
    /// count is recorded as a `misfire` audit event.
    async fn fire(
        &self,
        task_id: Uuid,
        schedule: &Schedule,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let mut next = schedule.next_fire(at);
        let mut dropped: i64 = 0;
        while let Some(n) = next {
            if n > now {
                break;
            }
            dropped += 1;
            next = schedule.next_fire(n);
        }

        let mut tx = self.shared.pool.begin().await?;
        queue::insert(&mut *tx, task_id, at).await?;
        Store::record_next_fire(&mut *tx, task_id, next).await?;
        if dropped > 0 {
            audit_in(
                &mut *tx,
                ACTOR,
                "misfire",
                Some(task_id),
                serde_json::json!({ "misfire_coalesced": dropped }),
            )
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(task_id = %task_id, run_at = %at, "firing enqueued");
        Ok(next)
    }

    /// Periodic bookkeeping: reload changed tasks, refresh gauges, and keep
    /// the scheduler's own heartbeat row current.
    async fn sweep(&mut self) {
        let watermark = self.reload_watermark;
        self.reload_watermark = Utc::now();

        let changed = sqlx::query_as::<_, Task>("SELECT * FROM task WHERE updated_at > $1")
            .bind(watermark)
            .fetch_all(&self.shared.pool)
            .await;
        match changed {
            Ok(tasks) => {
                for task in tasks {
                    let id = task.id;
                    let result = if task.status == TaskStatus::Active {
                        self.install_task(task).await
                    } else {
                        self.reload_task(id).await
                    };
                    if let Err(e) = result {
                        tracing::warn!(task_id = %id, "sweep reload failed: {e:#}");
                        self.shared.note_store_failure();
                    }
                }
            }
            Err(e) => {
                tracing::warn!("sweep query failed: {e:#}");
                self.shared.note_store_failure();
                self.reload_watermark = watermark;
            }
        }

        if let Ok(depth) = queue::depth(&self.shared.pool).await {
            metrics::gauge!("orchestrator_due_work_queue_depth").set(depth as f64);
        }
        if let Ok(oldest) = queue::oldest_ready(&self.shared.pool).await {
            let lag = oldest
                .map(|at| (Utc::now() - at).num_milliseconds().max(0) as f64 / 1000.0)
                .unwrap_or(0.0);
            metrics::gauge!("orchestrator_scheduler_lag_seconds").set(lag);
        }

        let pid = std::process::id() as i32;
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = self
            .store
            .upsert_heartbeat(ACTOR, self.fired as i64, pid, &hostname)
            .await
        {
            tracing::warn!("failed to update the scheduler heartbeat: {e:#}");
        }
    }
}
