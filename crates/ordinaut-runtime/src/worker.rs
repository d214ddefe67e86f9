//! The worker runtime.
//!
//! Each process runs `worker_concurrency` execution slots over a shared
//! claim loop, plus one heartbeat loop. A slot claims a due-work row, passes
//! the concurrency gate, opens a run, executes the pipeline, and finalizes
//! the run and the queue row inside one transaction. Failed claims back off
//! exponentially between 50ms and 1s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures_concurrency::future::Join;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use uuid::Uuid;

use crate::backoff::retry_delay;
use crate::error::RunError;
use crate::model::{DueWork, Task};
use crate::pipeline::{Executor, Pipeline};
use crate::queue::{self, ClaimedWork};
use crate::store::audit_in;
use crate::SharedState;

const MIN_POLL: Duration = Duration::from_millis(50);
const MAX_POLL: Duration = Duration::from_secs(1);

pub struct Worker {
    shared: Arc<SharedState>,
    worker_id: String,
    executor: Executor,
    processed: AtomicU64,
}

impl Worker {
    pub fn new(shared: Arc<SharedState>) -> Self {
        let hostname = hostname();
        let worker_id = format!("{hostname}-{}", Uuid::new_v4().simple());
        let executor = Executor::new(shared.tools.clone(), shared.config.step_timeout);

        Self { shared, worker_id, executor, processed: AtomicU64::new(0) }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let store = self.shared.store();
        store
            .upsert_heartbeat(&self.worker_id, 0, std::process::id() as i32, &hostname())
            .await
            .context("failed to register the worker heartbeat")?;

        tracing::info!(worker_id = %self.worker_id, "worker starting");

        let slots: Vec<_> = (0..self.shared.config.worker_concurrency)
            .map(|slot| self.slot_loop(slot))
            .collect();
        let (slot_results, heartbeat) = (slots.join(), self.heartbeat_loop()).join().await;

        // A clean shutdown removes the heartbeat row; dead workers leave
        // theirs behind for the reaper to prune.
        if let Err(e) = store.delete_heartbeat(&self.worker_id).await {
            tracing::warn!("failed to delete the worker heartbeat: {e:#}");
        }

        heartbeat?;
        for result in slot_results {
            result?;
        }

        tracing::info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    async fn slot_loop(&self, slot: usize) -> anyhow::Result<()> {
        let mut idle = MIN_POLL;

        loop {
            if self.shared.shutdown.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(true) => {
                    idle = MIN_POLL;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(slot, "worker poll failed: {e:#}");
                    self.shared.note_store_failure();
                }
            }

            tokio::select! {
                biased;

                _ = self.shared.shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
            idle = (idle * 2).min(MAX_POLL);
        }

        Ok(())
    }

    /// Claim and process at most one due-work row. Returns whether a row was
    /// claimed, which resets the caller's poll backoff.
    pub async fn poll_once(&self) -> anyhow::Result<bool> {
        let lease = self.shared.config.lease_duration;
        let Some(claimed) = queue::claim_one(&self.shared.pool, &self.worker_id, lease).await?
        else {
            self.shared.note_store_ok();
            return Ok(false);
        };
        self.shared.note_store_ok();

        let task_id = claimed.task.id;
        let work_id = claimed.work.id;
        self.process(claimed)
            .await
            .with_context(|| format!("processing due_work {work_id} of task {task_id}"))?;

        Ok(true)
    }

    async fn process(&self, claimed: ClaimedWork) -> anyhow::Result<()> {
        let ClaimedWork { work, task } = claimed;

        // Concurrency gate: tasks sharing a key execute serially across the
        // whole cluster. Losing the lock is not a failure; the row goes back
        // with a nudged run_at so this worker does not spin on it.
        let gate = match task.concurrency_key() {
            Some(key) => match ConcurrencyGate::acquire(&self.shared, key).await? {
                Some(gate) => Some(gate),
                None => {
                    tracing::debug!(task_id = %task.id, key, "concurrency gate busy");
                    queue::release(&self.shared.pool, work.id, Some(Duration::from_secs(1)))
                        .await?;
                    return Ok(());
                }
            },
            None => None,
        };

        let result = self.process_locked(&work, &task).await;

        if let Some(gate) = gate {
            gate.release().await;
        }

        result
    }

    async fn process_locked(&self, work: &DueWork, task: &Task) -> anyhow::Result<()> {
        let store = self.shared.store();

        // A firing already satisfied inside the dedupe window is consumed
        // without a run.
        if store.dedupe_satisfied(task, work.run_at).await? {
            let mut tx = self.shared.pool.begin().await?;
            queue::delete(&mut *tx, work.id).await?;
            audit_in(
                &mut *tx,
                &self.worker_id,
                "dedupe_skip",
                Some(task.id),
                serde_json::json!({
                    "dedupe_key": task.dedupe_key,
                    "run_at": work.run_at,
                }),
            )
            .await?;
            tx.commit().await?;
            return Ok(());
        }

        let attempt = work.attempt + 1;
        let run_id = self.open_run(work, task, attempt).await?;

        let outcome = self.execute(task).await;
        self.finalize(work, task, run_id, attempt, outcome).await?;

        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn open_run(&self, work: &DueWork, task: &Task, attempt: i32) -> anyhow::Result<Uuid> {
        let run_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO task_run (task_id, lease_owner, leased_until, started_at, attempt)
            VALUES ($1, $2, now() + $3, now(), $4)
            RETURNING id
            "#,
        )
        .bind(task.id)
        .bind(&self.worker_id)
        .bind(crate::util::pg_interval(self.shared.config.lease_duration))
        .bind(attempt)
        .fetch_one(&self.shared.pool)
        .await?;

        tracing::info!(
            task_id = %task.id,
            run_id = %run_id,
            attempt,
            "run started"
        );
        Ok(run_id)
    }

    async fn execute(&self, task: &Task) -> Result<serde_json::Value, RunError> {
        let pipeline = Pipeline::from_payload(&task.payload)
            .map_err(|e| RunError::terminal(e.to_string()))?;
        let tz: chrono_tz::Tz = task
            .timezone
            .parse()
            .map_err(|_| RunError::terminal(format!("unknown timezone {:?}", task.timezone)))?;

        // The lease horizon bounds the whole run. A pipeline that crosses it
        // is cut off here; if the worker had died instead, the reaper would
        // reach the same verdict.
        match tokio::time::timeout(
            self.shared.config.lease_duration,
            self.executor.execute(&pipeline, tz, Utc::now()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RunError::retryable("lease_expired")),
        }
    }

    /// Write the run's outcome and settle the queue row, atomically.
    async fn finalize(
        &self,
        work: &DueWork,
        task: &Task,
        run_id: Uuid,
        attempt: i32,
        outcome: Result<serde_json::Value, RunError>,
    ) -> anyhow::Result<()> {
        let mut tx = self.shared.pool.begin().await?;

        match outcome {
            Ok(output) => {
                // Guarded on `success IS NULL` so a run the reaper already
                // expired is not resurrected.
                let finalized = sqlx::query(
                    "UPDATE task_run \
                     SET finished_at = now(), success = TRUE, output = $2 \
                     WHERE id = $1 AND success IS NULL",
                )
                .bind(run_id)
                .bind(&output)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                    > 0;

                if finalized {
                    queue::delete(&mut *tx, work.id).await?;
                    metrics::counter!("orchestrator_runs_total", "status" => "success")
                        .increment(1);
                    tracing::info!(task_id = %task.id, run_id = %run_id, "run succeeded");
                }
            }
            Err(error) => {
                let terminal = !error.is_retryable() || attempt > task.max_retries;
                let message = error.to_string();

                let finalized = sqlx::query(
                    "UPDATE task_run \
                     SET finished_at = now(), success = FALSE, error = $2 \
                     WHERE id = $1 AND success IS NULL",
                )
                .bind(run_id)
                .bind(&message)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                    > 0;

                if finalized {
                    if terminal {
                        queue::delete(&mut *tx, work.id).await?;
                        audit_in(
                            &mut *tx,
                            &self.worker_id,
                            "run_failed_terminal",
                            Some(task.id),
                            serde_json::json!({ "run_id": run_id, "attempt": attempt, "error": message }),
                        )
                        .await?;
                        metrics::counter!("orchestrator_runs_total", "status" => "failure")
                            .increment(1);
                        tracing::warn!(
                            task_id = %task.id,
                            run_id = %run_id,
                            attempt,
                            "run failed terminally: {message}"
                        );
                    } else {
                        let delay =
                            retry_delay(task.backoff_strategy, attempt, self.shared.config.backoff_base);
                        let run_at = Utc::now()
                            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                        queue::requeue(&mut *tx, work.id, run_at, attempt).await?;
                        metrics::counter!("orchestrator_runs_total", "status" => "retry")
                            .increment(1);
                        tracing::info!(
                            task_id = %task.id,
                            run_id = %run_id,
                            attempt,
                            retry_in = %humantime::format_duration(delay),
                            "run failed, retrying: {message}"
                        );
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Keep this worker's heartbeat row current. Updates are jittered
    /// downwards by up to a quarter period.
    async fn heartbeat_loop(&self) -> anyhow::Result<()> {
        let store = self.shared.store();
        let pid = std::process::id() as i32;
        let host = hostname();
        let mut next = tokio::time::Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = self.shared.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }

            let processed = self.processed.load(Ordering::Relaxed) as i64;
            if let Err(e) = store.upsert_heartbeat(&self.worker_id, processed, pid, &host).await {
                tracing::warn!("heartbeat update failed: {e:#}");
                self.shared.note_store_failure();
            } else {
                self.shared.note_store_ok();
            }

            next += crate::util::jittered(self.shared.config.heartbeat_interval);
        }

        Ok(())
    }
}

/// A held advisory lock for a concurrency key.
///
/// Advisory locks are session-scoped, so the guard pins the connection it
/// acquired the lock on and releases the lock on that same connection.
struct ConcurrencyGate {
    conn: PoolConnection<Postgres>,
    key: String,
}

impl ConcurrencyGate {
    async fn acquire(shared: &SharedState, key: &str) -> anyhow::Result<Option<Self>> {
        let mut conn = shared.pool.acquire().await?;

        let acquired =
            sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock(hashtext($1))")
                .bind(key)
                .fetch_one(&mut *conn)
                .await?;

        Ok(acquired.then(|| Self { conn, key: key.to_string() }))
    }

    async fn release(mut self) {
        let result = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&self.key)
            .fetch_one(&mut *self.conn)
            .await;

        match result {
            Ok(true) => {}
            Ok(false) => tracing::warn!(key = %self.key, "advisory lock was not held at release"),
            // The connection is dropped either way; Postgres releases
            // session-scoped advisory locks when the session ends.
            Err(e) => tracing::warn!(key = %self.key, "failed to release advisory lock: {e}"),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
