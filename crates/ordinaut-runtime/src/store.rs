//! Access layer for the durable store.
//!
//! All cross-process coordination flows through Postgres; no worker holds
//! state another worker needs. The store handle is created once at startup
//! and shared by reference with the scheduler, workers, and reaper.

use chrono::{DateTime, Utc};
use ordinaut_schedule::{Schedule, ScheduleError};
use serde::Deserialize;
use serde_json::Value;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::model::{Agent, BackoffKind, ScheduleKind, Task, TaskRun, TaskStatus, WorkerHeartbeat};
use crate::pipeline::{Pipeline, ValidationError};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Apply pending migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

/// A task-create request, as accepted from the API boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub created_by: Uuid,
    pub schedule_kind: ScheduleKind,
    pub schedule_expr: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub payload: Value,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub dedupe_window_seconds: Option<i32>,
    #[serde(default)]
    pub max_retries: i32,
    #[serde(default = "default_backoff")]
    pub backoff_strategy: String,
    #[serde(default)]
    pub concurrency_key: Option<String>,
}

fn default_timezone() -> String {
    "Europe/Chisinau".to_string()
}

fn default_priority() -> i32 {
    5
}

fn default_backoff() -> String {
    "exponential_jitter".to_string()
}

/// Rejections at task create. These are configuration errors: the request
/// never reaches the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum CreateTaskError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Pipeline(#[from] ValidationError),

    #[error("{0}")]
    Backoff(String),

    #[error("priority must be within [1, 9], got {0}")]
    Priority(i32),

    #[error("max_retries must be >= 0, got {0}")]
    MaxRetries(i32),

    #[error("dedupe_key requires a positive dedupe_window_seconds")]
    DedupeWindow,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Validate and persist a new task.
    ///
    /// The schedule expression, backoff identifier, and pipeline payload are
    /// all checked here; anything malformed is rejected instead of being
    /// discovered by the scheduler later.
    pub async fn create_task(&self, new: NewTask, actor: &str) -> Result<Task, CreateTaskError> {
        if !(1..=9).contains(&new.priority) {
            return Err(CreateTaskError::Priority(new.priority));
        }
        if new.max_retries < 0 {
            return Err(CreateTaskError::MaxRetries(new.max_retries));
        }
        if new.dedupe_key.is_some() && !matches!(new.dedupe_window_seconds, Some(w) if w > 0) {
            return Err(CreateTaskError::DedupeWindow);
        }

        let backoff: BackoffKind =
            new.backoff_strategy.parse().map_err(CreateTaskError::Backoff)?;

        let now = Utc::now();
        let schedule =
            Schedule::parse(new.schedule_kind.into(), &new.schedule_expr, &new.timezone, now)?;
        let next_run_at = schedule.next_fire(now);

        Pipeline::from_payload(&new.payload)?;

        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO task (
                title, description, created_by, schedule_kind, schedule_expr,
                timezone, payload, priority, dedupe_key, dedupe_window_seconds,
                max_retries, backoff_strategy, concurrency_key, next_run_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.created_by)
        .bind(new.schedule_kind)
        .bind(&new.schedule_expr)
        .bind(&new.timezone)
        .bind(&new.payload)
        .bind(new.priority)
        .bind(&new.dedupe_key)
        .bind(new.dedupe_window_seconds)
        .bind(new.max_retries)
        .bind(backoff)
        .bind(&new.concurrency_key)
        .bind(next_run_at)
        .fetch_one(&self.pool)
        .await?;

        self.audit(actor, "task_created", Some(task.id), serde_json::json!({})).await?;
        metrics::counter!("orchestrator_tasks_total").increment(1);

        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> sqlx::Result<Option<Task>> {
        sqlx::query_as::<_, Task>("SELECT * FROM task WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_active_tasks(&self) -> sqlx::Result<Vec<Task>> {
        sqlx::query_as::<_, Task>("SELECT * FROM task WHERE status = 'active' ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    /// Transition a task's status. Pausing or canceling eagerly drops any
    /// not-yet-claimed due work so nothing fires after the transition.
    pub async fn set_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        actor: &str,
    ) -> sqlx::Result<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let task = sqlx::query_as::<_, Task>(
            "UPDATE task SET status = $2, updated_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(status)
        .fetch_optional(&mut *tx)
        .await?;

        if task.is_some() && status != TaskStatus::Active {
            sqlx::query("DELETE FROM due_work WHERE task_id = $1 AND locked_until IS NULL")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        audit_in(
            &mut *tx,
            actor,
            "task_status_changed",
            Some(id),
            serde_json::json!({ "status": status }),
        )
        .await?;

        tx.commit().await?;
        Ok(task)
    }

    pub async fn delete_task(&self, id: Uuid, actor: &str) -> sqlx::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM task WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        if deleted {
            audit_in(&mut *tx, actor, "task_deleted", Some(id), serde_json::json!({})).await?;
        }

        tx.commit().await?;
        Ok(deleted)
    }

    /// Record the next firing instant the scheduler computed for a task.
    pub async fn record_next_fire<'e>(
        executor: impl PgExecutor<'e>,
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE task SET next_run_at = $2 WHERE id = $1")
            .bind(id)
            .bind(next_run_at)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: Uuid) -> sqlx::Result<Option<TaskRun>> {
        sqlx::query_as::<_, TaskRun>("SELECT * FROM task_run WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn create_agent(
        &self,
        name: &str,
        scopes: &[String],
        webhook_url: Option<&str>,
    ) -> sqlx::Result<Agent> {
        sqlx::query_as::<_, Agent>(
            "INSERT INTO agent (name, scopes, webhook_url) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(name)
        .bind(scopes)
        .bind(webhook_url)
        .fetch_one(&self.pool)
        .await
    }

    /// Whether a firing at `run_at` is already satisfied by a successful run
    /// inside the task's dedupe window.
    pub async fn dedupe_satisfied(&self, task: &Task, run_at: DateTime<Utc>) -> sqlx::Result<bool> {
        let Some(window) = task.dedupe_window_seconds.filter(|w| *w > 0) else {
            return Ok(false);
        };
        if task.dedupe_key.is_none() {
            return Ok(false);
        }

        let since = run_at - chrono::Duration::seconds(window as i64);
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM task_run
                WHERE task_id = $1
                  AND success = TRUE
                  AND started_at >= $2
                  AND started_at <= $3
            )
            "#,
        )
        .bind(task.id)
        .bind(since)
        .bind(run_at)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn audit(
        &self,
        actor: &str,
        action: &str,
        subject_id: Option<Uuid>,
        details: Value,
    ) -> sqlx::Result<()> {
        audit_in(&self.pool, actor, action, subject_id, details).await
    }

    pub async fn upsert_heartbeat(
        &self,
        worker_id: &str,
        processed: i64,
        pid: i32,
        hostname: &str,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeat (worker_id, last_seen, processed, pid, hostname)
            VALUES ($1, now(), $2, $3, $4)
            ON CONFLICT (worker_id) DO UPDATE
                SET last_seen = now(), processed = EXCLUDED.processed
            "#,
        )
        .bind(worker_id)
        .bind(processed)
        .bind(pid)
        .bind(hostname)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_heartbeat(&self, worker_id: &str) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM worker_heartbeat WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The most recent worker heartbeat, excluding the scheduler's own row.
    pub async fn latest_worker_heartbeat(&self) -> sqlx::Result<Option<WorkerHeartbeat>> {
        sqlx::query_as::<_, WorkerHeartbeat>(
            "SELECT * FROM worker_heartbeat WHERE worker_id <> 'scheduler' \
             ORDER BY last_seen DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn heartbeat_for(&self, worker_id: &str) -> sqlx::Result<Option<WorkerHeartbeat>> {
        sqlx::query_as::<_, WorkerHeartbeat>(
            "SELECT * FROM worker_heartbeat WHERE worker_id = $1",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
    }
}

/// Append an audit entry through any executor, so callers can fold the write
/// into their own transaction.
pub async fn audit_in<'e>(
    executor: impl PgExecutor<'e>,
    actor: &str,
    action: &str,
    subject_id: Option<Uuid>,
    details: Value,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO audit_log (actor, action, subject_id, details) VALUES ($1, $2, $3, $4)",
    )
    .bind(actor)
    .bind(action)
    .bind(subject_id)
    .bind(details)
    .execute(executor)
    .await?;
    Ok(())
}
