//! The due-work queue claim protocol.
//!
//! This is the contract between the scheduler (producer) and the workers
//! (consumers): a single transaction selects one ready row with a row-level
//! exclusive lock that skips already-locked rows, then stamps the lease onto
//! it. Producers never block consumers; no two workers ever see the same row
//! as claimable at once.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::model::{DueWork, Task};
use crate::util::pg_interval;

/// A due-work row this worker now holds the lease on, joined with its task.
#[derive(Debug)]
pub struct ClaimedWork {
    pub work: DueWork,
    pub task: Task,
}

/// Claim one ready row, highest priority first, FIFO within a priority.
///
/// Returns `None` when nothing is ready. The returned row's lease belongs to
/// `worker_id` until `locked_until`; the worker must delete, re-enqueue, or
/// release the row before then.
pub async fn claim_one(
    pool: &PgPool,
    worker_id: &str,
    lease: Duration,
) -> anyhow::Result<Option<ClaimedWork>> {
    let mut tx = pool.begin().await?;

    let work = sqlx::query_as::<_, DueWork>(
        r#"
        WITH candidate AS (
            SELECT dw.id
              FROM due_work dw
              JOIN task t ON t.id = dw.task_id
             WHERE dw.run_at <= now()
               AND (dw.locked_until IS NULL OR dw.locked_until < now())
               AND t.status = 'active'
             ORDER BY t.priority DESC, dw.run_at ASC, dw.id ASC
             LIMIT 1
               FOR UPDATE OF dw SKIP LOCKED
        )
        UPDATE due_work
           SET locked_until = now() + $2, locked_by = $1
          FROM candidate
         WHERE due_work.id = candidate.id
        RETURNING due_work.*
        "#,
    )
    .bind(worker_id)
    .bind(pg_interval(lease))
    .fetch_optional(&mut *tx)
    .await?;

    let Some(work) = work else {
        tx.commit().await?;
        return Ok(None);
    };

    let task = sqlx::query_as::<_, Task>("SELECT * FROM task WHERE id = $1")
        .bind(work.task_id)
        .fetch_optional(&mut *tx)
        .await?;

    tx.commit().await?;

    // The task can only be gone if it was deleted between the two statements;
    // its due_work rows cascade away with it, so there is nothing to release.
    Ok(task.map(|task| ClaimedWork { work, task }))
}

/// Insert a fresh firing. Used by the scheduler and by external event
/// publishers for event/condition tasks.
pub async fn insert<'e>(
    executor: impl PgExecutor<'e>,
    task_id: Uuid,
    run_at: DateTime<Utc>,
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO due_work (task_id, run_at) VALUES ($1, $2) RETURNING id",
    )
    .bind(task_id)
    .bind(run_at)
    .fetch_one(executor)
    .await
}

/// Release a claim without consuming the row, optionally pushing `run_at`
/// into the near future so the releasing worker does not immediately
/// re-claim it.
pub async fn release<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    delay: Option<Duration>,
) -> sqlx::Result<()> {
    match delay {
        Some(delay) => {
            sqlx::query(
                "UPDATE due_work \
                 SET locked_until = NULL, locked_by = NULL, run_at = now() + $2 \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(pg_interval(delay))
            .execute(executor)
            .await?;
        }
        None => {
            sqlx::query(
                "UPDATE due_work SET locked_until = NULL, locked_by = NULL WHERE id = $1",
            )
            .bind(id)
            .execute(executor)
            .await?;
        }
    }
    Ok(())
}

/// Consume the row: the firing is finalized (success, terminal failure, or
/// dedupe skip).
pub async fn delete<'e>(executor: impl PgExecutor<'e>, id: i64) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM due_work WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Hand the row back for a retry: new target instant, recorded attempt,
/// lease cleared.
pub async fn requeue<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    run_at: DateTime<Utc>,
    attempt: i32,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE due_work \
         SET run_at = $2, attempt = $3, locked_until = NULL, locked_by = NULL \
         WHERE id = $1",
    )
    .bind(id)
    .bind(run_at)
    .bind(attempt)
    .execute(executor)
    .await?;
    Ok(())
}

/// Number of rows ready to claim right now.
pub async fn depth(pool: &PgPool) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM due_work \
         WHERE run_at <= now() AND (locked_until IS NULL OR locked_until < now())",
    )
    .fetch_one(pool)
    .await
}

/// Target instant of the oldest unclaimed firing, for the scheduler lag
/// gauge.
pub async fn oldest_ready(pool: &PgPool) -> sqlx::Result<Option<DateTime<Utc>>> {
    sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "SELECT MIN(run_at) FROM due_work WHERE locked_until IS NULL",
    )
    .fetch_one(pool)
    .await
}
