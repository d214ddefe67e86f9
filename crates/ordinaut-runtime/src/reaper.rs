//! The lease reaper.
//!
//! A periodic sweeper that makes dead workers harmless: orphaned runs are
//! converted to failed runs and re-enqueued (while the attempt budget
//! lasts), expired queue locks are cleared, and stale heartbeat rows are
//! pruned.

use std::sync::Arc;

use chrono::Utc;
use sqlx::FromRow;
use uuid::Uuid;

use crate::backoff::retry_delay;
use crate::model::BackoffKind;
use crate::store::audit_in;
use crate::SharedState;

const ACTOR: &str = "reaper";

/// Heartbeat rows older than this are dropped.
const HEARTBEAT_RETENTION_SECS: i64 = 3600;

#[derive(Debug, FromRow)]
struct OrphanedRun {
    id: Uuid,
    task_id: Uuid,
    attempt: i32,
    lease_owner: Option<String>,
    max_retries: i32,
    backoff_strategy: BackoffKind,
}

pub struct Reaper {
    shared: Arc<SharedState>,
}

impl Reaper {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let interval = self.shared.config.reaper_interval;
        let mut next = tokio::time::Instant::now() + interval;

        loop {
            tokio::select! {
                biased;

                _ = self.shared.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }

            match self.sweep_once().await {
                Ok(()) => self.shared.note_store_ok(),
                Err(e) => {
                    tracing::warn!("reaper sweep failed: {e:#}");
                    self.shared.note_store_failure();
                }
            }

            next += interval;
        }

        Ok(())
    }

    /// One full sweep. Public so operators (and tests) can force a pass.
    pub async fn sweep_once(&self) -> anyhow::Result<()> {
        self.expire_orphaned_runs().await?;

        // Clear expired claim locks after the orphan pass so the
        // lease_owner/locked_by linkage is still available above.
        let cleared = sqlx::query(
            "UPDATE due_work SET locked_until = NULL, locked_by = NULL \
             WHERE locked_until < now()",
        )
        .execute(&self.shared.pool)
        .await?
        .rows_affected();
        if cleared > 0 {
            tracing::debug!("released {cleared} expired queue locks");
        }

        let pruned = sqlx::query(
            "DELETE FROM worker_heartbeat WHERE last_seen < now() - make_interval(secs => $1)",
        )
        .bind(HEARTBEAT_RETENTION_SECS as f64)
        .execute(&self.shared.pool)
        .await?
        .rows_affected();
        if pruned > 0 {
            tracing::info!("pruned {pruned} stale worker heartbeats");
        }

        Ok(())
    }

    async fn expire_orphaned_runs(&self) -> anyhow::Result<()> {
        let orphans = sqlx::query_as::<_, OrphanedRun>(
            r#"
            SELECT tr.id, tr.task_id, tr.attempt, tr.lease_owner,
                   t.max_retries, t.backoff_strategy
              FROM task_run tr
              JOIN task t ON t.id = tr.task_id
             WHERE tr.success IS NULL
               AND tr.leased_until IS NOT NULL
               AND tr.leased_until < now()
            "#,
        )
        .fetch_all(&self.shared.pool)
        .await?;

        for orphan in orphans {
            if let Err(e) = self.expire_one(&orphan).await {
                tracing::warn!(run_id = %orphan.id, "failed to expire orphaned run: {e:#}");
            }
        }

        Ok(())
    }

    async fn expire_one(&self, orphan: &OrphanedRun) -> anyhow::Result<()> {
        let mut tx = self.shared.pool.begin().await?;

        let expired = sqlx::query(
            "UPDATE task_run \
             SET success = FALSE, error = 'lease_expired', finished_at = now() \
             WHERE id = $1 AND success IS NULL",
        )
        .bind(orphan.id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !expired {
            // Finalized by its worker between the select and here.
            return Ok(());
        }

        metrics::counter!("orchestrator_runs_total", "status" => "failure").increment(1);

        if orphan.attempt <= orphan.max_retries {
            let delay = retry_delay(
                orphan.backoff_strategy,
                orphan.attempt,
                self.shared.config.backoff_base,
            );
            let run_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

            // Prefer the queue row the dead worker still holds; fall back to
            // any claimable row for the task, and insert if none survives.
            let rearmed = sqlx::query(
                r#"
                UPDATE due_work
                   SET run_at = $3, attempt = $4, locked_until = NULL, locked_by = NULL
                 WHERE id = (
                    SELECT id FROM due_work
                     WHERE task_id = $1
                       AND (locked_by = $2 OR locked_until IS NULL OR locked_until < now())
                     ORDER BY (locked_by = $2) DESC NULLS LAST, id ASC
                     LIMIT 1
                 )
                "#,
            )
            .bind(orphan.task_id)
            .bind(&orphan.lease_owner)
            .bind(run_at)
            .bind(orphan.attempt)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0;

            if !rearmed {
                sqlx::query(
                    "INSERT INTO due_work (task_id, run_at, attempt) VALUES ($1, $2, $3)",
                )
                .bind(orphan.task_id)
                .bind(run_at)
                .bind(orphan.attempt)
                .execute(&mut *tx)
                .await?;
            }

            tracing::info!(
                run_id = %orphan.id,
                task_id = %orphan.task_id,
                attempt = orphan.attempt,
                "orphaned run expired and re-enqueued"
            );
        } else {
            // Attempt budget exhausted: consume whatever queue row is left.
            sqlx::query(
                r#"
                DELETE FROM due_work
                 WHERE id = (
                    SELECT id FROM due_work
                     WHERE task_id = $1
                       AND (locked_by = $2 OR locked_until IS NULL OR locked_until < now())
                     ORDER BY (locked_by = $2) DESC NULLS LAST, id ASC
                     LIMIT 1
                 )
                "#,
            )
            .bind(orphan.task_id)
            .bind(&orphan.lease_owner)
            .execute(&mut *tx)
            .await?;

            audit_in(
                &mut *tx,
                ACTOR,
                "terminal_lease_loss",
                Some(orphan.task_id),
                serde_json::json!({ "run_id": orphan.id, "attempt": orphan.attempt }),
            )
            .await?;

            tracing::warn!(
                run_id = %orphan.id,
                task_id = %orphan.task_id,
                attempt = orphan.attempt,
                "orphaned run expired with no attempt budget left"
            );
        }

        tx.commit().await?;
        Ok(())
    }
}
