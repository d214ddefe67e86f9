//! Row types for the durable store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Mirror of [`ordinaut_schedule::ScheduleKind`] as a Postgres enum.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "schedule_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Rrule,
    Once,
    Event,
    Condition,
}

impl From<ScheduleKind> for ordinaut_schedule::ScheduleKind {
    fn from(kind: ScheduleKind) -> Self {
        match kind {
            ScheduleKind::Cron => Self::Cron,
            ScheduleKind::Rrule => Self::Rrule,
            ScheduleKind::Once => Self::Once,
            ScheduleKind::Event => Self::Event,
            ScheduleKind::Condition => Self::Condition,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Canceled,
}

/// Retry backoff strategy identifiers.
///
/// The set is closed: unknown identifiers are a configuration error at task
/// create, both here and at the store level (`backoff_kind` is a Postgres
/// enum).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "backoff_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    ExponentialJitter,
    Fixed,
    Linear,
}

impl std::str::FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential_jitter" => Ok(BackoffKind::ExponentialJitter),
            "fixed" => Ok(BackoffKind::Fixed),
            "linear" => Ok(BackoffKind::Linear),
            other => Err(format!("unknown backoff strategy {other:?}")),
        }
    }
}

/// Identity and permission holder for API callers.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub scopes: Vec<String>,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The scheduled unit of work.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub created_by: Uuid,
    pub schedule_kind: ScheduleKind,
    pub schedule_expr: String,
    pub timezone: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub dedupe_key: Option<String>,
    pub dedupe_window_seconds: Option<i32>,
    pub max_retries: i32,
    pub backoff_strategy: BackoffKind,
    pub concurrency_key: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// The advisory-lock key gating this task, if any. Empty strings count
    /// as unset.
    pub fn concurrency_key(&self) -> Option<&str> {
        self.concurrency_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// One execution attempt of a task firing.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub lease_owner: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub attempt: i32,
    pub output: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// A materialized firing, ready for a worker to claim.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DueWork {
    pub id: i64,
    pub task_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
}

/// Self-reported worker liveness.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_seen: DateTime<Utc>,
    pub processed: i64,
    pub pid: i32,
    pub hostname: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_strategy_set_is_closed() {
        assert_eq!("exponential_jitter".parse(), Ok(BackoffKind::ExponentialJitter));
        assert_eq!("fixed".parse(), Ok(BackoffKind::Fixed));
        assert_eq!("linear".parse(), Ok(BackoffKind::Linear));
        assert!("exponential".parse::<BackoffKind>().is_err());
        assert!("".parse::<BackoffKind>().is_err());
    }

    #[test]
    fn empty_concurrency_key_counts_as_unset() {
        let mut task = sample_task();
        assert_eq!(task.concurrency_key(), None);

        task.concurrency_key = Some(String::new());
        assert_eq!(task.concurrency_key(), None);

        task.concurrency_key = Some("reports".into());
        assert_eq!(task.concurrency_key(), Some("reports"));
    }

    fn sample_task() -> Task {
        Task {
            id: Uuid::new_v4(),
            title: "t".into(),
            description: String::new(),
            created_by: Uuid::new_v4(),
            schedule_kind: ScheduleKind::Once,
            schedule_expr: "2030-01-01T00:00:00Z".into(),
            timezone: "UTC".into(),
            payload: serde_json::json!({"pipeline": []}),
            status: TaskStatus::Active,
            priority: 5,
            dedupe_key: None,
            dedupe_window_seconds: None,
            max_retries: 0,
            backoff_strategy: BackoffKind::ExponentialJitter,
            concurrency_key: None,
            next_run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
