//! Component health, as consumed by the external REST layer.
//!
//! The runtime does not serve HTTP itself; it exposes the structured
//! statuses the API collaborator renders on `/health`, `/health/ready`, and
//! `/health/live`.

use std::time::Duration;

use serde::Serialize;

use crate::SharedState;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
    Unconfigured,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    fn ok(name: &'static str) -> Self {
        Self { name, status: HealthStatus::Ok, message: None }
    }

    fn with(name: &'static str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self { name, status, message: Some(message.into()) }
    }
}

/// Check every component. Always returns all four entries, in a stable
/// order: `database`, `redis`, `scheduler`, `workers`.
pub async fn check(shared: &SharedState) -> Vec<ComponentHealth> {
    vec![
        database_health(shared).await,
        ComponentHealth::with(
            "redis",
            HealthStatus::Unconfigured,
            "external event bus not attached",
        ),
        scheduler_health(shared).await,
        workers_health(shared).await,
    ]
}

/// Readiness: the store answers and at least one worker heartbeat landed
/// within three heartbeat intervals.
pub async fn ready(shared: &SharedState) -> bool {
    let db_ok = database_health(shared).await.status != HealthStatus::Down;
    db_ok && workers_health(shared).await.status == HealthStatus::Ok
}

/// Liveness: answering at all is the check.
pub fn live() -> bool {
    true
}

async fn database_health(shared: &SharedState) -> ComponentHealth {
    let probe = tokio::time::timeout(
        Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(&shared.pool),
    )
    .await;

    match probe {
        Ok(Ok(_)) => {
            let failures = shared.consecutive_store_failures();
            if failures >= 3 {
                ComponentHealth::with(
                    "database",
                    HealthStatus::Degraded,
                    format!("{failures} consecutive store errors"),
                )
            } else {
                ComponentHealth::ok("database")
            }
        }
        Ok(Err(e)) => ComponentHealth::with("database", HealthStatus::Down, e.to_string()),
        Err(_) => ComponentHealth::with("database", HealthStatus::Down, "probe timed out (>5s)"),
    }
}

async fn scheduler_health(shared: &SharedState) -> ComponentHealth {
    let freshness = shared.config.scheduler_interval * 3;
    match shared.store().heartbeat_for("scheduler").await {
        Ok(Some(hb)) => {
            let age = chrono::Utc::now() - hb.last_seen;
            if age.to_std().unwrap_or_default() <= freshness {
                ComponentHealth::ok("scheduler")
            } else {
                ComponentHealth::with(
                    "scheduler",
                    HealthStatus::Down,
                    format!("last heartbeat {}s ago", age.num_seconds()),
                )
            }
        }
        Ok(None) => {
            ComponentHealth::with("scheduler", HealthStatus::Down, "no scheduler heartbeat")
        }
        Err(e) => ComponentHealth::with("scheduler", HealthStatus::Degraded, e.to_string()),
    }
}

async fn workers_health(shared: &SharedState) -> ComponentHealth {
    let freshness = shared.config.heartbeat_interval * 3;
    match shared.store().latest_worker_heartbeat().await {
        Ok(Some(hb)) => {
            let age = chrono::Utc::now() - hb.last_seen;
            if age.to_std().unwrap_or_default() <= freshness {
                ComponentHealth::ok("workers")
            } else {
                ComponentHealth::with(
                    "workers",
                    HealthStatus::Down,
                    format!("newest worker heartbeat is {}s old", age.num_seconds()),
                )
            }
        }
        Ok(None) => ComponentHealth::with("workers", HealthStatus::Down, "no live workers"),
        Err(e) => ComponentHealth::with("workers", HealthStatus::Degraded, e.to_string()),
    }
}
