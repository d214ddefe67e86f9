use std::time::Duration;

/// Placeholder secrets that ship in deployment templates. Startup fails when
/// `JWT_SECRET_KEY` matches one of these.
const KNOWN_DEFAULT_SECRETS: &[&str] = &[
    "",
    "secret",
    "changeme",
    "change-me",
    "default",
    "dev-secret",
    "jwt-secret",
];

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of concurrent execution slots per worker process.
    pub worker_concurrency: usize,

    /// How often the scheduler re-reads task state from the store, on top of
    /// the LISTEN/NOTIFY channel. This is the fallback that catches missed
    /// notifications.
    pub scheduler_interval: Duration,

    /// The lease horizon for claimed queue rows and in-flight runs. A run
    /// that outlives its lease is converted to a failed run by the reaper.
    pub lease_duration: Duration,

    /// The period with which each worker updates its heartbeat row.
    ///
    /// Actual updates are jittered downwards by up to 1/4 of the period to
    /// avoid thundering herds on the store. A worker that misses three
    /// consecutive periods is considered dead.
    pub heartbeat_interval: Duration,

    /// How often the lease reaper sweeps for orphaned leases and stale
    /// heartbeats.
    pub reaper_interval: Duration,

    /// Base delay for the retry backoff strategies.
    pub backoff_base: Duration,

    /// Default timeout for a single tool invocation, used when the step does
    /// not configure its own.
    pub step_timeout: Duration,

    /// Whether this process runs the scheduler loop. The scheduler is
    /// single-writer across the cluster; exactly one process must have this
    /// set.
    pub run_scheduler: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_concurrency: 10,
            scheduler_interval: Duration::from_secs(5),
            lease_duration: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(2),
            step_timeout: Duration::from_secs(30),
            run_scheduler: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("JWT_SECRET_KEY is unset or still a known default value")]
    DefaultJwtSecret,

    #[error("{name} must be greater than zero")]
    ZeroInterval { name: &'static str },
}

#[derive(Debug, clap::Parser)]
#[command(name = "ordinaut", about = "Durable task orchestrator runtime")]
pub struct Args {
    /// Connection string for the durable store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Credential signing secret used by the API layer. The runtime never
    /// reads it, but refuses to start a cluster around a known default.
    #[arg(long, env = "JWT_SECRET_KEY", hide_env_values = true)]
    pub jwt_secret_key: String,

    /// Execution slots per worker process.
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 10)]
    pub worker_concurrency: usize,

    /// Seconds between scheduler reload sweeps.
    #[arg(long, env = "SCHEDULER_INTERVAL", default_value_t = 5)]
    pub scheduler_interval: u64,

    /// Lease horizon, in seconds, for claimed work and in-flight runs.
    #[arg(long, env = "LEASE_DURATION_SECONDS", default_value_t = 300)]
    pub lease_duration_seconds: u64,

    /// Worker heartbeat cadence in seconds.
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECONDS", default_value_t = 10)]
    pub heartbeat_interval_seconds: u64,

    /// Reaper sweep cadence in seconds.
    #[arg(long, env = "REAPER_INTERVAL_SECONDS", default_value_t = 30)]
    pub reaper_interval_seconds: u64,

    /// Structured log level filter, e.g. `info` or `ordinaut_runtime=debug`.
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Disable the scheduler loop in this process. Use on all but one
    /// process when running multiple worker replicas.
    #[arg(long)]
    pub no_scheduler: bool,
}

impl Args {
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        let secret = self.jwt_secret_key.trim().to_ascii_lowercase();
        if KNOWN_DEFAULT_SECRETS.contains(&secret.as_str()) {
            return Err(ConfigError::DefaultJwtSecret);
        }

        for (name, value) in [
            ("SCHEDULER_INTERVAL", self.scheduler_interval),
            ("LEASE_DURATION_SECONDS", self.lease_duration_seconds),
            ("HEARTBEAT_INTERVAL_SECONDS", self.heartbeat_interval_seconds),
            ("REAPER_INTERVAL_SECONDS", self.reaper_interval_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval { name });
            }
        }

        Ok(Config {
            worker_concurrency: self.worker_concurrency.max(1),
            scheduler_interval: Duration::from_secs(self.scheduler_interval),
            lease_duration: Duration::from_secs(self.lease_duration_seconds),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            reaper_interval: Duration::from_secs(self.reaper_interval_seconds),
            run_scheduler: !self.no_scheduler,
            ..Config::default()
        })
    }
}
