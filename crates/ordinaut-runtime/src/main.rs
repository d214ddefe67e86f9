use std::sync::Arc;

use clap::Parser;
use futures_concurrency::future::Join;
use ordinaut_runtime::tool::HttpToolTransport;
use ordinaut_runtime::{store, Args, Reaper, Scheduler, SharedState, Worker};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: i32 = 1;
const EXIT_STORE_UNREACHABLE: i32 = 2;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = match args.log_level.as_deref() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Concurrency gates pin a connection for the length of a run, so the
    // pool must outsize the slot count.
    let pool = match sqlx::postgres::PgPoolOptions::new()
        .max_connections((config.worker_concurrency as u32) * 2 + 8)
        .connect(&args.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("store unreachable: {e}");
            std::process::exit(EXIT_STORE_UNREACHABLE);
        }
    };

    if let Err(e) = store::migrate(&pool).await {
        tracing::error!("failed to migrate the store: {e}");
        std::process::exit(EXIT_STORE_UNREACHABLE);
    }

    let shared = SharedState::new(pool, config, Arc::new(HttpToolTransport::new()));

    let shutdown = shared.shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("got ctrl-c, shutting down");
        shutdown.cancel();
    });

    tracing::info!(
        concurrency = shared.config.worker_concurrency,
        scheduler = shared.config.run_scheduler,
        "ordinaut starting up"
    );

    let worker = Worker::new(shared.clone());
    let reaper = Reaper::new(shared.clone());
    let scheduler = {
        let shared = shared.clone();
        async move {
            if shared.config.run_scheduler {
                Scheduler::new(shared).run().await
            } else {
                shared.shutdown.cancelled().await;
                Ok(())
            }
        }
    };

    // If any component exits, fatally or not, the rest must come down too.
    let (scheduler, worker, reaper) = (
        guarded(&shared, scheduler),
        guarded(&shared, worker.run()),
        guarded(&shared, reaper.run()),
    )
        .join()
        .await;

    let mut failed = false;
    for (name, result) in
        [("scheduler", scheduler), ("worker", worker), ("reaper", reaper)]
    {
        if let Err(e) = result {
            tracing::error!("{name} exited with an error: {e:#}");
            failed = true;
        }
    }

    if failed {
        std::process::exit(EXIT_CONFIG);
    }

    tracing::info!("shutdown complete");
}

async fn guarded(
    shared: &SharedState,
    future: impl std::future::Future<Output = anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let result = future.await;
    shared.shutdown.cancel();
    result
}
