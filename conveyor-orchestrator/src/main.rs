use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_core::DEFAULT_TEAM_NAME;
use conveyor_engine::{ExecEngine, Pool, SystemClock};
use conveyor_store::memory::MemoryStore;
use conveyor_store::postgres::{create_pool, PgStore};
use conveyor_store::prelude::*;

pub mod api;
pub mod baggage;
pub mod builds;
pub mod pipelines;
pub mod scanner;
pub mod scheduler;

use baggage::BaggageCollector;
use builds::tracker::Tracker;
use pipelines::{DefaultRunnerFactory, Syncer};
use scanner::ResourceScanner;
use scheduler::Scheduler;

/// Control plane configuration. Every flag can come from the environment.
#[derive(Debug, Parser)]
#[command(name = "conveyor-orchestrator")]
struct Config {
    /// Address the API listens on.
    #[arg(long, env = "CONVEYOR_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: String,

    /// Postgres connection string; the in-memory store is used when unset.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Base URL used in links returned by the API.
    #[arg(long, env = "CONVEYOR_EXTERNAL_URL", default_value = "http://127.0.0.1:8080")]
    external_url: String,

    /// How often the syncer reconciles pipeline runners.
    #[arg(long, env = "CONVEYOR_SYNC_INTERVAL_SECS", default_value_t = 10)]
    sync_interval_secs: u64,

    /// Default resource check interval, overridable per resource.
    #[arg(long, env = "CONVEYOR_CHECK_INTERVAL_SECS", default_value_t = 60)]
    check_interval_secs: u64,

    /// How often the tracker re-attaches to started builds.
    #[arg(long, env = "CONVEYOR_TRACKER_INTERVAL_SECS", default_value_t = 10)]
    tracker_interval_secs: u64,

    /// TTL applied to cached volumes of superseded resource versions.
    #[arg(long, env = "CONVEYOR_OLD_RESOURCE_GRACE_SECS", default_value_t = 240)]
    old_resource_grace_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor=info,conveyor_orchestrator=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();

    tracing::info!("starting conveyor orchestrator");

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            tracing::info!("connecting to database");
            let pool = create_pool(url).await.expect("failed to create database pool");
            let store = PgStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run database migrations");
            Arc::new(store)
        }
        None => {
            tracing::warn!("no DATABASE_URL configured; using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    store
        .save_team(DEFAULT_TEAM_NAME)
        .await
        .expect("failed to ensure the default team");

    let workers = Arc::new(Pool::new());
    if workers.worker_count() == 0 {
        tracing::warn!("no workers attached; builds will not run until workers register");
    }

    let clock = Arc::new(SystemClock::new());
    let engine = Arc::new(ExecEngine::new(store.clone(), workers.clone(), clock));

    let scanner = ResourceScanner::new(
        store.clone(),
        workers.clone(),
        Duration::from_secs(config.check_interval_secs),
    );
    let scheduler = Scheduler::new(store.clone(), engine.clone(), scanner.clone());

    // pipeline runner reconciliation
    let runner_factory = DefaultRunnerFactory::new(
        scheduler.clone(),
        scanner.clone(),
        store.clone(),
        Duration::from_secs(config.sync_interval_secs),
    );
    let mut syncer = Syncer::new(store.clone(), Box::new(runner_factory));
    let sync_interval = Duration::from_secs(config.sync_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync_interval);
        loop {
            ticker.tick().await;
            syncer.sync().await;
        }
    });

    // build re-attachment after restarts
    let tracker = Tracker::new(store.clone(), engine.clone());
    let tracker_interval = Duration::from_secs(config.tracker_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tracker_interval);
        loop {
            ticker.tick().await;
            tracker.track().await;
        }
    });

    // volume cache expiry
    let collector = BaggageCollector::new(
        store.clone(),
        Duration::from_secs(config.old_resource_grace_secs),
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            if let Err(err) = collector.collect().await {
                tracing::error!(error = %err, "baggage collection failed");
            }
        }
    });

    // expired container reaping
    let reaper_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            match reaper_store.get_expired_containers().await {
                Ok(expired) => {
                    for container in expired {
                        if let Err(err) = reaper_store.reap_container(&container.handle).await {
                            tracing::warn!(handle = %container.handle, error = %err, "failed to reap container");
                        }
                    }
                }
                Err(err) => tracing::error!(error = %err, "failed to list expired containers"),
            }
        }
    });

    let state = api::AppState {
        store,
        engine,
        triggerer: Arc::new(scheduler),
        external_url: config.external_url,
    };
    let app = api::create_router(state);

    tracing::info!(addr = %config.bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind to address");
    axum::serve(listener, app).await.expect("failed to serve");
}
