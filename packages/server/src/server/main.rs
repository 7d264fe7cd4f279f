// Main entry point for the ticket bridge server.

use std::sync::Arc;

use anyhow::{Context, Result};
use server_core::domains::sync::conflict::{ConflictPolicy, ConflictResolver};
use server_core::domains::sync::engine::{spawn_stream_consumer, SyncConfig, SyncEngine};
use server_core::domains::sync::jobs::register_jobs;
use server_core::domains::sync::source::ServiceNowSource;
use server_core::domains::sync::store::PostgresTicketStore;
use server_core::kernel::changelog::PostgresChangeLog;
use server_core::kernel::fanout::spawn_metrics_publisher;
use server_core::kernel::jobs::{
    CancelRegistry, JobQueue, JobRegistry, PostgresJobQueue, QueueEvents, WorkerPool,
    WorkerPoolConfig,
};
use server_core::kernel::pipeline::MetricsRecorder;
use server_core::kernel::scheduler::{PostgresScheduleStore, Scheduler};
use server_core::kernel::stream_hub::StreamHub;
use server_core::kernel::ServerDeps;
use server_core::server::build_app;
use server_core::Config;
use servicenow::{ServiceNowOptions, ServiceNowService};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting ticket bridge");

    let config = Config::from_env().context("failed to load configuration")?;

    tracing::info!("connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("running migrations");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    // Component wiring, leaves first.
    let queue_events = QueueEvents::default();
    let job_queue: Arc<dyn JobQueue> =
        Arc::new(PostgresJobQueue::with_events(pool.clone(), queue_events.clone()));
    let change_log = Arc::new(PostgresChangeLog::new(pool.clone()));
    let ticket_store = Arc::new(PostgresTicketStore::new(pool.clone()));

    let servicenow = ServiceNowService::new(ServiceNowOptions {
        instance_url: config.servicenow_instance_url.clone(),
        username: config.servicenow_username.clone(),
        password: config.servicenow_password.clone(),
    });
    let ticket_source = Arc::new(ServiceNowSource::new(servicenow));

    let sync_config = SyncConfig {
        batch_size: config.sync_batch_size,
        ..Default::default()
    };
    let sync = Arc::new(SyncEngine::new(
        ticket_source.clone(),
        ticket_store.clone(),
        change_log.clone(),
        ConflictResolver::new(ConflictPolicy::NewestWins),
        sync_config,
    ));

    let schedule_store = Arc::new(PostgresScheduleStore::new(pool.clone()));
    let scheduler = Arc::new(Scheduler::new(schedule_store, job_queue.clone()));

    let cancellations = Arc::new(CancelRegistry::new());
    let deps = Arc::new(ServerDeps::new(
        job_queue.clone(),
        queue_events,
        change_log.clone(),
        ticket_store,
        ticket_source,
        sync.clone(),
        scheduler.clone(),
        cancellations.clone(),
        StreamHub::new(),
        Arc::new(MetricsRecorder::new()),
    ));

    let mut registry = JobRegistry::new();
    register_jobs(&mut registry);
    let registry = Arc::new(registry);

    // Background services, all bound to one shutdown token.
    let shutdown = CancellationToken::new();

    let worker_config = WorkerPoolConfig {
        worker_count: config.worker_count,
        ..Default::default()
    };
    let workers = Arc::new(WorkerPool::with_config(
        job_queue,
        registry,
        deps.clone(),
        cancellations,
        worker_config,
    ));
    tokio::spawn(workers.run(shutdown.clone()));
    tokio::spawn(scheduler.run(shutdown.clone()));
    spawn_stream_consumer(sync, change_log, shutdown.clone());
    spawn_metrics_publisher(deps.clone(), std::time::Duration::from_secs(5), shutdown.clone());

    // HTTP surface.
    let app = build_app(deps, &config.cors_allowed_origins);
    let addr = format!("{}:{}", config.http_host, config.http_port);
    tracing::info!(addr = %addr, "serving HTTP");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown_for_server = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown_for_server.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    tracing::info!("ticket bridge stopped");
    Ok(())
}
