pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod harness;
pub mod language;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod sandbox;
pub mod scheduler;
pub mod worker;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    api::routes,
    catalog::{InMemoryCatalog, ProblemCatalog},
    config::EngineConfig,
    metrics::MetricsRegistry,
    pipeline::Pipeline,
    sandbox::{ProcessSandbox, SandboxBackend},
    scheduler::Scheduler,
    worker::spawn_worker_pool,
};

pub async fn run() -> anyhow::Result<()> {
    let config = Arc::new(EngineConfig::from_env().context("invalid engine configuration")?);
    init_tracing(&config);

    let catalog = match &config.problems_path {
        Some(path) => InMemoryCatalog::load(path).await?,
        None => InMemoryCatalog::seeded(),
    };
    tracing::info!(problems = catalog.len(), "problem catalog loaded");
    let catalog: Arc<dyn ProblemCatalog> = Arc::new(catalog);
    let metrics = Arc::new(MetricsRegistry::new());
    let scheduler = Scheduler::new(config.worker_count, config.queue_depth, metrics.clone());
    let process_sandbox =
        ProcessSandbox::new(config.sandbox.clone()).context("sandbox backend init failed")?;
    let isolation = process_sandbox
        .self_check()
        .await
        .context("sandbox isolation check failed")?;
    tracing::info!(
        contained = isolation.contained,
        filesystem_confined = isolation.filesystem_confined,
        dedicated_identity = isolation.dedicated_identity,
        "sandbox isolation checked"
    );
    let sandbox: Arc<dyn SandboxBackend> = Arc::new(process_sandbox);
    let pipeline = Arc::new(Pipeline::new(sandbox, config.clone()));

    spawn_worker_pool(
        config.worker_count,
        scheduler.receiver(),
        pipeline,
        metrics.clone(),
        config.internal_retries,
    );

    let app: Router = routes(config.clone(), scheduler, catalog, metrics);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(
        bind = %local,
        workers = config.worker_count,
        queue_depth = config.queue_depth,
        sandbox_uid = ?config.sandbox.run_as,
        comparator = %config.harness.comparator,
        "code execution judge ready"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("judge server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
