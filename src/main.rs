//! Windlass daemon entry point.
//!
//! Wires the invocation controller over the in-memory adapters. Real
//! deployments replace those with engine-backed caches and the function
//! runtime; the control loop is identical.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::Registry;

use windlass::adapters::{
    DependencyScheduler, InMemoryExpressionStore, InMemoryInvocationStore, InMemoryTaskExecutor,
    InMemoryWorkflowCache, LoopbackTaskApi,
};
use windlass::infrastructure::{ConfigLoader, ControllerMetrics, Logger};
use windlass::{ControllerDeps, InvocationController};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::load().context("Failed to load configuration")?;
    let _logger = Logger::init(&config.logging).context("Failed to initialize logging")?;

    let registry = Registry::new();
    let metrics = Arc::new(
        ControllerMetrics::new(&registry).context("Failed to register controller metrics")?,
    );

    let invocation_store = Arc::new(InMemoryInvocationStore::new());
    let workflow_cache = Arc::new(InMemoryWorkflowCache::new());
    let expressions = Arc::new(InMemoryExpressionStore::new());
    let executor = Arc::new(InMemoryTaskExecutor::new());
    let task_api = Arc::new(LoopbackTaskApi::new(
        invocation_store.clone(),
        Duration::from_millis(50),
    ));

    let deps = ControllerDeps {
        invocations: invocation_store.clone(),
        workflows: workflow_cache,
        expressions,
        scheduler: Arc::new(DependencyScheduler),
        executor,
        invocation_api: invocation_store,
        task_api,
    };

    let controller = Arc::new(InvocationController::new(
        config.controller.clone(),
        deps,
        metrics,
    ));
    controller.clone().init().await;
    tracing::info!("windlass controller running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    controller.close().await;

    Ok(())
}
