/// Daemon setup and initialization
///
/// Wires together storage, registry, execution engine and scheduler, then
/// keeps the scheduler running until Ctrl-C.
use crate::{
    config::Config,
    runtime::{engine::ExecutionEngine, executor::NodeExecutor, scheduler::RecurringScheduler},
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage},
};
use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Fully wired components of a running instance
pub struct Services {
    pub storage: WorkflowStorage,
    pub registry: Arc<WorkflowRegistry>,
    pub engine: Arc<ExecutionEngine>,
    pub scheduler: Arc<RecurringScheduler>,
}

/// Build every component from `storage` without starting the scheduler
pub async fn build_services(config: &Config, storage: WorkflowStorage) -> Result<Services> {
    tracing::info!("📊 Initializing workflow registry");
    let registry = Arc::new(WorkflowRegistry::new());

    tracing::info!("📥 Loading active workflows from storage");
    registry
        .load_from_storage(&storage)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

    tracing::info!("⚙️ Initializing node executor");
    let executor = NodeExecutor::new(&config.engine)
        .map_err(|e| anyhow::anyhow!("Failed to initialize node executor: {}", e))?;

    tracing::info!("🚀 Initializing execution engine");
    let engine = Arc::new(ExecutionEngine::new(Arc::new(executor)));

    tracing::info!("⏰ Initializing recurring trigger scheduler");
    let scheduler = Arc::new(RecurringScheduler::new(
        Arc::clone(&registry),
        Arc::clone(&engine),
        Arc::new(storage.clone()),
    ));

    Ok(Services {
        storage,
        registry,
        engine,
        scheduler,
    })
}

/// Open the on-disk database under the configured data directory
pub async fn open_storage(config: &Config) -> Result<WorkflowStorage> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;

    let path = config.database.database_path();
    tracing::info!("📋 Opening workflow storage at {}", path.display());
    WorkflowStorage::open(&path).await
}

/// Run until Ctrl-C, then shut the scheduler down
pub async fn run_daemon(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log.filter))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting relayflow daemon...");

    let storage = open_storage(&config).await?;
    let services = build_services(&config, storage).await?;
    tracing::info!("✅ Loaded {} active workflow(s)", services.registry.len());

    if config.scheduler.enabled {
        services.scheduler.start().await?;
    } else {
        tracing::info!("⏸️ Scheduler disabled by configuration");
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for shutdown signal: {}", e))?;

    tracing::info!("🛑 Shutdown signal received");
    services.scheduler.shutdown().await?;
    services.storage.close().await;

    tracing::info!("👋 Relayflow stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn services_pick_up_stored_active_workflows() {
        let storage = WorkflowStorage::in_memory().await.unwrap();
        let workflow = serde_json::from_value(json!({
            "id": "nightly",
            "name": "Nightly",
            "nodes": [{ "name": "Tick", "type": "timer", "parameters": { "cron": "0 3 * * *" } }]
        }))
        .unwrap();
        storage.save_workflow(&workflow).await.unwrap();

        let services = build_services(&Config::default(), storage).await.unwrap();
        assert_eq!(services.registry.len(), 1);

        services.scheduler.start().await.unwrap();
        assert_eq!(services.scheduler.status().await.workflow_ids, vec!["nightly".to_string()]);
        services.scheduler.shutdown().await.unwrap();
    }
}
