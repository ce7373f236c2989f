use anyhow::{Context, Result};
use insight_core::agent::Orchestrator;
use insight_core::api::{self, AppState};
use insight_core::builtin_tools::{default_registry, ToolDeps};
use insight_core::chat::ChatService;
use insight_core::config::Config;
use insight_core::llm::AnthropicClient;
use insight_core::scheduler::{SchedulerHandle, TaskScheduler};
use insight_core::scheduler_tools::TaskService;
use insight_core::storage::{run_migrations, PgStore, Store};
use insight_core::tools::RegistryFactory;
use insight_tools::ProjectFiles;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "insight=debug,insight_core=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Insight starting up...");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Model: {}", config.model);
    info!("  Scheduler timezone: {}", config.scheduler_timezone);
    info!("  Projects dir: {}", config.projects_dir.display());

    // Run database migrations first
    run_migrations(&config.database_url)?;
    info!("Database migrations applied");

    let store: Arc<dyn Store> =
        Arc::new(PgStore::connect(&config.database_url).context("Failed to open store")?);

    let llm = Arc::new(AnthropicClient::new(
        config.anthropic_api_key.clone(),
        config.anthropic_api_url.clone(),
        config.llm_timeout,
    )?);
    let orchestrator = Arc::new(Orchestrator::new(llm, store.clone(), config.agent_config()));

    // Tools reach the scheduler through the handle only
    let (handle, commands) = SchedulerHandle::channel();
    let tasks = TaskService::new(store.clone(), handle, config.scheduler_timezone);
    let deps = ToolDeps {
        store: store.clone(),
        projects: ProjectFiles::new(config.projects_dir.clone()),
        tasks: tasks.clone(),
    };
    let registry_factory: RegistryFactory = Arc::new(move || default_registry(&deps));

    let scheduler = TaskScheduler::new(
        store.clone(),
        orchestrator.clone(),
        registry_factory.clone(),
        config.scheduler_config(),
    );
    let listener_handle = scheduler.listen(commands);
    let armed = scheduler.start()?;
    info!("Task scheduler running with {} armed tasks", armed);

    let state = AppState {
        chat: ChatService::new(store.clone(), orchestrator, registry_factory),
        tasks,
    };
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    info!("HTTP API listening on port {}", config.http_port);

    if let Err(e) = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("HTTP server error: {}", e);
    }

    info!("Shutting down...");
    scheduler.stop().await;
    if let Err(e) = listener_handle.await {
        error!("Scheduler command loop failed: {}", e);
    }
    info!("Insight stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
