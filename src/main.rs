use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use reply_worker::config::WorkerConfig;
use reply_worker::extensions::ExtensionRegistry;
use reply_worker::llm::{LlmConfig, LlmProvider, create_provider};
use reply_worker::store::{Database, InMemoryStore, LibSqlBackend};
use reply_worker::tools::ToolRegistry;
use reply_worker::tools::builtin::register_builtins;
use reply_worker::worker::{ActivityFeed, Orchestrator, OrchestratorDeps, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the file writer's guard alive until exit.
    let _log_guard = init_tracing();

    let in_memory = std::env::args().skip(1).any(|arg| arg == "--in-memory");

    let config = Arc::new(WorkerConfig::from_env().context("invalid worker configuration")?);
    let llm_config = LlmConfig::from_env(config.model.primary.clone())
        .context("invalid LLM configuration")?;
    let llm = create_provider(&llm_config);

    eprintln!("reply-worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Processor: {}", config.processor_id);
    eprintln!("   Model: {}", config.model.primary);
    if !config.model.fallbacks.is_empty() {
        eprintln!("   Fallbacks: {}", config.model.fallbacks.join(", "));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    if in_memory {
        eprintln!("   Database: in-memory");
        serve(Arc::new(InMemoryStore::new()), llm, config, shutdown_rx).await
    } else {
        eprintln!("   Database: {}", config.database_path);
        let db = LibSqlBackend::new_local(Path::new(&config.database_path))
            .await
            .with_context(|| format!("failed to open database at {}", config.database_path))?;
        serve(Arc::new(db), llm, config, shutdown_rx).await
    }
}

async fn serve<D>(
    db: Arc<D>,
    llm: Arc<dyn LlmProvider>,
    config: Arc<WorkerConfig>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    D: Database + 'static,
{
    db.run_migrations().await.context("migrations failed")?;

    let tools = Arc::new(ToolRegistry::new());
    register_builtins(&tools, db.clone(), config.max_delegation_depth)
        .await
        .context("failed to register built-in tools")?;
    tracing::info!(tools = tools.count().await, "Tool registry ready");

    let deps = OrchestratorDeps::from_database(
        db.clone(),
        llm,
        tools,
        Arc::new(ExtensionRegistry::new()),
        ActivityFeed::new(),
        Arc::clone(&config),
    );
    let worker = Worker::new(Orchestrator::new(deps), db, config);
    worker.run(shutdown).await;
    Ok(())
}

/// Stderr logging filtered by `RUST_LOG`, plus daily files under `WORKER_LOG_DIR`.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match std::env::var("WORKER_LOG_DIR").ok().filter(|d| !d.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "reply-worker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
