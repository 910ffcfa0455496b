use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use pageforge::config::EngineConfig;
use pageforge::engine::Scheduler;
use pageforge::jobs::{JobStore, VersionStore};
use pageforge::pipeline::standard_handlers;
use pageforge::providers::{
    CachedKeywords, HttpEmbeddings, TwinwordKeywords, create_completion_provider,
};
use pageforge::registry::TaskRegistry;
use pageforge::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; optionally tee into a rolling daily log file.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _file_guard = match std::env::var("PAGEFORGE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pageforge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
            None
        }
    };

    let config = EngineConfig::from_env().context("loading configuration")?;

    eprintln!("PageForge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.providers.model);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .context("opening database")?,
    );

    // ── Collaborators ────────────────────────────────────────────────
    let completion =
        create_completion_provider(&config.providers).context("creating completion provider")?;
    let keywords = Arc::new(CachedKeywords::new(
        Arc::new(TwinwordKeywords::new(config.providers.rapidapi_key.clone())),
        Arc::clone(&db),
    ));
    let embeddings = Arc::new(HttpEmbeddings::new(
        &config.providers.embedding_url,
        &config.providers.embedding_model,
        config.providers.embedding_api_key.clone(),
    ));

    // ── Engine wiring ────────────────────────────────────────────────
    let registry = Arc::new(TaskRegistry::standard());
    let jobs = JobStore::new(Arc::clone(&db), Arc::clone(&registry));
    let versions = VersionStore::new(Arc::clone(&db));
    let handlers = Arc::new(standard_handlers(
        completion,
        keywords,
        embeddings,
        config.providers.max_tokens,
    ));

    // Optional one-shot submission from a JSON file.
    if let Ok(path) = std::env::var("PAGEFORGE_SUBMIT") {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading submission file {path}"))?;
        let payload = serde_json::from_str(&raw)
            .with_context(|| format!("parsing submission file {path}"))?;
        let job_id = jobs
            .create_job(payload)
            .await
            .context("creating job from submission file")?;
        eprintln!("   Submitted job {job_id}");
    }

    let scheduler = Scheduler::new(
        jobs,
        versions,
        registry,
        handlers,
        config.scheduler.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    eprintln!("Shutting down...");
    let _ = shutdown_tx.send(true);
    loop_handle.await.context("joining scheduler loop")?;

    Ok(())
}
