use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use staking_subgraph::{
    init_tracing, CacheService, Config, EthersChain, HealthCheck, IndexedEvent, IndexerService,
    PgEntityStore, Projector,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Projects staking contract events into queryable entities
#[derive(Parser, Debug)]
#[clap(name = "staking-subgraph", version)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Follow the chain and project new events (default)
    Run,

    /// Project a file of JSON-encoded events, one per line
    Replay {
        /// Path to the events file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::from_env().context("error with configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PgEntityStore::new(pool));
    store.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Database ready");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, store).await,
        Command::Replay { path } => replay(store, &path).await,
    }
}

/// Follow the chain until stopped or a non-transient error
async fn run(config: Config, store: Arc<PgEntityStore>) -> anyhow::Result<()> {
    let cache = Arc::new(
        CacheService::new(&config.cache.url)
            .await
            .context("Failed to connect to cache")?,
    );
    let chain = Arc::new(
        EthersChain::connect(&config.blockchain.ws_url)
            .await
            .context("Failed to connect to blockchain")?,
    );

    let health = HealthCheck::probe(&store, &cache, chain.as_ref()).await;
    if !health.is_healthy() {
        tracing::warn!("Starting with degraded services: {:?}", health);
    }

    let indexer = Arc::new(
        IndexerService::new(config, chain, store, cache)
            .await
            .context("Failed to initialize indexer")?,
    );

    let stopper = indexer.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            stopper.stop().await;
        }
    });

    indexer.start().await.context("Indexer stopped with error")?;
    Ok(())
}

/// Project a file of JSON-encoded events, one per line, into the store
async fn replay(store: Arc<PgEntityStore>, path: &Path) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let events = futures::stream::iter(
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<IndexedEvent>(line).map_err(Into::into)),
    );

    let mut projector = Projector::new(store);
    let summary = projector.run(events).await.context("Replay failed")?;

    tracing::info!(
        "Replayed {} events ({} duplicates skipped), last position {:?}",
        summary.applied,
        summary.duplicates,
        summary.last_position
    );
    Ok(())
}
