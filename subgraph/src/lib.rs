pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod indexer;
pub mod models;
pub mod parser;
pub mod projector;
pub mod query;
pub mod repository;
pub mod resolver;
pub mod store;

pub use cache::{CacheBackend, CacheService};
pub use config::*;
pub use error::{IndexerError, IndexerResult};
pub use events::{EventMeta, IndexedEvent, StakingEvent, StreamPosition};
pub use indexer::{ChainClient, EthersChain, IndexerService};
pub use models::{
    Checkpoint, ContractState, DailyAggregate, EntityUpdate, EventRecord, GlobalAggregate, Page,
    RecordKind, RecordQuery, UserState,
};
pub use parser::EventParser;
pub use projector::{Outcome, Projector, RunSummary};
pub use query::QueryService;
pub use repository::PgEntityStore;
pub use store::{EntityStore, Lookup, MemoryStore, ProjectionBatch};

pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Health check for all services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheck {
    pub database: bool,
    pub cache: bool,
    pub blockchain: bool,
}

impl HealthCheck {
    /// Probe the store, cache and chain the indexer depends on
    pub async fn probe<C: ChainClient + ?Sized>(
        store: &PgEntityStore,
        cache: &CacheService,
        chain: &C,
    ) -> Self {
        Self {
            database: store.health_check().await,
            cache: cache.health_check().await,
            blockchain: chain.current_block().await.is_ok(),
        }
    }

    /// Check if all services are healthy
    pub fn is_healthy(&self) -> bool {
        self.database && self.cache && self.blockchain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_requires_every_service() {
        let healthy = HealthCheck {
            database: true,
            cache: true,
            blockchain: true,
        };
        assert!(healthy.is_healthy());

        let degraded = HealthCheck {
            cache: false,
            ..healthy
        };
        assert!(!degraded.is_healthy());
    }
}
