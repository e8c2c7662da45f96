use crate::cache::{self, CacheBackend};
use crate::config::CacheConfig;
use crate::error::IndexerResult;
use crate::events::normalize_address;
use crate::models::{
    Checkpoint, ContractState, DailyAggregate, EventRecord, GlobalAggregate, Page, RecordKind,
    RecordQuery, UserState,
};
use crate::store::EntityStore;
use std::sync::Arc;
use tracing::{debug, info};

/// Read-only access to projected entities with read-through caching
pub struct QueryService<S: EntityStore + ?Sized, C: CacheBackend + ?Sized> {
    /// Entity store
    store: Arc<S>,

    /// Cache service
    cache: Arc<C>,

    entity_ttl: u64,
    stats_ttl: u64,
    query_ttl: u64,
}

impl<S: EntityStore + ?Sized, C: CacheBackend + ?Sized> QueryService<S, C> {
    /// Create a new query service
    ///
    /// # Arguments
    /// * `store` - Entity store the projector writes to
    /// * `cache` - Cache backend
    /// * `config` - TTLs for cached entries
    pub fn new(store: Arc<S>, cache: Arc<C>, config: &CacheConfig) -> Self {
        Self {
            store,
            cache,
            entity_ttl: config.entity_ttl,
            stats_ttl: config.stats_ttl,
            query_ttl: config.query_ttl,
        }
    }

    /// Get a user's staking position by address
    pub async fn get_user(&self, address: &str) -> IndexerResult<Option<UserState>> {
        let id = normalize_address(address);
        let key = cache::user_key(&id);

        if let Some(user) = cache::get_json(self.cache.as_ref(), &key).await? {
            debug!("Cache hit for user: {}", id);
            return Ok(Some(user));
        }

        debug!("Cache miss for user: {}", id);
        let user = self.store.load_user(&id).await?.into_option();
        if let Some(ref user) = user {
            cache::set_json(self.cache.as_ref(), &key, user, self.entity_ttl).await?;
        }
        Ok(user)
    }

    /// Get protocol-wide contract state
    pub async fn get_contract_state(&self) -> IndexerResult<Option<ContractState>> {
        if let Some(contract) = cache::get_json(self.cache.as_ref(), cache::CONTRACT_KEY).await? {
            return Ok(Some(contract));
        }

        let contract = self.store.load_contract_state().await?.into_option();
        if let Some(ref contract) = contract {
            cache::set_json(self.cache.as_ref(), cache::CONTRACT_KEY, contract, self.stats_ttl)
                .await?;
        }
        Ok(contract)
    }

    /// Get all-time statistics
    ///
    /// Dashboards poll this, so it is cached even when the store has no
    /// events yet (a zeroed aggregate is returned).
    pub async fn get_global_stats(&self) -> IndexerResult<GlobalAggregate> {
        if let Some(stats) = cache::get_json(self.cache.as_ref(), cache::GLOBAL_KEY).await? {
            debug!("Cache hit for global statistics");
            return Ok(stats);
        }

        debug!("Cache miss for global statistics");
        let stats = self
            .store
            .load_global()
            .await?
            .into_option()
            .unwrap_or_else(GlobalAggregate::zeroed);
        cache::set_json(self.cache.as_ref(), cache::GLOBAL_KEY, &stats, self.stats_ttl).await?;
        Ok(stats)
    }

    /// Get the rollup for one `YYYY-MM-DD` day
    pub async fn get_daily_stats(&self, date: &str) -> IndexerResult<Option<DailyAggregate>> {
        let key = cache::daily_key(date);
        if let Some(day) = cache::get_json(self.cache.as_ref(), &key).await? {
            return Ok(Some(day));
        }

        let day = self.store.load_daily(date).await?.into_option();
        if let Some(ref day) = day {
            cache::set_json(self.cache.as_ref(), &key, day, self.stats_ttl).await?;
        }
        Ok(day)
    }

    /// Get daily rollups between two dates, inclusive, oldest first
    pub async fn get_daily_range(&self, from: &str, to: &str) -> IndexerResult<Vec<DailyAggregate>> {
        self.store.daily_range(from, to).await
    }

    /// Query immutable records with caching
    pub async fn query_records(&self, query: RecordQuery) -> IndexerResult<Vec<EventRecord>> {
        let key = cache::query_key(&generate_query_hash(&query));

        if let Some(records) = cache::get_json(self.cache.as_ref(), &key).await? {
            debug!("Cache hit for query: {}", key);
            return Ok(records);
        }

        debug!("Cache miss for query: {}", key);
        let records = self.store.query_records(&query).await?;
        cache::set_json(self.cache.as_ref(), &key, &records, self.query_ttl).await?;
        Ok(records)
    }

    pub async fn get_user_stakes(&self, user: &str, page: Page) -> IndexerResult<Vec<EventRecord>> {
        self.user_records(user, RecordKind::Stake, page).await
    }

    pub async fn get_user_withdrawals(
        &self,
        user: &str,
        page: Page,
    ) -> IndexerResult<Vec<EventRecord>> {
        self.user_records(user, RecordKind::Withdrawal, page).await
    }

    pub async fn get_user_reward_claims(
        &self,
        user: &str,
        page: Page,
    ) -> IndexerResult<Vec<EventRecord>> {
        self.user_records(user, RecordKind::RewardClaim, page).await
    }

    pub async fn get_user_emergency_withdrawals(
        &self,
        user: &str,
        page: Page,
    ) -> IndexerResult<Vec<EventRecord>> {
        self.user_records(user, RecordKind::EmergencyWithdrawal, page)
            .await
    }

    /// History of reward rate changes, newest first
    pub async fn get_reward_rate_updates(&self, page: Page) -> IndexerResult<Vec<EventRecord>> {
        let query = RecordQuery::new()
            .with_kind(RecordKind::RewardRateUpdate)
            .with_page(page);
        self.query_records(query).await
    }

    /// Records produced by one transaction
    ///
    /// One-off lookups, so they bypass the cache.
    pub async fn get_records_by_transaction(&self, tx_hash: &str) -> IndexerResult<Vec<EventRecord>> {
        let query = RecordQuery::new().with_transaction(tx_hash);
        self.store.query_records(&query).await
    }

    /// Position of the last projected event
    pub async fn get_checkpoint(&self) -> IndexerResult<Option<Checkpoint>> {
        if let Some(checkpoint) = cache::get_json(self.cache.as_ref(), cache::CHECKPOINT_KEY).await?
        {
            return Ok(Some(checkpoint));
        }

        let checkpoint = self.store.load_checkpoint().await?;
        if let Some(ref checkpoint) = checkpoint {
            cache::set_json(
                self.cache.as_ref(),
                cache::CHECKPOINT_KEY,
                checkpoint,
                self.stats_ttl,
            )
            .await?;
        }
        Ok(checkpoint)
    }

    /// Prefetch and cache commonly accessed data
    pub async fn warm_cache(&self) -> IndexerResult<()> {
        info!("Warming up cache");

        self.get_global_stats().await?;
        self.get_contract_state().await?;
        let recent = self
            .query_records(RecordQuery::new().with_page(Page::new(100, 0)))
            .await?;
        debug!("Cached {} recent records", recent.len());

        Ok(())
    }

    async fn user_records(
        &self,
        user: &str,
        kind: RecordKind,
        page: Page,
    ) -> IndexerResult<Vec<EventRecord>> {
        let query = RecordQuery::new()
            .with_user(user)
            .with_kind(kind)
            .with_page(page);
        self.query_records(query).await
    }
}

/// Generate a hash for query parameters to use as cache key
fn generate_query_hash(query: &RecordQuery) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::MemoryCache;
    use crate::config::Config;
    use crate::events::StreamPosition;
    use crate::models::StakeRecord;
    use crate::store::{MemoryStore, ProjectionBatch};
    use ethers::types::U256;

    fn checkpoint(block: u64) -> Checkpoint {
        Checkpoint {
            position: StreamPosition {
                block_number: block,
                log_index: 0,
            },
            updated_at: 0,
        }
    }

    fn stake(id: &str, user: &str) -> EventRecord {
        EventRecord::Stake(StakeRecord {
            id: id.to_string(),
            user: user.to_string(),
            amount: U256::from(10),
            timestamp: U256::zero(),
            new_total_staked: U256::from(10),
            current_reward_rate: U256::zero(),
            transaction_hash: "0xaa".to_string(),
            block_number: 1,
        })
    }

    fn service(
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
    ) -> QueryService<MemoryStore, MemoryCache> {
        QueryService::new(store, cache, &Config::default().cache)
    }

    #[tokio::test]
    async fn test_global_stats_cached_after_first_read() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::default());
        let queries = service(store.clone(), cache.clone());

        let stats = queries.get_global_stats().await.unwrap();
        assert_eq!(stats.total_stakes, U256::zero());
        assert!(cache
            .entries
            .lock()
            .unwrap()
            .contains_key(crate::cache::GLOBAL_KEY));

        // a write the cache has not been told about is not visible
        let mut batch = ProjectionBatch::new(checkpoint(1));
        let mut global = GlobalAggregate::zeroed();
        global.total_stakes = U256::from(3);
        batch.global = Some(global);
        store.commit(batch.clone()).await.unwrap();
        assert_eq!(
            queries.get_global_stats().await.unwrap().total_stakes,
            U256::zero()
        );

        crate::cache::invalidate_batch(cache.as_ref(), &batch)
            .await
            .unwrap();
        assert_eq!(
            queries.get_global_stats().await.unwrap().total_stakes,
            U256::from(3)
        );
    }

    #[tokio::test]
    async fn test_user_lookup_normalizes_address() {
        let store = Arc::new(MemoryStore::new());
        let queries = service(store.clone(), Arc::new(MemoryCache::default()));

        let mut batch = ProjectionBatch::new(checkpoint(1));
        batch.user = Some(UserState::zeroed("0xabcd"));
        store.commit(batch).await.unwrap();

        assert!(queries.get_user("0xABCD").await.unwrap().is_some());
        assert!(queries.get_user("0x1234").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_stakes_filters_by_user() {
        let store = Arc::new(MemoryStore::new());
        let queries = service(store.clone(), Arc::new(MemoryCache::default()));

        for (i, user) in ["0x11", "0x22", "0x11"].iter().enumerate() {
            let mut batch = ProjectionBatch::new(checkpoint(i as u64 + 1));
            batch.record = Some(stake(&format!("0xaa-{}", i), user));
            store.commit(batch).await.unwrap();
        }

        let stakes = queries
            .get_user_stakes("0x11", Page::default())
            .await
            .unwrap();
        assert_eq!(stakes.len(), 2);
        assert_eq!(stakes[0].id(), "0xaa-2");

        let withdrawals = queries
            .get_user_withdrawals("0x11", Page::default())
            .await
            .unwrap();
        assert!(withdrawals.is_empty());

        let by_tx = queries.get_records_by_transaction("0xAA").await.unwrap();
        assert_eq!(by_tx.len(), 3);
    }

    #[test]
    fn test_query_hash_is_deterministic() {
        let a = RecordQuery::new().with_user("0x11").with_kind(RecordKind::Stake);
        let b = RecordQuery::new().with_user("0x11").with_kind(RecordKind::Stake);
        let c = RecordQuery::new().with_user("0x22").with_kind(RecordKind::Stake);
        assert_eq!(generate_query_hash(&a), generate_query_hash(&b));
        assert_ne!(generate_query_hash(&a), generate_query_hash(&c));
    }
}
