/// Blockchain indexer service that feeds contract logs through the projector
use crate::cache::{self, CacheBackend};
use crate::config::Config;
use crate::error::{IndexerError, IndexerResult};
use crate::events::IndexedEvent;
use crate::models::EntityUpdate;
use crate::parser::EventParser;
use crate::projector::{Outcome, Projector};
use crate::store::{EntityStore, ProjectionBatch};
use async_trait::async_trait;
use ethers::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// Read access to the chain the staking contract lives on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_block(&self) -> IndexerResult<u64>;

    /// Logs emitted by `address` in `from..=to` whose first topic is one of `topics`
    async fn get_logs(
        &self,
        address: Address,
        topics: Vec<H256>,
        from: u64,
        to: u64,
    ) -> IndexerResult<Vec<Log>>;

    async fn block_timestamp(&self, block: u64) -> IndexerResult<u64>;
}

/// `ChainClient` over an ethers WebSocket provider
pub struct EthersChain {
    provider: Provider<Ws>,
}

impl EthersChain {
    pub async fn connect(ws_url: &str) -> IndexerResult<Self> {
        let provider = Provider::<Ws>::connect(ws_url)
            .await
            .map_err(|e| IndexerError::Rpc(format!("Failed to connect to blockchain: {}", e)))?;

        info!("Connected to blockchain at {}", ws_url);
        Ok(Self { provider })
    }
}

#[async_trait]
impl ChainClient for EthersChain {
    async fn current_block(&self) -> IndexerResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| IndexerError::Rpc(format!("Failed to get block number: {}", e)))
    }

    async fn get_logs(
        &self,
        address: Address,
        topics: Vec<H256>,
        from: u64,
        to: u64,
    ) -> IndexerResult<Vec<Log>> {
        let filter = Filter::new()
            .address(address)
            .topic0(topics)
            .from_block(from)
            .to_block(to);

        self.provider
            .get_logs(&filter)
            .await
            .map_err(|e| IndexerError::Rpc(format!("Failed to fetch logs: {}", e)))
    }

    async fn block_timestamp(&self, block: u64) -> IndexerResult<u64> {
        let header = self
            .provider
            .get_block(BlockNumber::Number(U64::from(block)))
            .await
            .map_err(|e| IndexerError::Rpc(format!("Failed to fetch block {}: {}", block, e)))?
            .ok_or_else(|| IndexerError::Rpc(format!("Block {} not found", block)))?;

        Ok(header.timestamp.as_u64())
    }
}

/// Exponential backoff in milliseconds, saturating instead of overflowing
fn backoff_delay(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(2u64.saturating_pow(attempt))
}

/// Indexer service that polls the chain and projects staking events
pub struct IndexerService<S, C, K>
where
    S: EntityStore + ?Sized,
    C: ChainClient + ?Sized,
    K: CacheBackend + ?Sized,
{
    /// Blockchain access
    chain: Arc<C>,

    /// Log decoder for the staking contract
    parser: EventParser,

    /// Projection engine, one event at a time
    projector: Mutex<Projector<S>>,

    /// Cache service
    cache: Arc<K>,

    /// Configuration
    config: Config,

    /// Next block to fetch
    next_block: RwLock<u64>,

    /// Current indexing state
    is_running: Arc<RwLock<bool>>,
}

impl<S, C, K> IndexerService<S, C, K>
where
    S: EntityStore + ?Sized,
    C: ChainClient + ?Sized,
    K: CacheBackend + ?Sized,
{
    /// Create a new indexer service
    ///
    /// Resumes from the persisted checkpoint, or from the configured start
    /// block on an empty store.
    pub async fn new(
        config: Config,
        chain: Arc<C>,
        store: Arc<S>,
        cache: Arc<K>,
    ) -> IndexerResult<Self> {
        let parser = EventParser::new(config.staking_contract_address()?)?;

        let mut projector = Projector::new(store);
        let next_block = match projector.resume().await? {
            // re-scan the checkpoint block; already applied logs are filtered
            Some(position) => position.block_number.max(config.blockchain.start_block),
            None => config.blockchain.start_block,
        };

        info!(
            "Indexing {} from block {}",
            parser.contract_address(),
            next_block
        );

        Ok(Self {
            chain,
            parser,
            projector: Mutex::new(projector),
            cache,
            config,
            next_block: RwLock::new(next_block),
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Start the indexing service
    ///
    /// This will continuously poll for new blocks and project events until
    /// stopped or until a non-transient error occurs.
    pub async fn start(&self) -> IndexerResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            warn!("Indexer is already running");
            return Ok(());
        }
        *is_running = true;
        drop(is_running);

        info!("Starting indexer service");

        let result = self.poll_loop().await;
        *self.is_running.write().await = false;
        result
    }

    async fn poll_loop(&self) -> IndexerResult<()> {
        loop {
            if !*self.is_running.read().await {
                info!("Indexer stopped");
                return Ok(());
            }

            match self.sync_once().await {
                Ok(count) if count > 0 => debug!("Projected {} events this poll", count),
                Ok(_) => {}
                Err(e) => {
                    error!("Indexing halted: {}", e);
                    return Err(e);
                }
            }

            sleep(Duration::from_secs(self.config.indexer.poll_interval)).await;
        }
    }

    /// Index every confirmed block not yet seen
    ///
    /// # Returns
    /// Number of events applied
    pub async fn sync_once(&self) -> IndexerResult<usize> {
        let current_block = self.chain.current_block().await?;
        let to_block = current_block.saturating_sub(self.config.indexer.confirmations);
        let from_block = *self.next_block.read().await;

        if from_block > to_block {
            return Ok(0); // Nothing to index
        }

        let mut total = 0;
        let mut batch_start = from_block;
        while batch_start <= to_block {
            let batch_end = std::cmp::min(
                batch_start.saturating_add(self.config.indexer.batch_size - 1),
                to_block,
            );

            let count = self.index_with_retry(batch_start, batch_end).await?;
            if count > 0 {
                info!(
                    "Projected {} events from blocks {}-{}",
                    count, batch_start, batch_end
                );
            }
            total += count;

            *self.next_block.write().await = batch_end + 1;
            batch_start = batch_end + 1;
        }

        let ttl = self.config.cache.stats_ttl.max(1);
        if let Err(e) = self
            .cache
            .set_raw(cache::LATEST_BLOCK_KEY, to_block.to_string(), ttl)
            .await
        {
            warn!("Failed to record latest block in cache: {}", e);
        }

        Ok(total)
    }

    /// Retry transient failures with exponential backoff
    async fn index_with_retry(&self, from_block: u64, to_block: u64) -> IndexerResult<usize> {
        let mut attempt = 0;
        loop {
            match self.index_block_range(from_block, to_block).await {
                Ok(count) => return Ok(count),
                Err(e) if e.is_transient() && attempt < self.config.indexer.max_retries => {
                    let delay = backoff_delay(self.config.indexer.retry_delay_ms, attempt);
                    warn!(
                        "Failed to index blocks {}-{} (attempt {}): {}; retrying in {}ms",
                        from_block,
                        to_block,
                        attempt + 1,
                        e,
                        delay
                    );
                    sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "Failed to index blocks {}-{}: {}",
                        from_block, to_block, e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Fetch, decode and project the staking events in a block range
    ///
    /// # Arguments
    /// * `from_block` - Start block (inclusive)
    /// * `to_block` - End block (inclusive)
    ///
    /// # Returns
    /// Number of events applied
    pub async fn index_block_range(&self, from_block: u64, to_block: u64) -> IndexerResult<usize> {
        if from_block > to_block {
            return Err(IndexerError::InvalidBlockRange {
                from: from_block,
                to: to_block,
            });
        }

        let logs = self
            .chain
            .get_logs(
                self.parser.address(),
                self.parser.topics(),
                from_block,
                to_block,
            )
            .await?;
        if logs.is_empty() {
            return Ok(0);
        }

        let events = self.decode_logs(logs).await?;

        let mut projector = self.projector.lock().await;
        let last = projector.last_position();
        let mut applied = 0;

        for event in events {
            if last.map_or(false, |last| event.meta.position() <= last) {
                continue;
            }
            match projector.apply(&event).await? {
                Outcome::Applied(batch) => {
                    applied += 1;
                    self.after_commit(&batch).await;
                }
                Outcome::Duplicate => {}
            }
        }

        Ok(applied)
    }

    /// Decode logs in (block, log index) order, fetching each block's
    /// timestamp once
    async fn decode_logs(&self, mut logs: Vec<Log>) -> IndexerResult<Vec<IndexedEvent>> {
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        let mut timestamps: HashMap<u64, u64> = HashMap::new();
        let mut events = Vec::with_capacity(logs.len());

        for log in &logs {
            let block = log
                .block_number
                .ok_or_else(|| IndexerError::malformed("block.number"))?
                .as_u64();
            let timestamp = match timestamps.get(&block) {
                Some(ts) => *ts,
                None => {
                    let ts = self.chain.block_timestamp(block).await?;
                    timestamps.insert(block, ts);
                    ts
                }
            };

            if let Some(event) = self.parser.parse_log(log, timestamp)? {
                events.push(event);
            }
        }

        Ok(events)
    }

    /// Cache maintenance after a commit; failures here never undo the commit
    async fn after_commit(&self, batch: &ProjectionBatch) {
        if let Err(e) = cache::invalidate_batch(self.cache.as_ref(), batch).await {
            warn!("Failed to invalidate cache: {}", e);
        }

        if !self.config.indexer.enable_realtime {
            return;
        }
        let update = EntityUpdate {
            record: batch.record.clone(),
            user: batch.user.clone(),
            contract: batch.contract.clone(),
            global: batch.global.clone(),
            daily: batch.daily.clone(),
            checkpoint: batch.checkpoint,
        };
        if let Err(e) = cache::publish_json(self.cache.as_ref(), cache::UPDATES_CHANNEL, &update).await
        {
            warn!("Failed to publish entity update: {}", e);
        }
    }

    /// Stop the indexing service
    pub async fn stop(&self) {
        let mut is_running = self.is_running.write().await;
        *is_running = false;
        info!("Stopping indexer service");
    }

    /// Drop all projected state and replay from the configured start block
    ///
    /// Projections are not reversible, so this is the recovery path for any
    /// detected inconsistency and for chain reorganizations.
    pub async fn reindex(&self) -> IndexerResult<()> {
        let mut projector = self.projector.lock().await;
        projector.store().reset().await?;
        projector.rewind();
        *self.next_block.write().await = self.config.blockchain.start_block;

        if let Err(e) = self.cache.delete_prefix("").await {
            warn!("Failed to clear cache: {}", e);
        }

        info!(
            "Reset projection; re-indexing from block {}",
            self.config.blockchain.start_block
        );
        Ok(())
    }

    /// Handle blockchain reorganization
    ///
    /// # Arguments
    /// * `reorg_block` - Block number where reorg occurred
    pub async fn handle_reorg(&self, reorg_block: u64) -> IndexerResult<()> {
        warn!(
            "Handling blockchain reorganization from block {}",
            reorg_block
        );

        let last = self.projector.lock().await.last_position();
        match last {
            Some(position) if position.block_number >= reorg_block => self.reindex().await,
            _ => {
                // nothing projected past the fork point; just re-fetch
                let mut next_block = self.next_block.write().await;
                *next_block = (*next_block).min(reorg_block);
                Ok(())
            }
        }
    }

    /// Next block the service will fetch
    pub async fn next_block(&self) -> u64 {
        *self.next_block.read().await
    }

    /// Get service status
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::MemoryCache;
    use crate::parser::STAKING_EVENTS_ABI;
    use crate::store::{Lookup, MemoryStore};
    use ethers::abi::{encode, Abi, Token};

    fn staking_address() -> Address {
        Address::repeat_byte(0x5a)
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.blockchain.staking_contract = format!("{:?}", staking_address());
        config.blockchain.start_block = 100;
        config.indexer.confirmations = 2;
        config.indexer.batch_size = 10;
        config.indexer.max_retries = 2;
        config.indexer.retry_delay_ms = 1;
        config
    }

    fn staked_log(block: u64, log_index: u64, amount: u64, new_total: u64) -> Log {
        let abi: Abi = serde_json::from_str(STAKING_EVENTS_ABI).unwrap();
        Log {
            address: staking_address(),
            topics: vec![
                abi.event("Staked").unwrap().signature(),
                H256::from(Address::repeat_byte(0x11)),
            ],
            data: encode(&[
                Token::Uint(U256::from(amount)),
                Token::Uint(U256::from(block * 12)),
                Token::Uint(U256::from(new_total)),
                Token::Uint(U256::from(500)),
            ])
            .into(),
            block_number: Some(U64::from(block)),
            transaction_hash: Some(H256::from_low_u64_be(block * 100 + log_index)),
            log_index: Some(U256::from(log_index)),
            ..Default::default()
        }
    }

    fn initialized_log(block: u64) -> Log {
        let abi: Abi = serde_json::from_str(STAKING_EVENTS_ABI).unwrap();
        Log {
            address: staking_address(),
            topics: vec![
                abi.event("StakingInitialized").unwrap().signature(),
                H256::from(Address::repeat_byte(0xaa)),
            ],
            data: encode(&[Token::Uint(U256::from(500))]).into(),
            block_number: Some(U64::from(block)),
            transaction_hash: Some(H256::from_low_u64_be(block * 100)),
            log_index: Some(U256::zero()),
            ..Default::default()
        }
    }

    async fn service(
        chain: MockChainClient,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
    ) -> IndexerService<MemoryStore, MockChainClient, MemoryCache> {
        IndexerService::new(test_config(), Arc::new(chain), store, cache)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_index_block_range_projects_sorted_logs() {
        let mut chain = MockChainClient::new();
        chain
            .expect_get_logs()
            .withf(|address, topics, from, to| {
                *address == staking_address() && topics.len() == 6 && *from == 100 && *to == 101
            })
            .returning(|_, _, _, _| {
                // delivered out of order; the service sorts them
                Ok(vec![staked_log(101, 0, 50, 150), staked_log(100, 0, 100, 100)])
            });
        chain
            .expect_block_timestamp()
            .times(2)
            .returning(|block| Ok(block * 12));

        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::default());
        let indexer = service(chain, store.clone(), cache.clone()).await;

        assert_eq!(indexer.index_block_range(100, 101).await.unwrap(), 2);

        let global = store.load_global().await.unwrap().into_option().unwrap();
        assert_eq!(global.total_staked, U256::from(150));
        assert_eq!(global.total_stakes, U256::from(2));

        let user = store.load_user(&format!("{:?}", Address::repeat_byte(0x11))).await.unwrap();
        match user {
            Lookup::Found(user) => assert_eq!(user.staked_amount, U256::from(150)),
            Lookup::NotFound => panic!("user not projected"),
        }
        assert_eq!(cache.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rescanning_a_range_applies_nothing_twice() {
        let mut chain = MockChainClient::new();
        chain
            .expect_get_logs()
            .returning(|_, _, _, _| Ok(vec![staked_log(100, 0, 100, 100)]));
        chain.expect_block_timestamp().returning(|block| Ok(block * 12));

        let store = Arc::new(MemoryStore::new());
        let indexer = service(chain, store.clone(), Arc::new(MemoryCache::default())).await;

        assert_eq!(indexer.index_block_range(100, 100).await.unwrap(), 1);
        assert_eq!(indexer.index_block_range(100, 100).await.unwrap(), 0);

        let global = store.load_global().await.unwrap().into_option().unwrap();
        assert_eq!(global.total_stakes, U256::one());
    }

    #[tokio::test]
    async fn test_sync_once_respects_confirmations_and_batches() {
        let mut chain = MockChainClient::new();
        chain.expect_current_block().returning(|| Ok(125));
        // 100..=123 in batches of 10
        chain.expect_get_logs().times(3).returning(|_, _, _, _| Ok(vec![]));

        let indexer = service(
            chain,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::default()),
        )
        .await;

        assert_eq!(indexer.sync_once().await.unwrap(), 0);
        assert_eq!(indexer.next_block().await, 124);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut chain = MockChainClient::new();
        let mut seq = mockall::Sequence::new();
        chain
            .expect_get_logs()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Err(IndexerError::Rpc("timeout".to_string())));
        chain
            .expect_get_logs()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(vec![staked_log(100, 0, 100, 100)]));
        chain.expect_block_timestamp().returning(|block| Ok(block * 12));

        let indexer = service(
            chain,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::default()),
        )
        .await;

        assert_eq!(indexer.index_with_retry(100, 100).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_data_errors_are_not_retried() {
        let mut chain = MockChainClient::new();
        chain.expect_get_logs().times(1).returning(|_, _, _, _| {
            let mut log = staked_log(100, 0, 100, 100);
            log.transaction_hash = None;
            Ok(vec![log])
        });
        chain.expect_block_timestamp().returning(|block| Ok(block * 12));

        let indexer = service(
            chain,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::default()),
        )
        .await;

        assert!(matches!(
            indexer.index_with_retry(100, 100).await,
            Err(IndexerError::MalformedEvent { .. })
        ));
    }

    #[tokio::test]
    async fn test_reindex_resets_state() {
        let mut chain = MockChainClient::new();
        chain
            .expect_get_logs()
            .returning(|_, _, _, _| Ok(vec![staked_log(100, 0, 100, 100)]));
        chain.expect_block_timestamp().returning(|block| Ok(block * 12));

        let store = Arc::new(MemoryStore::new());
        let indexer = service(chain, store.clone(), Arc::new(MemoryCache::default())).await;

        indexer.index_block_range(100, 100).await.unwrap();
        indexer.handle_reorg(100).await.unwrap();

        assert!(store.load_checkpoint().await.unwrap().is_none());
        assert_eq!(indexer.next_block().await, 100);

        // the replay projects the same log again
        assert_eq!(indexer.index_block_range(100, 100).await.unwrap(), 1);
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn test_initialization_is_published() {
        let mut chain = MockChainClient::new();
        chain
            .expect_get_logs()
            .returning(|_, _, _, _| Ok(vec![initialized_log(100)]));
        chain.expect_block_timestamp().returning(|block| Ok(block * 12));

        let cache = Arc::new(MemoryCache::default());
        let indexer = service(chain, Arc::new(MemoryStore::new()), cache.clone()).await;
        assert_eq!(indexer.index_block_range(100, 100).await.unwrap(), 1);

        let published = cache.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, cache::UPDATES_CHANNEL);
        let update: EntityUpdate = serde_json::from_str(&published[0].1).unwrap();
        let contract = update.contract.unwrap();
        assert_eq!(contract.current_reward_rate, U256::from(500));
        assert!(update.daily.is_none());
        assert!(update.record.is_none());
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff_delay(100, 0), 100);
        assert_eq!(backoff_delay(100, 3), 800);
        assert_eq!(backoff_delay(100, 64), u64::MAX);
        assert_eq!(backoff_delay(1, 70), u64::MAX);
    }

    #[test]
    fn test_invalid_range() {
        let chain = MockChainClient::new();
        let indexer = tokio_test::block_on(service(
            chain,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::default()),
        ));
        assert!(matches!(
            tokio_test::block_on(indexer.index_block_range(5, 4)),
            Err(IndexerError::InvalidBlockRange { from: 5, to: 4 })
        ));
    }
}
