//! Keyed entity storage used by the projector and the query layer.
//!
//! The projector reads entities through `EntityStore` one key at a time and
//! writes everything produced by one event as a single `ProjectionBatch`,
//! which implementations must apply atomically.

use crate::error::IndexerResult;
use crate::models::{
    Checkpoint, ContractState, DailyAggregate, EventRecord, GlobalAggregate, RecordQuery,
    UserState,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Result of a keyed read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    /// Convert into an `Option`, dropping the distinction callers no longer need
    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Lookup::Found(v),
            None => Lookup::NotFound,
        }
    }
}

/// Every write produced by projecting one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionBatch {
    pub record: Option<EventRecord>,
    pub user: Option<UserState>,
    pub contract: Option<ContractState>,
    pub global: Option<GlobalAggregate>,
    pub daily: Option<DailyAggregate>,
    pub checkpoint: Checkpoint,
}

impl ProjectionBatch {
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self {
            record: None,
            user: None,
            contract: None,
            global: None,
            daily: None,
            checkpoint,
        }
    }
}

/// Storage backend for projected entities
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn load_user(&self, id: &str) -> IndexerResult<Lookup<UserState>>;

    async fn load_contract_state(&self) -> IndexerResult<Lookup<ContractState>>;

    async fn load_global(&self) -> IndexerResult<Lookup<GlobalAggregate>>;

    /// Daily bucket by `YYYY-MM-DD` key
    async fn load_daily(&self, date: &str) -> IndexerResult<Lookup<DailyAggregate>>;

    async fn load_record(&self, id: &str) -> IndexerResult<Lookup<EventRecord>>;

    /// Records matching `query`, newest first
    async fn query_records(&self, query: &RecordQuery) -> IndexerResult<Vec<EventRecord>>;

    /// Daily buckets with `from <= date <= to`, oldest first
    async fn daily_range(&self, from: &str, to: &str) -> IndexerResult<Vec<DailyAggregate>>;

    async fn load_checkpoint(&self) -> IndexerResult<Option<Checkpoint>>;

    /// Apply all writes of `batch` or none of them.
    ///
    /// An already stored record is left untouched.
    async fn commit(&self, batch: ProjectionBatch) -> IndexerResult<()>;

    /// Drop every entity and the checkpoint, ahead of a full re-index
    async fn reset(&self) -> IndexerResult<()>;
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, UserState>,
    contract: Option<ContractState>,
    global: Option<GlobalAggregate>,
    daily: BTreeMap<String, DailyAggregate>,
    records: HashMap<String, EventRecord>,
    /// Record ids in insertion order
    record_order: Vec<String>,
    checkpoint: Option<Checkpoint>,
}

/// In-process store, used for tests and for replaying a stream without a database
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored immutable records
    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }

    /// Number of stored users
    pub async fn user_count(&self) -> usize {
        self.state.read().await.users.len()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn load_user(&self, id: &str) -> IndexerResult<Lookup<UserState>> {
        Ok(self.state.read().await.users.get(id).cloned().into())
    }

    async fn load_contract_state(&self) -> IndexerResult<Lookup<ContractState>> {
        Ok(self.state.read().await.contract.clone().into())
    }

    async fn load_global(&self) -> IndexerResult<Lookup<GlobalAggregate>> {
        Ok(self.state.read().await.global.clone().into())
    }

    async fn load_daily(&self, date: &str) -> IndexerResult<Lookup<DailyAggregate>> {
        Ok(self.state.read().await.daily.get(date).cloned().into())
    }

    async fn load_record(&self, id: &str) -> IndexerResult<Lookup<EventRecord>> {
        Ok(self.state.read().await.records.get(id).cloned().into())
    }

    async fn query_records(&self, query: &RecordQuery) -> IndexerResult<Vec<EventRecord>> {
        let state = self.state.read().await;
        let records = state
            .record_order
            .iter()
            .rev()
            .filter_map(|id| state.records.get(id))
            .filter(|record| query.matches(record))
            .skip(query.page.offset.max(0) as usize)
            .take(query.page.limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(records)
    }

    async fn daily_range(&self, from: &str, to: &str) -> IndexerResult<Vec<DailyAggregate>> {
        if from > to {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .daily
            .range(from.to_string()..=to.to_string())
            .map(|(_, day)| day.clone())
            .collect())
    }

    async fn load_checkpoint(&self) -> IndexerResult<Option<Checkpoint>> {
        Ok(self.state.read().await.checkpoint)
    }

    async fn commit(&self, batch: ProjectionBatch) -> IndexerResult<()> {
        let mut state = self.state.write().await;

        if let Some(record) = batch.record {
            let id = record.id().to_string();
            if !state.records.contains_key(&id) {
                state.records.insert(id.clone(), record);
                state.record_order.push(id);
            }
        }
        if let Some(user) = batch.user {
            state.users.insert(user.id.clone(), user);
        }
        if let Some(contract) = batch.contract {
            state.contract = Some(contract);
        }
        if let Some(global) = batch.global {
            state.global = Some(global);
        }
        if let Some(daily) = batch.daily {
            state.daily.insert(daily.id.clone(), daily);
        }
        state.checkpoint = Some(batch.checkpoint);

        Ok(())
    }

    async fn reset(&self) -> IndexerResult<()> {
        *self.state.write().await = MemoryState::default();
        Ok(())
    }
}
