//! Fetch-or-create resolvers.
//!
//! A resolver reads one entity by key and, when absent, materializes a zeroed
//! instance. Nothing is written here: the handler decides what to persist.

use crate::error::{IndexerError, IndexerResult};
use crate::events::normalize_address;
use crate::models::{ContractState, DailyAggregate, GlobalAggregate, UserState};
use crate::store::{EntityStore, Lookup};
use chrono::{DateTime, Utc};

pub const SECONDS_PER_DAY: u64 = 86_400;

/// An entity loaded from the store or freshly zero-initialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<T> {
    Existing(T),
    Created(T),
}

impl<T> Resolved<T> {
    fn resolve(lookup: Lookup<T>, create: impl FnOnce() -> T) -> Self {
        match lookup {
            Lookup::Found(entity) => Resolved::Existing(entity),
            Lookup::NotFound => Resolved::Created(create()),
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Resolved::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Resolved::Existing(entity) | Resolved::Created(entity) => entity,
        }
    }
}

/// Start of the UTC day containing `timestamp`
pub fn day_start(timestamp: u64) -> u64 {
    timestamp / SECONDS_PER_DAY * SECONDS_PER_DAY
}

/// `YYYY-MM-DD` key of the UTC day containing `timestamp`
pub fn day_key(timestamp: u64) -> IndexerResult<String> {
    let start = i64::try_from(day_start(timestamp))
        .map_err(|_| IndexerError::InvalidTimestamp(timestamp))?;
    let date = DateTime::<Utc>::from_timestamp(start, 0)
        .ok_or(IndexerError::InvalidTimestamp(timestamp))?;
    Ok(date.format("%Y-%m-%d").to_string())
}

pub async fn resolve_user<S: EntityStore + ?Sized>(
    store: &S,
    address: &str,
) -> IndexerResult<Resolved<UserState>> {
    let id = normalize_address(address);
    let lookup = store.load_user(&id).await?;
    Ok(Resolved::resolve(lookup, || UserState::zeroed(&id)))
}

pub async fn resolve_contract_state<S: EntityStore + ?Sized>(
    store: &S,
) -> IndexerResult<Resolved<ContractState>> {
    let lookup = store.load_contract_state().await?;
    Ok(Resolved::resolve(lookup, ContractState::zeroed))
}

pub async fn resolve_global_aggregate<S: EntityStore + ?Sized>(
    store: &S,
) -> IndexerResult<Resolved<GlobalAggregate>> {
    let lookup = store.load_global().await?;
    Ok(Resolved::resolve(lookup, GlobalAggregate::zeroed))
}

pub async fn resolve_daily_aggregate<S: EntityStore + ?Sized>(
    store: &S,
    timestamp: u64,
) -> IndexerResult<Resolved<DailyAggregate>> {
    let key = day_key(timestamp)?;
    let lookup = store.load_daily(&key).await?;
    Ok(Resolved::resolve(lookup, || DailyAggregate::zeroed(&key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamPosition;
    use crate::models::Checkpoint;
    use crate::store::{MemoryStore, ProjectionBatch};

    #[test]
    fn test_day_key_epoch_and_boundaries() {
        assert_eq!(day_key(0).unwrap(), "1970-01-01");
        assert_eq!(day_key(86_399).unwrap(), "1970-01-01");
        assert_eq!(day_key(86_400).unwrap(), "1970-01-02");
        // 2024-02-29 00:00:00 UTC
        assert_eq!(day_key(1_709_164_800).unwrap(), "2024-02-29");
        assert_eq!(day_key(1_709_164_799).unwrap(), "2024-02-28");
    }

    #[test]
    fn test_day_start_floors() {
        assert_eq!(day_start(1_709_200_000), 1_709_164_800);
        assert_eq!(day_start(1_709_164_800), 1_709_164_800);
    }

    #[test]
    fn test_day_key_out_of_range() {
        assert!(matches!(
            day_key(u64::MAX),
            Err(IndexerError::InvalidTimestamp(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_user_creates_without_persisting() {
        let store = MemoryStore::new();

        let user = resolve_user(&store, "0xABCD").await.unwrap();
        assert!(user.is_created());
        assert_eq!(user.clone().into_inner().id, "0xabcd");
        assert_eq!(store.user_count().await, 0);

        let mut batch = ProjectionBatch::new(Checkpoint {
            position: StreamPosition {
                block_number: 1,
                log_index: 0,
            },
            updated_at: 0,
        });
        batch.user = Some(user.into_inner());
        store.commit(batch).await.unwrap();

        let again = resolve_user(&store, "0xabcd").await.unwrap();
        assert!(!again.is_created());
    }

    #[tokio::test]
    async fn test_resolve_singletons_and_daily() {
        let store = MemoryStore::new();

        let contract = resolve_contract_state(&store).await.unwrap().into_inner();
        assert_eq!(contract.id, crate::models::CONTRACT_STATE_ID);

        let global = resolve_global_aggregate(&store).await.unwrap().into_inner();
        assert_eq!(global.id, crate::models::GLOBAL_AGGREGATE_ID);

        let daily = resolve_daily_aggregate(&store, 1_000).await.unwrap();
        assert!(daily.is_created());
        assert_eq!(daily.into_inner().date, "1970-01-01");
    }
}
