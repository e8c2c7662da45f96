//! Event handlers.
//!
//! Each handler reads the entities its event touches through the resolvers,
//! applies the transition, and returns the resulting `ProjectionBatch`.
//! Nothing is written until the projector commits the batch.

use crate::error::{IndexerError, IndexerResult};
use crate::events::{
    normalize_address, EmergencyWithdrawn, EventMeta, RewardRateUpdated, RewardsClaimed,
    Staked, StakingInitialized, Withdrawn,
};
use crate::models::{
    Checkpoint, ContractState, EmergencyWithdrawalRecord, EventRecord, RewardClaimRecord,
    RewardRateUpdateRecord, StakeRecord, WithdrawalRecord,
};
use crate::resolver::{
    resolve_contract_state, resolve_daily_aggregate, resolve_global_aggregate, resolve_user,
};
use crate::store::{EntityStore, ProjectionBatch};
use ethers::types::U256;

fn checked_add(value: U256, amount: U256, field: &'static str) -> IndexerResult<U256> {
    value.checked_add(amount).ok_or(IndexerError::Overflow(field))
}

fn increment(value: U256, field: &'static str) -> IndexerResult<U256> {
    checked_add(value, U256::one(), field)
}

fn batch_for(meta: &EventMeta) -> ProjectionBatch {
    ProjectionBatch::new(Checkpoint {
        position: meta.position(),
        updated_at: meta.block_timestamp,
    })
}

/// Reduce a user's stake, refusing to go below zero
fn debit_stake(user: &str, staked: U256, amount: U256) -> IndexerResult<U256> {
    staked
        .checked_sub(amount)
        .ok_or_else(|| IndexerError::NegativeBalance {
            user: user.to_string(),
            staked,
            amount,
        })
}

pub async fn handle_staking_initialized<S: EntityStore + ?Sized>(
    store: &S,
    meta: &EventMeta,
    params: &StakingInitialized,
) -> IndexerResult<ProjectionBatch> {
    let mut batch = batch_for(meta);

    // A repeated initialization replaces the singleton wholesale.
    let contract = ContractState {
        staking_token_address: normalize_address(&params.staking_token),
        current_reward_rate: params.initial_reward_rate,
        initial_apr: params.initial_reward_rate,
        initialized_by: meta.record_id(),
        created_at: meta.block_timestamp,
        updated_at: meta.block_timestamp,
        ..ContractState::zeroed()
    };

    let mut global = resolve_global_aggregate(store).await?.into_inner();
    global.current_reward_rate = params.initial_reward_rate;
    global.last_updated = meta.block_timestamp;

    batch.contract = Some(contract);
    batch.global = Some(global);
    Ok(batch)
}

pub async fn handle_staked<S: EntityStore + ?Sized>(
    store: &S,
    meta: &EventMeta,
    params: &Staked,
) -> IndexerResult<ProjectionBatch> {
    let mut batch = batch_for(meta);
    let user_id = normalize_address(&params.user);

    let record = StakeRecord {
        id: meta.record_id(),
        user: user_id.clone(),
        amount: params.amount,
        timestamp: params.timestamp,
        new_total_staked: params.new_total_staked,
        current_reward_rate: params.current_reward_rate,
        transaction_hash: meta.transaction_hash.clone(),
        block_number: meta.block_number,
    };

    let resolved = resolve_user(store, &user_id).await?;
    let new_user = resolved.is_created();
    let mut user = resolved.into_inner();
    user.touch(meta.block_timestamp);
    user.staked_amount = checked_add(user.staked_amount, params.amount, "user.staked_amount")?;
    user.last_stake_timestamp = params.timestamp;

    let mut contract = resolve_contract_state(store).await?.into_inner();
    contract.total_staked = params.new_total_staked;
    contract.current_reward_rate = params.current_reward_rate;
    contract.updated_at = meta.block_timestamp;

    let mut global = resolve_global_aggregate(store).await?.into_inner();
    global.total_staked = params.new_total_staked;
    global.total_stakes = increment(global.total_stakes, "global.total_stakes")?;
    global.current_reward_rate = params.current_reward_rate;
    global.last_updated = meta.block_timestamp;

    let mut daily = resolve_daily_aggregate(store, meta.block_timestamp)
        .await?
        .into_inner();
    daily.total_staked = params.new_total_staked;
    daily.total_stakes = increment(daily.total_stakes, "daily.total_stakes")?;
    daily.current_reward_rate = params.current_reward_rate;
    daily.recompute_average();

    if new_user {
        global.total_users = increment(global.total_users, "global.total_users")?;
        daily.total_users = increment(daily.total_users, "daily.total_users")?;
    }

    batch.record = Some(EventRecord::Stake(record));
    batch.user = Some(user);
    batch.contract = Some(contract);
    batch.global = Some(global);
    batch.daily = Some(daily);
    Ok(batch)
}

pub async fn handle_withdrawn<S: EntityStore + ?Sized>(
    store: &S,
    meta: &EventMeta,
    params: &Withdrawn,
) -> IndexerResult<ProjectionBatch> {
    let mut batch = batch_for(meta);
    let user_id = normalize_address(&params.user);

    let record = WithdrawalRecord {
        id: meta.record_id(),
        user: user_id.clone(),
        amount: params.amount,
        timestamp: params.timestamp,
        new_total_staked: params.new_total_staked,
        current_reward_rate: params.current_reward_rate,
        rewards_accrued: params.rewards_accrued,
        transaction_hash: meta.transaction_hash.clone(),
        block_number: meta.block_number,
    };

    let resolved = resolve_user(store, &user_id).await?;
    let new_user = resolved.is_created();
    let mut user = resolved.into_inner();
    user.staked_amount = debit_stake(&user_id, user.staked_amount, params.amount)?;
    user.touch(meta.block_timestamp);

    let mut contract = resolve_contract_state(store).await?.into_inner();
    contract.total_staked = params.new_total_staked;
    contract.current_reward_rate = params.current_reward_rate;
    contract.updated_at = meta.block_timestamp;

    let mut global = resolve_global_aggregate(store).await?.into_inner();
    global.total_staked = params.new_total_staked;
    global.total_withdrawals = increment(global.total_withdrawals, "global.total_withdrawals")?;
    global.current_reward_rate = params.current_reward_rate;
    global.last_updated = meta.block_timestamp;

    let mut daily = resolve_daily_aggregate(store, meta.block_timestamp)
        .await?
        .into_inner();
    daily.total_staked = params.new_total_staked;
    daily.total_withdrawals = increment(daily.total_withdrawals, "daily.total_withdrawals")?;
    daily.current_reward_rate = params.current_reward_rate;

    if new_user {
        global.total_users = increment(global.total_users, "global.total_users")?;
        daily.total_users = increment(daily.total_users, "daily.total_users")?;
    }

    batch.record = Some(EventRecord::Withdrawal(record));
    batch.user = Some(user);
    batch.contract = Some(contract);
    batch.global = Some(global);
    batch.daily = Some(daily);
    Ok(batch)
}

/// Claimed amounts accumulate on the user and the contract; global and daily
/// aggregates only count claims.
pub async fn handle_rewards_claimed<S: EntityStore + ?Sized>(
    store: &S,
    meta: &EventMeta,
    params: &RewardsClaimed,
) -> IndexerResult<ProjectionBatch> {
    let mut batch = batch_for(meta);
    let user_id = normalize_address(&params.user);

    let record = RewardClaimRecord {
        id: meta.record_id(),
        user: user_id.clone(),
        amount: params.amount,
        timestamp: params.timestamp,
        new_pending_rewards: params.new_pending_rewards,
        total_staked: params.total_staked,
        transaction_hash: meta.transaction_hash.clone(),
        block_number: meta.block_number,
    };

    let resolved = resolve_user(store, &user_id).await?;
    let new_user = resolved.is_created();
    let mut user = resolved.into_inner();
    user.total_rewards_claimed = checked_add(
        user.total_rewards_claimed,
        params.amount,
        "user.total_rewards_claimed",
    )?;
    user.touch(meta.block_timestamp);

    let mut contract = resolve_contract_state(store).await?.into_inner();
    contract.total_rewards =
        checked_add(contract.total_rewards, params.amount, "contract.total_rewards")?;
    contract.updated_at = meta.block_timestamp;

    let mut global = resolve_global_aggregate(store).await?.into_inner();
    global.total_rewards_claimed =
        increment(global.total_rewards_claimed, "global.total_rewards_claimed")?;
    global.last_updated = meta.block_timestamp;

    let mut daily = resolve_daily_aggregate(store, meta.block_timestamp)
        .await?
        .into_inner();
    daily.total_rewards_claimed =
        increment(daily.total_rewards_claimed, "daily.total_rewards_claimed")?;

    if new_user {
        global.total_users = increment(global.total_users, "global.total_users")?;
        daily.total_users = increment(daily.total_users, "daily.total_users")?;
    }

    batch.record = Some(EventRecord::RewardClaim(record));
    batch.user = Some(user);
    batch.contract = Some(contract);
    batch.global = Some(global);
    batch.daily = Some(daily);
    Ok(batch)
}

pub async fn handle_emergency_withdrawn<S: EntityStore + ?Sized>(
    store: &S,
    meta: &EventMeta,
    params: &EmergencyWithdrawn,
) -> IndexerResult<ProjectionBatch> {
    let mut batch = batch_for(meta);
    let user_id = normalize_address(&params.user);

    let record = EmergencyWithdrawalRecord {
        id: meta.record_id(),
        user: user_id.clone(),
        amount: params.amount,
        penalty: params.penalty,
        timestamp: params.timestamp,
        new_total_staked: params.new_total_staked,
        transaction_hash: meta.transaction_hash.clone(),
        block_number: meta.block_number,
    };

    let resolved = resolve_user(store, &user_id).await?;
    let new_user = resolved.is_created();
    let mut user = resolved.into_inner();
    user.staked_amount = debit_stake(&user_id, user.staked_amount, params.amount)?;
    user.total_emergency_withdrawals = increment(
        user.total_emergency_withdrawals,
        "user.total_emergency_withdrawals",
    )?;
    user.touch(meta.block_timestamp);

    let mut contract = resolve_contract_state(store).await?.into_inner();
    contract.total_staked = params.new_total_staked;
    contract.updated_at = meta.block_timestamp;

    let mut global = resolve_global_aggregate(store).await?.into_inner();
    global.total_staked = params.new_total_staked;
    global.total_emergency_withdrawals = increment(
        global.total_emergency_withdrawals,
        "global.total_emergency_withdrawals",
    )?;
    global.last_updated = meta.block_timestamp;

    let mut daily = resolve_daily_aggregate(store, meta.block_timestamp)
        .await?
        .into_inner();
    daily.total_staked = params.new_total_staked;
    daily.total_emergency_withdrawals = increment(
        daily.total_emergency_withdrawals,
        "daily.total_emergency_withdrawals",
    )?;

    if new_user {
        global.total_users = increment(global.total_users, "global.total_users")?;
        daily.total_users = increment(daily.total_users, "daily.total_users")?;
    }

    batch.record = Some(EventRecord::EmergencyWithdrawal(record));
    batch.user = Some(user);
    batch.contract = Some(contract);
    batch.global = Some(global);
    batch.daily = Some(daily);
    Ok(batch)
}

pub async fn handle_reward_rate_updated<S: EntityStore + ?Sized>(
    store: &S,
    meta: &EventMeta,
    params: &RewardRateUpdated,
) -> IndexerResult<ProjectionBatch> {
    let mut batch = batch_for(meta);

    let record = RewardRateUpdateRecord {
        id: meta.record_id(),
        old_rate: params.old_rate,
        new_rate: params.new_rate,
        timestamp: params.timestamp,
        total_staked: params.total_staked,
        transaction_hash: meta.transaction_hash.clone(),
        block_number: meta.block_number,
    };

    let mut contract = resolve_contract_state(store).await?.into_inner();
    contract.current_reward_rate = params.new_rate;
    contract.updated_at = meta.block_timestamp;

    let mut global = resolve_global_aggregate(store).await?.into_inner();
    global.current_reward_rate = params.new_rate;
    global.last_updated = meta.block_timestamp;

    let mut daily = resolve_daily_aggregate(store, meta.block_timestamp)
        .await?
        .into_inner();
    daily.current_reward_rate = params.new_rate;

    batch.record = Some(EventRecord::RewardRateUpdate(record));
    batch.contract = Some(contract);
    batch.global = Some(global);
    batch.daily = Some(daily);
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn meta(log_index: u64) -> EventMeta {
        EventMeta {
            contract_address: "0xstaking".to_string(),
            transaction_hash: "0xfeed".to_string(),
            block_number: 10,
            block_timestamp: 1_000,
            log_index,
        }
    }

    #[tokio::test]
    async fn test_staked_builds_full_batch() {
        let store = MemoryStore::new();
        let params = Staked {
            user: "0xAB".to_string(),
            amount: U256::from(100),
            timestamp: U256::from(999),
            new_total_staked: U256::from(100),
            current_reward_rate: U256::from(500),
        };

        let batch = handle_staked(&store, &meta(3), &params).await.unwrap();

        let user = batch.user.unwrap();
        assert_eq!(user.id, "0xab");
        assert_eq!(user.created_at, 1_000);
        assert_eq!(user.last_stake_timestamp, U256::from(999));
        assert_eq!(batch.record.unwrap().id(), "0xfeed-3");
        assert_eq!(batch.global.unwrap().total_users, U256::one());
        let daily = batch.daily.unwrap();
        assert_eq!(daily.average_stake_amount, U256::from(100));
        assert_eq!(daily.total_users, U256::one());
        assert_eq!(batch.checkpoint.position.log_index, 3);
        // nothing persisted yet
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn test_withdrawn_rejects_negative_balance() {
        let store = MemoryStore::new();
        let params = Withdrawn {
            user: "0x11".to_string(),
            amount: U256::from(1),
            timestamp: U256::from(1_000),
            new_total_staked: U256::zero(),
            current_reward_rate: U256::zero(),
            rewards_accrued: U256::zero(),
        };

        let err = handle_withdrawn(&store, &meta(0), &params).await.unwrap_err();
        assert!(matches!(err, IndexerError::NegativeBalance { .. }));
    }

    #[tokio::test]
    async fn test_rewards_claimed_counts_on_aggregates() {
        let store = MemoryStore::new();
        let params = RewardsClaimed {
            user: "0x11".to_string(),
            amount: U256::from(42),
            timestamp: U256::from(1_000),
            new_pending_rewards: U256::zero(),
            total_staked: U256::from(100),
        };

        let batch = handle_rewards_claimed(&store, &meta(0), &params)
            .await
            .unwrap();
        assert_eq!(batch.contract.unwrap().total_rewards, U256::from(42));
        assert_eq!(batch.global.unwrap().total_rewards_claimed, U256::one());
        assert_eq!(batch.daily.unwrap().total_rewards_claimed, U256::one());
        assert_eq!(batch.user.unwrap().total_rewards_claimed, U256::from(42));
    }

    #[tokio::test]
    async fn test_staking_initialized_has_no_record() {
        let store = MemoryStore::new();
        let params = StakingInitialized {
            staking_token: "0xAA".to_string(),
            initial_reward_rate: U256::from(500),
        };

        let batch = handle_staking_initialized(&store, &meta(0), &params)
            .await
            .unwrap();
        assert!(batch.record.is_none());
        let contract = batch.contract.unwrap();
        assert_eq!(contract.staking_token_address, "0xaa");
        assert_eq!(contract.initial_apr, U256::from(500));
        assert_eq!(contract.total_staked, U256::zero());
        assert_eq!(contract.created_at, 1_000);
        assert_eq!(contract.initialized_by, "0xfeed-0");
    }
}
