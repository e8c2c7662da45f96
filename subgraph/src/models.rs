/// Entity models produced by the projection engine
use crate::events::StreamPosition;
use ethers::types::U256;
use serde::{Deserialize, Serialize};

/// Key of the contract state singleton
pub const CONTRACT_STATE_ID: &str = "staking-contract";

/// Key of the global aggregate singleton
pub const GLOBAL_AGGREGATE_ID: &str = "global";

/// Protocol-wide configuration and totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractState {
    /// Always `CONTRACT_STATE_ID`
    pub id: String,

    /// Token users stake
    pub staking_token_address: String,

    /// Latest absolute total reported by the contract
    pub total_staked: U256,

    pub current_reward_rate: U256,
    pub initial_apr: U256,
    pub min_lock_duration: U256,
    pub apr_reduction_per_thousand: U256,
    pub emergency_withdraw_penalty: U256,

    /// Sum of all claimed rewards
    pub total_rewards: U256,

    /// Record-style id (`txHash-logIndex`) of the initialization that last
    /// wrote this state, empty until initialized
    pub initialized_by: String,

    pub created_at: u64,
    pub updated_at: u64,
}

impl ContractState {
    pub fn zeroed() -> Self {
        Self {
            id: CONTRACT_STATE_ID.to_string(),
            staking_token_address: String::new(),
            total_staked: U256::zero(),
            current_reward_rate: U256::zero(),
            initial_apr: U256::zero(),
            min_lock_duration: U256::zero(),
            apr_reduction_per_thousand: U256::zero(),
            emergency_withdraw_penalty: U256::zero(),
            total_rewards: U256::zero(),
            initialized_by: String::new(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// Cumulative staking position of one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    /// Lowercase address
    pub id: String,

    pub staked_amount: U256,
    pub total_rewards_claimed: U256,
    pub total_emergency_withdrawals: U256,
    pub last_stake_timestamp: U256,

    /// Block timestamp of the first event for this address, 0 until set
    pub created_at: u64,
    pub updated_at: u64,
}

impl UserState {
    pub fn zeroed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            staked_amount: U256::zero(),
            total_rewards_claimed: U256::zero(),
            total_emergency_withdrawals: U256::zero(),
            last_stake_timestamp: U256::zero(),
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Stamp `created_at` the first time the user is touched
    pub fn touch(&mut self, block_timestamp: u64) {
        if self.created_at == 0 {
            self.created_at = block_timestamp;
        }
        self.updated_at = block_timestamp;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeRecord {
    pub id: String,
    pub user: String,
    pub amount: U256,
    pub timestamp: U256,
    pub new_total_staked: U256,
    pub current_reward_rate: U256,
    pub transaction_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub id: String,
    pub user: String,
    pub amount: U256,
    pub timestamp: U256,
    pub new_total_staked: U256,
    pub current_reward_rate: U256,
    pub rewards_accrued: U256,
    pub transaction_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardClaimRecord {
    pub id: String,
    pub user: String,
    pub amount: U256,
    pub timestamp: U256,
    pub new_pending_rewards: U256,
    pub total_staked: U256,
    pub transaction_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyWithdrawalRecord {
    pub id: String,
    pub user: String,
    pub amount: U256,
    pub penalty: U256,
    pub timestamp: U256,
    pub new_total_staked: U256,
    pub transaction_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRateUpdateRecord {
    pub id: String,
    pub old_rate: U256,
    pub new_rate: U256,
    pub timestamp: U256,
    pub total_staked: U256,
    pub transaction_hash: String,
    pub block_number: u64,
}

/// Write-once entity for a single historical event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventRecord {
    Stake(StakeRecord),
    Withdrawal(WithdrawalRecord),
    RewardClaim(RewardClaimRecord),
    EmergencyWithdrawal(EmergencyWithdrawalRecord),
    RewardRateUpdate(RewardRateUpdateRecord),
}

impl EventRecord {
    /// `transactionHash-logIndex`
    pub fn id(&self) -> &str {
        match self {
            EventRecord::Stake(r) => &r.id,
            EventRecord::Withdrawal(r) => &r.id,
            EventRecord::RewardClaim(r) => &r.id,
            EventRecord::EmergencyWithdrawal(r) => &r.id,
            EventRecord::RewardRateUpdate(r) => &r.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            EventRecord::Stake(_) => RecordKind::Stake,
            EventRecord::Withdrawal(_) => RecordKind::Withdrawal,
            EventRecord::RewardClaim(_) => RecordKind::RewardClaim,
            EventRecord::EmergencyWithdrawal(_) => RecordKind::EmergencyWithdrawal,
            EventRecord::RewardRateUpdate(_) => RecordKind::RewardRateUpdate,
        }
    }

    pub fn user(&self) -> Option<&str> {
        match self {
            EventRecord::Stake(r) => Some(&r.user),
            EventRecord::Withdrawal(r) => Some(&r.user),
            EventRecord::RewardClaim(r) => Some(&r.user),
            EventRecord::EmergencyWithdrawal(r) => Some(&r.user),
            EventRecord::RewardRateUpdate(_) => None,
        }
    }

    pub fn transaction_hash(&self) -> &str {
        match self {
            EventRecord::Stake(r) => &r.transaction_hash,
            EventRecord::Withdrawal(r) => &r.transaction_hash,
            EventRecord::RewardClaim(r) => &r.transaction_hash,
            EventRecord::EmergencyWithdrawal(r) => &r.transaction_hash,
            EventRecord::RewardRateUpdate(r) => &r.transaction_hash,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            EventRecord::Stake(r) => r.block_number,
            EventRecord::Withdrawal(r) => r.block_number,
            EventRecord::RewardClaim(r) => r.block_number,
            EventRecord::EmergencyWithdrawal(r) => r.block_number,
            EventRecord::RewardRateUpdate(r) => r.block_number,
        }
    }
}

/// Discriminant of `EventRecord`, also the `kind` column in storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Stake,
    Withdrawal,
    RewardClaim,
    EmergencyWithdrawal,
    RewardRateUpdate,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Stake => "Stake",
            RecordKind::Withdrawal => "Withdrawal",
            RecordKind::RewardClaim => "RewardClaim",
            RecordKind::EmergencyWithdrawal => "EmergencyWithdrawal",
            RecordKind::RewardRateUpdate => "RewardRateUpdate",
        }
    }
}

/// Activity rollup for one UTC calendar day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    /// `YYYY-MM-DD`
    pub id: String,
    pub date: String,
    pub total_staked: U256,
    pub total_users: U256,
    pub total_stakes: U256,
    pub total_withdrawals: U256,
    pub total_rewards_claimed: U256,
    pub total_emergency_withdrawals: U256,
    pub average_stake_amount: U256,
    pub current_reward_rate: U256,
}

impl DailyAggregate {
    pub fn zeroed(date: &str) -> Self {
        Self {
            id: date.to_string(),
            date: date.to_string(),
            total_staked: U256::zero(),
            total_users: U256::zero(),
            total_stakes: U256::zero(),
            total_withdrawals: U256::zero(),
            total_rewards_claimed: U256::zero(),
            total_emergency_withdrawals: U256::zero(),
            average_stake_amount: U256::zero(),
            current_reward_rate: U256::zero(),
        }
    }

    /// `total_staked / total_stakes`, left untouched while there are no stakes
    pub fn recompute_average(&mut self) {
        if !self.total_stakes.is_zero() {
            self.average_stake_amount = self.total_staked / self.total_stakes;
        }
    }
}

/// All-time running totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalAggregate {
    /// Always `GLOBAL_AGGREGATE_ID`
    pub id: String,
    pub total_staked: U256,
    pub total_users: U256,
    pub total_stakes: U256,
    pub total_withdrawals: U256,
    pub total_rewards_claimed: U256,
    pub total_emergency_withdrawals: U256,
    pub current_reward_rate: U256,
    pub last_updated: u64,
}

impl GlobalAggregate {
    pub fn zeroed() -> Self {
        Self {
            id: GLOBAL_AGGREGATE_ID.to_string(),
            total_staked: U256::zero(),
            total_users: U256::zero(),
            total_stakes: U256::zero(),
            total_withdrawals: U256::zero(),
            total_rewards_claimed: U256::zero(),
            total_emergency_withdrawals: U256::zero(),
            current_reward_rate: U256::zero(),
            last_updated: 0,
        }
    }
}

/// Position of the last event whose writes were committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub position: StreamPosition,

    /// Block timestamp of that event
    pub updated_at: u64,
}

/// Pagination for range queries over immutable records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Filter for record range queries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordQuery {
    pub kind: Option<RecordKind>,
    pub user: Option<String>,
    pub transaction_hash: Option<String>,
    pub page: Page,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self {
            kind: None,
            user: None,
            transaction_hash: None,
            page: Page::default(),
        }
    }

    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(crate::events::normalize_address(user));
        self
    }

    pub fn with_transaction(mut self, tx_hash: &str) -> Self {
        self.transaction_hash = Some(crate::events::normalize_address(tx_hash));
        self
    }

    pub fn with_page(mut self, page: Page) -> Self {
        self.page = page;
        self
    }

    /// Whether `record` passes every set filter
    pub fn matches(&self, record: &EventRecord) -> bool {
        self.kind.map_or(true, |k| record.kind() == k)
            && self
                .user
                .as_deref()
                .map_or(true, |u| record.user() == Some(u))
            && self
                .transaction_hash
                .as_deref()
                .map_or(true, |tx| record.transaction_hash() == tx)
    }
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self::new()
    }
}

/// Real-time notification published after an event is projected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub record: Option<EventRecord>,
    pub user: Option<UserState>,
    pub contract: Option<ContractState>,
    pub global: Option<GlobalAggregate>,
    pub daily: Option<DailyAggregate>,
    pub checkpoint: Checkpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_only_with_stakes() {
        let mut day = DailyAggregate::zeroed("2024-01-01");
        day.total_staked = U256::from(150);
        day.recompute_average();
        assert_eq!(day.average_stake_amount, U256::zero());

        day.total_stakes = U256::from(2);
        day.recompute_average();
        assert_eq!(day.average_stake_amount, U256::from(75));
    }

    #[test]
    fn test_user_touch_sets_created_once() {
        let mut user = UserState::zeroed("0x11");
        user.touch(1_000);
        user.touch(2_000);
        assert_eq!(user.created_at, 1_000);
        assert_eq!(user.updated_at, 2_000);
    }

    #[test]
    fn test_record_query_matches() {
        let record = EventRecord::Stake(StakeRecord {
            id: "0xaa-0".to_string(),
            user: "0x11".to_string(),
            amount: U256::from(1),
            timestamp: U256::from(1),
            new_total_staked: U256::from(1),
            current_reward_rate: U256::zero(),
            transaction_hash: "0xaa".to_string(),
            block_number: 1,
        });

        assert!(RecordQuery::new().matches(&record));
        assert!(RecordQuery::new().with_user("0x11").matches(&record));
        assert!(!RecordQuery::new().with_user("0x22").matches(&record));
        assert!(!RecordQuery::new()
            .with_kind(RecordKind::Withdrawal)
            .matches(&record));
        assert!(RecordQuery::new().with_transaction("0xAA").matches(&record));
    }
}
