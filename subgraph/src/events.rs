//! Typed input events emitted by the staking contract.
//!
//! One params struct per event kind plus the block/transaction metadata every
//! log carries. The projector consumes these in (block number, log index)
//! order.

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block and transaction metadata shared by every event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Address of the contract that emitted the log
    pub contract_address: String,

    /// Transaction hash, `0x`-prefixed lowercase hex
    pub transaction_hash: String,

    /// Block number the log was included in
    pub block_number: u64,

    /// Block timestamp in seconds since the Unix epoch
    pub block_timestamp: u64,

    /// Position of the log within the block
    pub log_index: u64,
}

impl EventMeta {
    /// Unique id of the immutable record produced by this event
    pub fn record_id(&self) -> String {
        format!("{}-{}", self.transaction_hash, self.log_index)
    }

    /// Lowercase `0x`-prefixed transaction hash and contract address, the
    /// form record ids and stored hashes use
    pub fn normalized(mut self) -> Self {
        self.transaction_hash = normalize_address(&self.transaction_hash);
        self.contract_address = normalize_address(&self.contract_address);
        self
    }

    /// Position of this event in the stream
    pub fn position(&self) -> StreamPosition {
        StreamPosition {
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }
}

/// Totally ordered position of an event within the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamPosition {
    pub block_number: u64,
    pub log_index: u64,
}

impl StreamPosition {
    pub fn as_tuple(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingInitialized {
    pub staking_token: String,
    pub initial_reward_rate: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staked {
    pub user: String,
    pub amount: U256,
    pub timestamp: U256,
    pub new_total_staked: U256,
    pub current_reward_rate: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawn {
    pub user: String,
    pub amount: U256,
    pub timestamp: U256,
    pub new_total_staked: U256,
    pub current_reward_rate: U256,
    /// Informational; rewards are paid out through `RewardsClaimed`
    pub rewards_accrued: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardsClaimed {
    pub user: String,
    pub amount: U256,
    pub timestamp: U256,
    pub new_pending_rewards: U256,
    pub total_staked: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyWithdrawn {
    pub user: String,
    pub amount: U256,
    pub penalty: U256,
    pub timestamp: U256,
    pub new_total_staked: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRateUpdated {
    pub old_rate: U256,
    pub new_rate: U256,
    pub timestamp: U256,
    pub total_staked: U256,
}

/// Event payload, one variant per contract event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "params")]
pub enum StakingEvent {
    StakingInitialized(StakingInitialized),
    Staked(Staked),
    Withdrawn(Withdrawn),
    RewardsClaimed(RewardsClaimed),
    EmergencyWithdrawn(EmergencyWithdrawn),
    RewardRateUpdated(RewardRateUpdated),
}

impl StakingEvent {
    /// Solidity event name
    pub fn name(&self) -> &'static str {
        match self {
            StakingEvent::StakingInitialized(_) => "StakingInitialized",
            StakingEvent::Staked(_) => "Staked",
            StakingEvent::Withdrawn(_) => "Withdrawn",
            StakingEvent::RewardsClaimed(_) => "RewardsClaimed",
            StakingEvent::EmergencyWithdrawn(_) => "EmergencyWithdrawn",
            StakingEvent::RewardRateUpdated(_) => "RewardRateUpdated",
        }
    }

    /// Address of the user the event concerns, if any
    pub fn user(&self) -> Option<&str> {
        match self {
            StakingEvent::Staked(e) => Some(&e.user),
            StakingEvent::Withdrawn(e) => Some(&e.user),
            StakingEvent::RewardsClaimed(e) => Some(&e.user),
            StakingEvent::EmergencyWithdrawn(e) => Some(&e.user),
            StakingEvent::StakingInitialized(_) | StakingEvent::RewardRateUpdated(_) => None,
        }
    }
}

/// A decoded contract event together with its block metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEvent {
    pub meta: EventMeta,
    pub event: StakingEvent,
}

impl IndexedEvent {
    pub fn new(meta: EventMeta, event: StakingEvent) -> Self {
        Self { meta, event }
    }

    pub fn normalized(self) -> Self {
        Self {
            meta: self.meta.normalized(),
            event: self.event,
        }
    }
}

impl fmt::Display for IndexedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at block {} log {} (tx {})",
            self.event.name(),
            self.meta.block_number,
            self.meta.log_index,
            self.meta.transaction_hash
        )
    }
}

/// Normalize an address or hash to the lowercase `0x`-prefixed form used in keys
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", hex.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(block: u64, log: u64) -> EventMeta {
        EventMeta {
            contract_address: "0xstaking".to_string(),
            transaction_hash: "0xabc".to_string(),
            block_number: block,
            block_timestamp: 1_000,
            log_index: log,
        }
    }

    #[test]
    fn test_record_id_format() {
        assert_eq!(meta(1, 7).record_id(), "0xabc-7");
    }

    #[test]
    fn test_stream_position_ordering() {
        assert!(meta(1, 9).position() < meta(2, 0).position());
        assert!(meta(2, 0).position() < meta(2, 1).position());
        assert_eq!(meta(3, 3).position(), meta(3, 3).position());
    }

    #[test]
    fn test_normalized_meta_lowercases_hash() {
        let mut upper = meta(1, 2);
        upper.transaction_hash = "0xABCDEF".to_string();
        upper.contract_address = "5A5A".to_string();

        let normalized = upper.normalized();
        assert_eq!(normalized.transaction_hash, "0xabcdef");
        assert_eq!(normalized.contract_address, "0x5a5a");
        assert_eq!(normalized.record_id(), "0xabcdef-2");
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("0xAbCd"), "0xabcd");
        assert_eq!(normalize_address("0XABCD"), "0xabcd");
        assert_eq!(normalize_address(" abcd "), "0xabcd");
    }
}
