/// Event parser for decoding staking contract logs
use crate::error::{IndexerError, IndexerResult};
use crate::events::{
    EmergencyWithdrawn, EventMeta, IndexedEvent, RewardRateUpdated, RewardsClaimed, Staked,
    StakingEvent, StakingInitialized, Withdrawn,
};
use ethers::abi::{Abi, Event as AbiEvent, LogParam, RawLog, Token};
use ethers::prelude::*;
use std::collections::HashMap;
use tracing::warn;

/// Decodes logs emitted by the staking contract into typed events
pub struct EventParser {
    address: Address,

    /// Lowercase address of the staking contract
    contract_address: String,

    /// Map of event signatures to event definitions
    event_signatures: HashMap<H256, AbiEvent>,
}

impl EventParser {
    /// Create a parser for the staking contract at `contract_address`
    pub fn new(contract_address: Address) -> IndexerResult<Self> {
        let abi: Abi = serde_json::from_str(STAKING_EVENTS_ABI)
            .map_err(|e| IndexerError::EventParsing(format!("Invalid ABI: {}", e)))?;

        let event_signatures = abi
            .events()
            .map(|event| (event.signature(), event.clone()))
            .collect();

        Ok(Self {
            address: contract_address,
            contract_address: format!("{:?}", contract_address),
            event_signatures,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    /// Topic-0 values of every known event, for log filters
    pub fn topics(&self) -> Vec<H256> {
        self.event_signatures.keys().copied().collect()
    }

    /// Parse a log into a typed event
    ///
    /// # Arguments
    /// * `log` - Ethereum log from blockchain
    /// * `block_timestamp` - Timestamp of the block containing the log
    ///
    /// # Returns
    /// Parsed event or None if the log is not a staking contract event
    pub fn parse_log(&self, log: &Log, block_timestamp: u64) -> IndexerResult<Option<IndexedEvent>> {
        let contract_address = format!("{:?}", log.address);
        if contract_address != self.contract_address {
            return Ok(None);
        }

        if log.removed == Some(true) {
            warn!(
                "Ignoring removed log {:?} at index {:?}",
                log.transaction_hash, log.log_index
            );
            return Ok(None);
        }

        let Some(event_signature) = log.topics.first() else {
            return Ok(None);
        };

        let Some(event_def) = self.event_signatures.get(event_signature) else {
            return Ok(None);
        };

        let raw_log = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };

        let decoded = event_def
            .parse_log(raw_log)
            .map_err(|e| IndexerError::EventParsing(format!("Failed to decode event: {}", e)))?;

        let meta = EventMeta {
            contract_address,
            transaction_hash: format!(
                "{:?}",
                log.transaction_hash
                    .ok_or_else(|| IndexerError::malformed("transaction.hash"))?
            ),
            block_number: log
                .block_number
                .ok_or_else(|| IndexerError::malformed("block.number"))?
                .as_u64(),
            block_timestamp,
            log_index: log
                .log_index
                .ok_or_else(|| IndexerError::malformed("logIndex"))?
                .as_u64(),
        };

        let event = decode_event(&event_def.name, &decoded.params)?;
        Ok(Some(IndexedEvent::new(meta, event)))
    }
}

fn decode_event(name: &str, params: &[LogParam]) -> IndexerResult<StakingEvent> {
    let event = match name {
        "StakingInitialized" => StakingEvent::StakingInitialized(StakingInitialized {
            staking_token: address_param(params, "stakingToken")?,
            initial_reward_rate: uint_param(params, "initialRewardRate")?,
        }),
        "Staked" => StakingEvent::Staked(Staked {
            user: address_param(params, "user")?,
            amount: uint_param(params, "amount")?,
            timestamp: uint_param(params, "timestamp")?,
            new_total_staked: uint_param(params, "newTotalStaked")?,
            current_reward_rate: uint_param(params, "currentRewardRate")?,
        }),
        "Withdrawn" => StakingEvent::Withdrawn(Withdrawn {
            user: address_param(params, "user")?,
            amount: uint_param(params, "amount")?,
            timestamp: uint_param(params, "timestamp")?,
            new_total_staked: uint_param(params, "newTotalStaked")?,
            current_reward_rate: uint_param(params, "currentRewardRate")?,
            rewards_accrued: uint_param(params, "rewardsAccrued")?,
        }),
        "RewardsClaimed" => StakingEvent::RewardsClaimed(RewardsClaimed {
            user: address_param(params, "user")?,
            amount: uint_param(params, "amount")?,
            timestamp: uint_param(params, "timestamp")?,
            new_pending_rewards: uint_param(params, "newPendingRewards")?,
            total_staked: uint_param(params, "totalStaked")?,
        }),
        "EmergencyWithdrawn" => StakingEvent::EmergencyWithdrawn(EmergencyWithdrawn {
            user: address_param(params, "user")?,
            amount: uint_param(params, "amount")?,
            penalty: uint_param(params, "penalty")?,
            timestamp: uint_param(params, "timestamp")?,
            new_total_staked: uint_param(params, "newTotalStaked")?,
        }),
        "RewardRateUpdated" => StakingEvent::RewardRateUpdated(RewardRateUpdated {
            old_rate: uint_param(params, "oldRate")?,
            new_rate: uint_param(params, "newRate")?,
            timestamp: uint_param(params, "timestamp")?,
            total_staked: uint_param(params, "totalStaked")?,
        }),
        other => {
            return Err(IndexerError::EventParsing(format!(
                "Unsupported event {}",
                other
            )))
        }
    };
    Ok(event)
}

fn find_param<'a>(params: &'a [LogParam], name: &str) -> IndexerResult<&'a Token> {
    params
        .iter()
        .find(|p| p.name == name)
        .map(|p| &p.value)
        .ok_or_else(|| IndexerError::malformed(format!("params.{}", name)))
}

fn uint_param(params: &[LogParam], name: &str) -> IndexerResult<U256> {
    find_param(params, name)?
        .clone()
        .into_uint()
        .ok_or_else(|| IndexerError::malformed(format!("params.{}", name)))
}

fn address_param(params: &[LogParam], name: &str) -> IndexerResult<String> {
    find_param(params, name)?
        .clone()
        .into_address()
        .map(|addr| format!("{:?}", addr))
        .ok_or_else(|| IndexerError::malformed(format!("params.{}", name)))
}

/// Events emitted by the staking contract
pub const STAKING_EVENTS_ABI: &str = r#"[
  {
    "anonymous": false,
    "inputs": [
      {"indexed": true, "name": "stakingToken", "type": "address"},
      {"indexed": false, "name": "initialRewardRate", "type": "uint256"}
    ],
    "name": "StakingInitialized",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": true, "name": "user", "type": "address"},
      {"indexed": false, "name": "amount", "type": "uint256"},
      {"indexed": false, "name": "timestamp", "type": "uint256"},
      {"indexed": false, "name": "newTotalStaked", "type": "uint256"},
      {"indexed": false, "name": "currentRewardRate", "type": "uint256"}
    ],
    "name": "Staked",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": true, "name": "user", "type": "address"},
      {"indexed": false, "name": "amount", "type": "uint256"},
      {"indexed": false, "name": "timestamp", "type": "uint256"},
      {"indexed": false, "name": "newTotalStaked", "type": "uint256"},
      {"indexed": false, "name": "currentRewardRate", "type": "uint256"},
      {"indexed": false, "name": "rewardsAccrued", "type": "uint256"}
    ],
    "name": "Withdrawn",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": true, "name": "user", "type": "address"},
      {"indexed": false, "name": "amount", "type": "uint256"},
      {"indexed": false, "name": "timestamp", "type": "uint256"},
      {"indexed": false, "name": "newPendingRewards", "type": "uint256"},
      {"indexed": false, "name": "totalStaked", "type": "uint256"}
    ],
    "name": "RewardsClaimed",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": true, "name": "user", "type": "address"},
      {"indexed": false, "name": "amount", "type": "uint256"},
      {"indexed": false, "name": "penalty", "type": "uint256"},
      {"indexed": false, "name": "timestamp", "type": "uint256"},
      {"indexed": false, "name": "newTotalStaked", "type": "uint256"}
    ],
    "name": "EmergencyWithdrawn",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": false, "name": "oldRate", "type": "uint256"},
      {"indexed": false, "name": "newRate", "type": "uint256"},
      {"indexed": false, "name": "timestamp", "type": "uint256"},
      {"indexed": false, "name": "totalStaked", "type": "uint256"}
    ],
    "name": "RewardRateUpdated",
    "type": "event"
  }
]"#;

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::encode;

    fn staking_address() -> Address {
        Address::repeat_byte(0x5a)
    }

    fn signature(name: &str) -> H256 {
        let abi: Abi = serde_json::from_str(STAKING_EVENTS_ABI).unwrap();
        abi.event(name).unwrap().signature()
    }

    fn staked_log(user: Address) -> Log {
        Log {
            address: staking_address(),
            topics: vec![signature("Staked"), H256::from(user)],
            data: encode(&[
                Token::Uint(U256::from(100)),
                Token::Uint(U256::from(1_000)),
                Token::Uint(U256::from(150)),
                Token::Uint(U256::from(500)),
            ])
            .into(),
            block_number: Some(U64::from(42)),
            transaction_hash: Some(H256::repeat_byte(0xab)),
            log_index: Some(U256::from(3)),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_staked_log() {
        let parser = EventParser::new(staking_address()).unwrap();
        let user = Address::repeat_byte(0x11);

        let event = parser
            .parse_log(&staked_log(user), 1_050)
            .unwrap()
            .expect("staking log");

        assert_eq!(event.meta.block_number, 42);
        assert_eq!(event.meta.log_index, 3);
        assert_eq!(event.meta.block_timestamp, 1_050);
        assert_eq!(event.meta.transaction_hash, format!("{:?}", H256::repeat_byte(0xab)));
        match event.event {
            StakingEvent::Staked(staked) => {
                assert_eq!(staked.user, format!("{:?}", user));
                assert_eq!(staked.amount, U256::from(100));
                assert_eq!(staked.new_total_staked, U256::from(150));
                assert_eq!(staked.current_reward_rate, U256::from(500));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_skips_foreign_contract_and_unknown_topic() {
        let parser = EventParser::new(staking_address()).unwrap();

        let mut log = staked_log(Address::repeat_byte(0x11));
        log.address = Address::repeat_byte(0x01);
        assert!(parser.parse_log(&log, 0).unwrap().is_none());

        let mut log = staked_log(Address::repeat_byte(0x11));
        log.topics[0] = H256::repeat_byte(0xee);
        assert!(parser.parse_log(&log, 0).unwrap().is_none());

        let mut log = staked_log(Address::repeat_byte(0x11));
        log.removed = Some(true);
        assert!(parser.parse_log(&log, 0).unwrap().is_none());
    }

    #[test]
    fn test_missing_metadata_is_malformed() {
        let parser = EventParser::new(staking_address()).unwrap();

        let mut log = staked_log(Address::repeat_byte(0x11));
        log.log_index = None;
        assert!(matches!(
            parser.parse_log(&log, 0),
            Err(IndexerError::MalformedEvent { .. })
        ));

        let mut log = staked_log(Address::repeat_byte(0x11));
        log.transaction_hash = None;
        assert!(matches!(
            parser.parse_log(&log, 0),
            Err(IndexerError::MalformedEvent { .. })
        ));
    }

    #[test]
    fn test_truncated_data_fails_to_decode() {
        let parser = EventParser::new(staking_address()).unwrap();
        let mut log = staked_log(Address::repeat_byte(0x11));
        log.data = encode(&[Token::Uint(U256::from(1))]).into();
        assert!(matches!(
            parser.parse_log(&log, 0),
            Err(IndexerError::EventParsing(_))
        ));
    }

    #[test]
    fn test_topics_cover_all_events() {
        let parser = EventParser::new(staking_address()).unwrap();
        assert_eq!(parser.topics().len(), 6);
    }
}
