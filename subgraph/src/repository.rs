use crate::error::{IndexerError, IndexerResult};
use crate::events::StreamPosition;
use crate::models::{
    Checkpoint, ContractState, DailyAggregate, EventRecord, GlobalAggregate, RecordQuery,
    UserState,
};
use crate::store::{EntityStore, Lookup, ProjectionBatch};
use async_trait::async_trait;
use ethers::types::U256;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

/// PostgreSQL-backed entity store
#[derive(Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

fn to_numeric(value: &U256) -> String {
    value.to_string()
}

fn numeric(row: &PgRow, column: &str) -> IndexerResult<U256> {
    let text: String = row.try_get(column)?;
    U256::from_dec_str(&text)
        .map_err(|e| IndexerError::Generic(format!("Invalid numeric in {}: {}", column, e)))
}

fn timestamp(row: &PgRow, column: &str) -> IndexerResult<u64> {
    let value: i64 = row.try_get(column)?;
    Ok(value as u64)
}

impl PgEntityStore {
    /// Create a new entity store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> IndexerResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Check the database connection
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn upsert_user(tx: &mut Transaction<'_, Postgres>, user: &UserState) -> IndexerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users
                (id, staked_amount, total_rewards_claimed, total_emergency_withdrawals,
                 last_stake_timestamp, created_at, updated_at)
            VALUES ($1, $2::numeric, $3::numeric, $4::numeric, $5::numeric, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                staked_amount = EXCLUDED.staked_amount,
                total_rewards_claimed = EXCLUDED.total_rewards_claimed,
                total_emergency_withdrawals = EXCLUDED.total_emergency_withdrawals,
                last_stake_timestamp = EXCLUDED.last_stake_timestamp,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&user.id)
        .bind(to_numeric(&user.staked_amount))
        .bind(to_numeric(&user.total_rewards_claimed))
        .bind(to_numeric(&user.total_emergency_withdrawals))
        .bind(to_numeric(&user.last_stake_timestamp))
        .bind(user.created_at as i64)
        .bind(user.updated_at as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_contract(
        tx: &mut Transaction<'_, Postgres>,
        contract: &ContractState,
    ) -> IndexerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO contract_state
                (id, staking_token_address, total_staked, current_reward_rate, initial_apr,
                 min_lock_duration, apr_reduction_per_thousand, emergency_withdraw_penalty,
                 total_rewards, initialized_by, created_at, updated_at)
            VALUES ($1, $2, $3::numeric, $4::numeric, $5::numeric, $6::numeric, $7::numeric,
                    $8::numeric, $9::numeric, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                staking_token_address = EXCLUDED.staking_token_address,
                total_staked = EXCLUDED.total_staked,
                current_reward_rate = EXCLUDED.current_reward_rate,
                initial_apr = EXCLUDED.initial_apr,
                min_lock_duration = EXCLUDED.min_lock_duration,
                apr_reduction_per_thousand = EXCLUDED.apr_reduction_per_thousand,
                emergency_withdraw_penalty = EXCLUDED.emergency_withdraw_penalty,
                total_rewards = EXCLUDED.total_rewards,
                initialized_by = EXCLUDED.initialized_by,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&contract.id)
        .bind(&contract.staking_token_address)
        .bind(to_numeric(&contract.total_staked))
        .bind(to_numeric(&contract.current_reward_rate))
        .bind(to_numeric(&contract.initial_apr))
        .bind(to_numeric(&contract.min_lock_duration))
        .bind(to_numeric(&contract.apr_reduction_per_thousand))
        .bind(to_numeric(&contract.emergency_withdraw_penalty))
        .bind(to_numeric(&contract.total_rewards))
        .bind(&contract.initialized_by)
        .bind(contract.created_at as i64)
        .bind(contract.updated_at as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_global(
        tx: &mut Transaction<'_, Postgres>,
        global: &GlobalAggregate,
    ) -> IndexerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO global_aggregate
                (id, total_staked, total_users, total_stakes, total_withdrawals,
                 total_rewards_claimed, total_emergency_withdrawals, current_reward_rate,
                 last_updated)
            VALUES ($1, $2::numeric, $3::numeric, $4::numeric, $5::numeric, $6::numeric,
                    $7::numeric, $8::numeric, $9)
            ON CONFLICT (id) DO UPDATE SET
                total_staked = EXCLUDED.total_staked,
                total_users = EXCLUDED.total_users,
                total_stakes = EXCLUDED.total_stakes,
                total_withdrawals = EXCLUDED.total_withdrawals,
                total_rewards_claimed = EXCLUDED.total_rewards_claimed,
                total_emergency_withdrawals = EXCLUDED.total_emergency_withdrawals,
                current_reward_rate = EXCLUDED.current_reward_rate,
                last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(&global.id)
        .bind(to_numeric(&global.total_staked))
        .bind(to_numeric(&global.total_users))
        .bind(to_numeric(&global.total_stakes))
        .bind(to_numeric(&global.total_withdrawals))
        .bind(to_numeric(&global.total_rewards_claimed))
        .bind(to_numeric(&global.total_emergency_withdrawals))
        .bind(to_numeric(&global.current_reward_rate))
        .bind(global.last_updated as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_daily(
        tx: &mut Transaction<'_, Postgres>,
        daily: &DailyAggregate,
    ) -> IndexerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_aggregates
                (id, date, total_staked, total_users, total_stakes, total_withdrawals,
                 total_rewards_claimed, total_emergency_withdrawals, average_stake_amount,
                 current_reward_rate)
            VALUES ($1, $2, $3::numeric, $4::numeric, $5::numeric, $6::numeric, $7::numeric,
                    $8::numeric, $9::numeric, $10::numeric)
            ON CONFLICT (id) DO UPDATE SET
                total_staked = EXCLUDED.total_staked,
                total_users = EXCLUDED.total_users,
                total_stakes = EXCLUDED.total_stakes,
                total_withdrawals = EXCLUDED.total_withdrawals,
                total_rewards_claimed = EXCLUDED.total_rewards_claimed,
                total_emergency_withdrawals = EXCLUDED.total_emergency_withdrawals,
                average_stake_amount = EXCLUDED.average_stake_amount,
                current_reward_rate = EXCLUDED.current_reward_rate
            "#,
        )
        .bind(&daily.id)
        .bind(&daily.date)
        .bind(to_numeric(&daily.total_staked))
        .bind(to_numeric(&daily.total_users))
        .bind(to_numeric(&daily.total_stakes))
        .bind(to_numeric(&daily.total_withdrawals))
        .bind(to_numeric(&daily.total_rewards_claimed))
        .bind(to_numeric(&daily.total_emergency_withdrawals))
        .bind(to_numeric(&daily.average_stake_amount))
        .bind(to_numeric(&daily.current_reward_rate))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Records are write-once: a conflicting id is left as stored
    async fn insert_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &EventRecord,
    ) -> IndexerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO event_records
                (id, kind, user_address, transaction_hash, block_number, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id())
        .bind(record.kind().as_str())
        .bind(record.user())
        .bind(record.transaction_hash())
        .bind(record.block_number() as i64)
        .bind(serde_json::to_value(record)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn save_checkpoint(
        tx: &mut Transaction<'_, Postgres>,
        checkpoint: &Checkpoint,
    ) -> IndexerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoint (id, block_number, log_index, updated_at)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                block_number = EXCLUDED.block_number,
                log_index = EXCLUDED.log_index,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(checkpoint.position.block_number as i64)
        .bind(checkpoint.position.log_index as i64)
        .bind(checkpoint.updated_at as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn user_from_row(row: &PgRow) -> IndexerResult<UserState> {
    Ok(UserState {
        id: row.try_get("id")?,
        staked_amount: numeric(row, "staked_amount")?,
        total_rewards_claimed: numeric(row, "total_rewards_claimed")?,
        total_emergency_withdrawals: numeric(row, "total_emergency_withdrawals")?,
        last_stake_timestamp: numeric(row, "last_stake_timestamp")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

fn contract_from_row(row: &PgRow) -> IndexerResult<ContractState> {
    Ok(ContractState {
        id: row.try_get("id")?,
        staking_token_address: row.try_get("staking_token_address")?,
        total_staked: numeric(row, "total_staked")?,
        current_reward_rate: numeric(row, "current_reward_rate")?,
        initial_apr: numeric(row, "initial_apr")?,
        min_lock_duration: numeric(row, "min_lock_duration")?,
        apr_reduction_per_thousand: numeric(row, "apr_reduction_per_thousand")?,
        emergency_withdraw_penalty: numeric(row, "emergency_withdraw_penalty")?,
        total_rewards: numeric(row, "total_rewards")?,
        initialized_by: row.try_get("initialized_by")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

fn global_from_row(row: &PgRow) -> IndexerResult<GlobalAggregate> {
    Ok(GlobalAggregate {
        id: row.try_get("id")?,
        total_staked: numeric(row, "total_staked")?,
        total_users: numeric(row, "total_users")?,
        total_stakes: numeric(row, "total_stakes")?,
        total_withdrawals: numeric(row, "total_withdrawals")?,
        total_rewards_claimed: numeric(row, "total_rewards_claimed")?,
        total_emergency_withdrawals: numeric(row, "total_emergency_withdrawals")?,
        current_reward_rate: numeric(row, "current_reward_rate")?,
        last_updated: timestamp(row, "last_updated")?,
    })
}

fn daily_from_row(row: &PgRow) -> IndexerResult<DailyAggregate> {
    Ok(DailyAggregate {
        id: row.try_get("id")?,
        date: row.try_get("date")?,
        total_staked: numeric(row, "total_staked")?,
        total_users: numeric(row, "total_users")?,
        total_stakes: numeric(row, "total_stakes")?,
        total_withdrawals: numeric(row, "total_withdrawals")?,
        total_rewards_claimed: numeric(row, "total_rewards_claimed")?,
        total_emergency_withdrawals: numeric(row, "total_emergency_withdrawals")?,
        average_stake_amount: numeric(row, "average_stake_amount")?,
        current_reward_rate: numeric(row, "current_reward_rate")?,
    })
}

fn record_from_row(row: &PgRow) -> IndexerResult<EventRecord> {
    let data: serde_json::Value = row.try_get("data")?;
    Ok(serde_json::from_value(data)?)
}

const DAILY_COLUMNS: &str = "id, date, total_staked::text, total_users::text, \
     total_stakes::text, total_withdrawals::text, total_rewards_claimed::text, \
     total_emergency_withdrawals::text, average_stake_amount::text, current_reward_rate::text";

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn load_user(&self, id: &str) -> IndexerResult<Lookup<UserState>> {
        let row = sqlx::query(
            "SELECT id, staked_amount::text, total_rewards_claimed::text, \
             total_emergency_withdrawals::text, last_stake_timestamp::text, \
             created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose().map(Lookup::from)
    }

    async fn load_contract_state(&self) -> IndexerResult<Lookup<ContractState>> {
        let row = sqlx::query(
            "SELECT id, staking_token_address, total_staked::text, current_reward_rate::text, \
             initial_apr::text, min_lock_duration::text, apr_reduction_per_thousand::text, \
             emergency_withdraw_penalty::text, total_rewards::text, initialized_by, \
             created_at, updated_at \
             FROM contract_state WHERE id = $1",
        )
        .bind(crate::models::CONTRACT_STATE_ID)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(contract_from_row)
            .transpose()
            .map(Lookup::from)
    }

    async fn load_global(&self) -> IndexerResult<Lookup<GlobalAggregate>> {
        let row = sqlx::query(
            "SELECT id, total_staked::text, total_users::text, total_stakes::text, \
             total_withdrawals::text, total_rewards_claimed::text, \
             total_emergency_withdrawals::text, current_reward_rate::text, last_updated \
             FROM global_aggregate WHERE id = $1",
        )
        .bind(crate::models::GLOBAL_AGGREGATE_ID)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(global_from_row).transpose().map(Lookup::from)
    }

    async fn load_daily(&self, date: &str) -> IndexerResult<Lookup<DailyAggregate>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM daily_aggregates WHERE id = $1",
            DAILY_COLUMNS
        ))
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(daily_from_row).transpose().map(Lookup::from)
    }

    async fn load_record(&self, id: &str) -> IndexerResult<Lookup<EventRecord>> {
        let row = sqlx::query("SELECT data FROM event_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose().map(Lookup::from)
    }

    async fn query_records(&self, query: &RecordQuery) -> IndexerResult<Vec<EventRecord>> {
        let mut builder =
            sqlx::QueryBuilder::<Postgres>::new("SELECT data FROM event_records WHERE 1=1");

        if let Some(kind) = query.kind {
            builder.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(ref user) = query.user {
            builder.push(" AND user_address = ").push_bind(user.clone());
        }
        if let Some(ref tx_hash) = query.transaction_hash {
            builder
                .push(" AND transaction_hash = ")
                .push_bind(tx_hash.clone());
        }
        builder
            .push(" ORDER BY seq DESC LIMIT ")
            .push_bind(query.page.limit.max(0))
            .push(" OFFSET ")
            .push_bind(query.page.offset.max(0));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn daily_range(&self, from: &str, to: &str) -> IndexerResult<Vec<DailyAggregate>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM daily_aggregates WHERE id >= $1 AND id <= $2 ORDER BY id",
            DAILY_COLUMNS
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(daily_from_row).collect()
    }

    async fn load_checkpoint(&self) -> IndexerResult<Option<Checkpoint>> {
        let row =
            sqlx::query("SELECT block_number, log_index, updated_at FROM checkpoint WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        row.map(|row| -> IndexerResult<Checkpoint> {
            Ok(Checkpoint {
                position: StreamPosition {
                    block_number: timestamp(&row, "block_number")?,
                    log_index: timestamp(&row, "log_index")?,
                },
                updated_at: timestamp(&row, "updated_at")?,
            })
        })
        .transpose()
    }

    async fn commit(&self, batch: ProjectionBatch) -> IndexerResult<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(ref record) = batch.record {
            Self::insert_record(&mut tx, record).await?;
        }
        if let Some(ref user) = batch.user {
            Self::upsert_user(&mut tx, user).await?;
        }
        if let Some(ref contract) = batch.contract {
            Self::upsert_contract(&mut tx, contract).await?;
        }
        if let Some(ref global) = batch.global {
            Self::upsert_global(&mut tx, global).await?;
        }
        if let Some(ref daily) = batch.daily {
            Self::upsert_daily(&mut tx, daily).await?;
        }
        Self::save_checkpoint(&mut tx, &batch.checkpoint).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reset(&self) -> IndexerResult<()> {
        sqlx::query(
            "TRUNCATE users, contract_state, global_aggregate, daily_aggregates, \
             event_records, checkpoint RESTART IDENTITY",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
