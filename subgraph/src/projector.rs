/// Event projection engine: applies an ordered event stream to an entity store
use crate::error::{IndexerError, IndexerResult};
use crate::events::{IndexedEvent, StakingEvent, StreamPosition};
use crate::handlers;
use crate::store::{EntityStore, Lookup, ProjectionBatch};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to a single event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Writes were committed
    Applied(ProjectionBatch),

    /// The event was already projected; nothing was written
    Duplicate,
}

/// Totals for one `run` over a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub applied: u64,
    pub duplicates: u64,
    pub last_position: Option<StreamPosition>,
}

/// Applies events one at a time, committing each event's writes atomically
/// before reading the next.
pub struct Projector<S: EntityStore + ?Sized> {
    store: Arc<S>,

    /// Position of the last committed event, `None` until loaded
    last_position: Option<StreamPosition>,

    resumed: bool,
}

impl<S: EntityStore + ?Sized> Projector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            last_position: None,
            resumed: false,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Position of the last committed event
    pub fn last_position(&self) -> Option<StreamPosition> {
        self.last_position
    }

    /// Load the persisted checkpoint so ordering is enforced across restarts
    pub async fn resume(&mut self) -> IndexerResult<Option<StreamPosition>> {
        self.last_position = self
            .store
            .load_checkpoint()
            .await?
            .map(|checkpoint| checkpoint.position);
        self.resumed = true;

        if let Some(position) = self.last_position {
            info!(
                "Resuming projection after block {} log {}",
                position.block_number, position.log_index
            );
        }
        Ok(self.last_position)
    }

    /// Forget the cached position, after the store has been reset
    pub fn rewind(&mut self) {
        self.last_position = None;
        self.resumed = true;
    }

    /// Project one event
    pub async fn apply(&mut self, event: &IndexedEvent) -> IndexerResult<Outcome> {
        if !self.resumed {
            self.resume().await?;
        }
        validate(event)?;
        let event = &event.clone().normalized();

        let position = event.meta.position();
        if self.is_duplicate(event, position).await? {
            warn!("Skipping already projected event {}", event);
            return Ok(Outcome::Duplicate);
        }
        if let Some(last) = self.last_position {
            if position <= last {
                return Err(IndexerError::OutOfOrder {
                    last: last.as_tuple(),
                    received: position.as_tuple(),
                });
            }
        }

        let batch = self.project(event).await?;
        self.store.commit(batch.clone()).await?;
        self.last_position = Some(position);

        debug!("Projected {}", event);
        Ok(Outcome::Applied(batch))
    }

    /// Drain `events` in order, stopping at the first error.
    ///
    /// Everything committed before the error stays committed.
    pub async fn run<St>(&mut self, events: St) -> IndexerResult<RunSummary>
    where
        St: Stream<Item = IndexerResult<IndexedEvent>>,
    {
        let mut summary = RunSummary::default();
        futures::pin_mut!(events);

        while let Some(event) = events.next().await {
            let event = event?;
            match self.apply(&event).await? {
                Outcome::Applied(_) => {
                    summary.applied += 1;
                    summary.last_position = Some(event.meta.position());
                }
                Outcome::Duplicate => summary.duplicates += 1,
            }
        }

        Ok(summary)
    }

    /// An event is a redelivery when it sits exactly at the checkpoint, when
    /// its record already exists, or, for an initialization, when the contract
    /// state was written by that same event.
    async fn is_duplicate(
        &self,
        event: &IndexedEvent,
        position: StreamPosition,
    ) -> IndexerResult<bool> {
        if self.last_position == Some(position) {
            return Ok(true);
        }
        let id = event.meta.record_id();
        if matches!(event.event, StakingEvent::StakingInitialized(_)) {
            let contract = self.store.load_contract_state().await?;
            return Ok(matches!(contract, Lookup::Found(c) if c.initialized_by == id));
        }
        let existing = self.store.load_record(&id).await?;
        Ok(matches!(existing, Lookup::Found(_)))
    }

    async fn project(&self, event: &IndexedEvent) -> IndexerResult<ProjectionBatch> {
        let store = self.store.as_ref();
        let meta = &event.meta;
        match &event.event {
            StakingEvent::StakingInitialized(params) => {
                handlers::handle_staking_initialized(store, meta, params).await
            }
            StakingEvent::Staked(params) => handlers::handle_staked(store, meta, params).await,
            StakingEvent::Withdrawn(params) => {
                handlers::handle_withdrawn(store, meta, params).await
            }
            StakingEvent::RewardsClaimed(params) => {
                handlers::handle_rewards_claimed(store, meta, params).await
            }
            StakingEvent::EmergencyWithdrawn(params) => {
                handlers::handle_emergency_withdrawn(store, meta, params).await
            }
            StakingEvent::RewardRateUpdated(params) => {
                handlers::handle_reward_rate_updated(store, meta, params).await
            }
        }
    }
}

/// Reject events missing identity fields before anything is read or written
fn validate(event: &IndexedEvent) -> IndexerResult<()> {
    if event.meta.transaction_hash.trim().is_empty() {
        return Err(IndexerError::malformed("transaction.hash"));
    }
    match &event.event {
        StakingEvent::StakingInitialized(params) if params.staking_token.trim().is_empty() => {
            Err(IndexerError::malformed("params.stakingToken"))
        }
        other => match other.user() {
            Some(user) if user.trim().is_empty() => Err(IndexerError::malformed("params.user")),
            _ => Ok(()),
        },
    }
}
