//! Persistence traits for ingestion dedup, checkpoints, and run history.
//!
//! Every method maps to a single atomic statement in the libSQL backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::workflow::state::{RunState, StepName};

/// Durable snapshot of a suspended run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub step: StepName,
    pub state: RunState,
    pub suspended_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn of(state: &RunState) -> Self {
        Self {
            run_id: state.run_id,
            step: state.cursor.step().unwrap_or(StepName::HumanReview),
            state: state.clone(),
            suspended_at: Utc::now(),
        }
    }
}

/// Source-message identifiers already ingested, plus short-lived ingestion
/// leases. The ingested set is append-only.
///
/// Pollers sharing a store serialize on `claim`: only the lease holder may
/// check, start and record a message. A lease older than `lease` is treated
/// as abandoned and can be taken over.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn is_ingested(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Record `message_id`. Returns `true` only for the first caller.
    async fn record_ingested(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Take the ingestion lease on `message_id`. Returns `false` while
    /// another holder's lease is live.
    async fn claim(&self, message_id: &str, lease: Duration) -> Result<bool, DatabaseError>;

    /// Drop the lease; a missing lease is not an error.
    async fn release(&self, message_id: &str) -> Result<(), DatabaseError>;
}

/// Cutoff before which a lease taken at `now - lease` counts as abandoned.
pub(crate) fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Suspended runs keyed by run id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError>;

    async fn load(&self, run_id: Uuid) -> Result<Option<Checkpoint>, DatabaseError>;

    /// Remove; a missing entry is not an error.
    async fn delete(&self, run_id: Uuid) -> Result<(), DatabaseError>;

    /// All checkpoints, oldest first.
    async fn list(&self) -> Result<Vec<Checkpoint>, DatabaseError>;
}

/// Final snapshots of completed and failed runs.
#[async_trait]
pub trait RunHistory: Send + Sync {
    async fn record_terminal(&self, state: &RunState) -> Result<(), DatabaseError>;

    async fn get(&self, run_id: Uuid) -> Result<Option<RunState>, DatabaseError>;
}
