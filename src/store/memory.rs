//! In-process store for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::traits::{Checkpoint, CheckpointStore, DedupStore, RunHistory, lease_cutoff};
use crate::workflow::state::RunState;

#[derive(Default)]
pub struct InMemoryStore {
    ingested: RwLock<HashMap<String, DateTime<Utc>>>,
    claims: RwLock<HashMap<String, DateTime<Utc>>>,
    checkpoints: RwLock<HashMap<Uuid, Checkpoint>>,
    history: RwLock<HashMap<Uuid, RunState>>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `DatabaseError::Query` until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, op: &str) -> Result<(), DatabaseError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query(format!("{op}: store unavailable")));
        }
        Ok(())
    }

    pub async fn ingested_count(&self) -> usize {
        self.ingested.read().await.len()
    }
}

#[async_trait]
impl DedupStore for InMemoryStore {
    async fn is_ingested(&self, message_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.ingested.read().await.contains_key(message_id))
    }

    async fn record_ingested(&self, message_id: &str) -> Result<bool, DatabaseError> {
        self.check_writable("record_ingested")?;
        let mut ingested = self.ingested.write().await;
        if ingested.contains_key(message_id) {
            return Ok(false);
        }
        ingested.insert(message_id.to_string(), Utc::now());
        Ok(true)
    }

    async fn claim(&self, message_id: &str, lease: Duration) -> Result<bool, DatabaseError> {
        self.check_writable("claim")?;
        let now = Utc::now();
        let mut claims = self.claims.write().await;
        if let Some(claimed_at) = claims.get(message_id)
            && *claimed_at > lease_cutoff(now, lease)
        {
            return Ok(false);
        }
        claims.insert(message_id.to_string(), now);
        Ok(true)
    }

    async fn release(&self, message_id: &str) -> Result<(), DatabaseError> {
        self.check_writable("release")?;
        self.claims.write().await.remove(message_id);
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
        self.check_writable("save_checkpoint")?;
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.run_id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<Checkpoint>, DatabaseError> {
        Ok(self.checkpoints.read().await.get(&run_id).cloned())
    }

    async fn delete(&self, run_id: Uuid) -> Result<(), DatabaseError> {
        self.check_writable("delete_checkpoint")?;
        self.checkpoints.write().await.remove(&run_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, DatabaseError> {
        let mut all: Vec<Checkpoint> = self.checkpoints.read().await.values().cloned().collect();
        all.sort_by_key(|c| c.suspended_at);
        Ok(all)
    }
}

#[async_trait]
impl RunHistory for InMemoryStore {
    async fn record_terminal(&self, state: &RunState) -> Result<(), DatabaseError> {
        self.check_writable("record_terminal")?;
        self.history
            .write()
            .await
            .insert(state.run_id, state.clone());
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<RunState>, DatabaseError> {
        Ok(self.history.read().await.get(&run_id).cloned())
    }
}
