//! libSQL backend for the dedup, checkpoint, and run-history stores.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Checkpoint, CheckpointStore, DedupStore, RunHistory, lease_cutoff};
use crate::workflow::state::{RunState, StepName};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Fixed-width RFC 3339, so stored lease times compare as text.
fn lease_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_step(s: &str) -> Result<StepName, DatabaseError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| DatabaseError::Serialization(format!("unknown step '{s}': {e}")))
}

fn encode_state(state: &RunState) -> Result<String, DatabaseError> {
    serde_json::to_string(state)
        .map_err(|e| DatabaseError::Serialization(format!("run state: {e}")))
}

fn decode_state(raw: &str) -> Result<RunState, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("run state: {e}")))
}

const CHECKPOINT_COLUMNS: &str = "run_id, step, state, suspended_at";

fn row_to_checkpoint(row: &libsql::Row) -> Result<Checkpoint, DatabaseError> {
    let run_id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("checkpoint run_id: {e}")))?;
    let step: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("checkpoint step: {e}")))?;
    let state: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("checkpoint state: {e}")))?;
    let suspended_at: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("checkpoint suspended_at: {e}")))?;

    Ok(Checkpoint {
        run_id: Uuid::parse_str(&run_id)
            .map_err(|e| DatabaseError::Serialization(format!("checkpoint run_id: {e}")))?,
        step: parse_step(&step)?,
        state: decode_state(&state)?,
        suspended_at: parse_datetime(&suspended_at),
    })
}

// ── Dedup ───────────────────────────────────────────────────────────

#[async_trait]
impl DedupStore for LibSqlBackend {
    async fn is_ingested(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM ingested_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_ingested: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("is_ingested: {e}"))),
        }
    }

    async fn record_ingested(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO ingested_messages (message_id, ingested_at) VALUES (?1, ?2)",
                params![message_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_ingested: {e}")))?;
        Ok(inserted == 1)
    }

    async fn claim(&self, message_id: &str, lease: Duration) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let changed = self
            .conn()
            .execute(
                "INSERT INTO ingestion_claims (message_id, claimed_at) VALUES (?1, ?2)
                 ON CONFLICT(message_id) DO UPDATE SET claimed_at = excluded.claimed_at
                 WHERE ingestion_claims.claimed_at <= ?3",
                params![
                    message_id,
                    lease_timestamp(now),
                    lease_timestamp(lease_cutoff(now, lease))
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim: {e}")))?;
        if changed == 0 {
            debug!(message_id, "Ingestion lease held elsewhere");
        }
        Ok(changed == 1)
    }

    async fn release(&self, message_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM ingestion_claims WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release: {e}")))?;
        Ok(())
    }
}

// ── Checkpoints ─────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for LibSqlBackend {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
        let state = encode_state(&checkpoint.state)?;
        self.conn()
            .execute(
                "INSERT INTO checkpoints (run_id, step, state, suspended_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id) DO UPDATE SET step = excluded.step, state = excluded.state, suspended_at = excluded.suspended_at",
                params![
                    checkpoint.run_id.to_string(),
                    checkpoint.step.as_str(),
                    state,
                    checkpoint.suspended_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_checkpoint: {e}")))?;
        debug!(run_id = %checkpoint.run_id, step = %checkpoint.step, "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<Checkpoint>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE run_id = ?1"),
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_checkpoint: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_checkpoint(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_checkpoint: {e}"))),
        }
    }

    async fn delete(&self, run_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM checkpoints WHERE run_id = ?1",
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_checkpoint: {e}")))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints ORDER BY suspended_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_checkpoints: {e}")))?;

        let mut checkpoints = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_checkpoints: {e}")))?
        {
            checkpoints.push(row_to_checkpoint(&row)?);
        }
        Ok(checkpoints)
    }
}

// ── Run history ─────────────────────────────────────────────────────

#[async_trait]
impl RunHistory for LibSqlBackend {
    async fn record_terminal(&self, state: &RunState) -> Result<(), DatabaseError> {
        let encoded = encode_state(state)?;
        self.conn()
            .execute(
                "INSERT INTO run_history (run_id, message_id, status, state, finished_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(run_id) DO UPDATE SET status = excluded.status, state = excluded.state, finished_at = excluded.finished_at",
                params![
                    state.run_id.to_string(),
                    state.message.id.as_str(),
                    state.status.as_str(),
                    encoded,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_terminal: {e}")))?;
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<RunState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT state FROM run_history WHERE run_id = ?1",
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_run_history: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_run_history row: {e}")))?;
                Ok(Some(decode_state(&raw)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_run_history: {e}"))),
        }
    }
}
