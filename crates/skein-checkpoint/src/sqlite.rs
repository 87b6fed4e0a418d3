use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use skein_core::error::{CheckpointError, Result};

use crate::store::CheckpointStore;
use crate::types::{Checkpoint, CheckpointMetadata, CheckpointTuple, PendingWrite};
use crate::version::ChannelVersion;

/// SQLite-backed checkpoint store for durable persistence.
///
/// Thread-safe via `Arc<Mutex<Connection>>`. All SQLite operations are
/// dispatched to a blocking thread via `tokio::task::spawn_blocking`.
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Open (or create) a SQLite database at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CheckpointError::Storage(format!("failed to open database: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CheckpointError::Storage(format!("failed to open in-memory db: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                parent_id TEXT,
                step INTEGER NOT NULL,
                channel_values TEXT NOT NULL,
                channel_versions TEXT NOT NULL,
                versions_seen TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_thread
                ON checkpoints(thread_id, step);
            CREATE TABLE IF NOT EXISTS checkpoint_writes (
                thread_id TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (thread_id, checkpoint_id, task_id, channel)
            );",
        )
        .map_err(|e| CheckpointError::Storage(format!("failed to create tables: {e}")))?;
        Ok(())
    }
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    let id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let parent_id: Option<String> = row.get(2)?;
    let step: i64 = row.get(3)?;
    let channel_values_json: String = row.get(4)?;
    let channel_versions_json: String = row.get(5)?;
    let versions_seen_json: String = row.get(6)?;
    let metadata_json: String = row.get(7)?;
    let created_at_str: String = row.get(8)?;

    let channel_values: HashMap<String, Value> =
        serde_json::from_str(&channel_values_json).unwrap_or_default();
    let channel_versions: HashMap<String, ChannelVersion> =
        serde_json::from_str(&channel_versions_json).unwrap_or_default();
    let versions_seen: HashMap<String, HashMap<String, ChannelVersion>> =
        serde_json::from_str(&versions_seen_json).unwrap_or_default();
    let metadata: CheckpointMetadata =
        serde_json::from_str(&metadata_json).unwrap_or(CheckpointMetadata {
            source: "unknown".into(),
            step: step as usize,
        });
    let created_at: DateTime<Utc> = created_at_str.parse().unwrap_or_else(|_| Utc::now());

    Ok(Checkpoint {
        id: Uuid::parse_str(&id).unwrap_or(Uuid::nil()),
        thread_id,
        parent_id: parent_id.and_then(|p| Uuid::parse_str(&p).ok()),
        step: step as usize,
        channel_values,
        channel_versions,
        versions_seen,
        metadata,
        created_at,
    })
}

fn row_to_write(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingWrite> {
    let task_id: String = row.get(0)?;
    let channel: String = row.get(1)?;
    let value_json: String = row.get(2)?;
    Ok(PendingWrite {
        task_id: Uuid::parse_str(&task_id).unwrap_or(Uuid::nil()),
        channel,
        value: serde_json::from_str(&value_json).unwrap_or(Value::Null),
    })
}

fn load_writes(
    conn: &Connection,
    thread_id: &str,
    checkpoint_id: Uuid,
) -> std::result::Result<Vec<PendingWrite>, CheckpointError> {
    let mut stmt = conn
        .prepare(
            "SELECT task_id, channel, value FROM checkpoint_writes
             WHERE thread_id = ?1 AND checkpoint_id = ?2
             ORDER BY task_id, channel",
        )
        .map_err(|e| CheckpointError::Storage(format!("prepare writes query: {e}")))?;
    let writes = stmt
        .query_map(params![thread_id, checkpoint_id.to_string()], row_to_write)
        .map_err(|e| CheckpointError::Storage(format!("query writes: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CheckpointError::Storage(format!("read writes: {e}")))?;
    Ok(writes)
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        tracing::debug!(
            thread_id = %checkpoint.thread_id,
            step = checkpoint.step,
            "storing checkpoint"
        );
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> std::result::Result<(), CheckpointError> {
            let conn = conn.lock().unwrap();
            let channel_values = serde_json::to_string(&checkpoint.channel_values)
                .map_err(|e| CheckpointError::Storage(format!("serialize channel_values: {e}")))?;
            let channel_versions = serde_json::to_string(&checkpoint.channel_versions)
                .map_err(|e| CheckpointError::Storage(format!("serialize channel_versions: {e}")))?;
            let versions_seen = serde_json::to_string(&checkpoint.versions_seen)
                .map_err(|e| CheckpointError::Storage(format!("serialize versions_seen: {e}")))?;
            let metadata = serde_json::to_string(&checkpoint.metadata)
                .map_err(|e| CheckpointError::Storage(format!("serialize metadata: {e}")))?;

            conn.execute(
                "INSERT OR REPLACE INTO checkpoints
                    (id, thread_id, parent_id, step, channel_values, channel_versions,
                     versions_seen, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    checkpoint.id.to_string(),
                    checkpoint.thread_id,
                    checkpoint.parent_id.map(|p| p.to_string()),
                    checkpoint.step as i64,
                    channel_values,
                    channel_versions,
                    versions_seen,
                    metadata,
                    checkpoint.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| CheckpointError::Storage(format!("insert checkpoint: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| CheckpointError::Storage(format!("blocking task failed: {e}")))??;
        Ok(())
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: Uuid,
        writes: Vec<PendingWrite>,
    ) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_string();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), CheckpointError> {
            let conn = conn.lock().unwrap();
            for write in writes {
                let value = serde_json::to_string(&write.value)
                    .map_err(|e| CheckpointError::Storage(format!("serialize write: {e}")))?;
                conn.execute(
                    "INSERT OR REPLACE INTO checkpoint_writes
                        (thread_id, checkpoint_id, task_id, channel, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        thread_id,
                        checkpoint_id.to_string(),
                        write.task_id.to_string(),
                        write.channel,
                        value,
                    ],
                )
                .map_err(|e| CheckpointError::Storage(format!("insert write: {e}")))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| CheckpointError::Storage(format!("blocking task failed: {e}")))??;
        Ok(())
    }

    async fn get(&self, thread_id: &str, checkpoint_id: Uuid) -> Result<Option<CheckpointTuple>> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_string();
        let tuple = tokio::task::spawn_blocking(
            move || -> std::result::Result<Option<CheckpointTuple>, CheckpointError> {
                let conn = conn.lock().unwrap();
                let checkpoint = conn
                    .query_row(
                        "SELECT id, thread_id, parent_id, step, channel_values,
                                channel_versions, versions_seen, metadata, created_at
                         FROM checkpoints WHERE thread_id = ?1 AND id = ?2",
                        params![thread_id, checkpoint_id.to_string()],
                        row_to_checkpoint,
                    )
                    .optional()
                    .map_err(|e| CheckpointError::Storage(format!("query checkpoint: {e}")))?;

                match checkpoint {
                    Some(checkpoint) => {
                        let pending_writes = load_writes(&conn, &thread_id, checkpoint.id)?;
                        Ok(Some(CheckpointTuple {
                            checkpoint,
                            pending_writes,
                        }))
                    }
                    None => Ok(None),
                }
            },
        )
        .await
        .map_err(|e| CheckpointError::Storage(format!("blocking task failed: {e}")))??;
        Ok(tuple)
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<CheckpointTuple>> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_string();
        let tuple = tokio::task::spawn_blocking(
            move || -> std::result::Result<Option<CheckpointTuple>, CheckpointError> {
                let conn = conn.lock().unwrap();
                let checkpoint = conn
                    .query_row(
                        "SELECT id, thread_id, parent_id, step, channel_values,
                                channel_versions, versions_seen, metadata, created_at
                         FROM checkpoints WHERE thread_id = ?1
                         ORDER BY step DESC LIMIT 1",
                        params![thread_id],
                        row_to_checkpoint,
                    )
                    .optional()
                    .map_err(|e| CheckpointError::Storage(format!("query checkpoint: {e}")))?;

                match checkpoint {
                    Some(checkpoint) => {
                        let pending_writes = load_writes(&conn, &thread_id, checkpoint.id)?;
                        Ok(Some(CheckpointTuple {
                            checkpoint,
                            pending_writes,
                        }))
                    }
                    None => Ok(None),
                }
            },
        )
        .await
        .map_err(|e| CheckpointError::Storage(format!("blocking task failed: {e}")))??;
        Ok(tuple)
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_string();
        let list = tokio::task::spawn_blocking(
            move || -> std::result::Result<Vec<Checkpoint>, CheckpointError> {
                let conn = conn.lock().unwrap();
                let mut stmt = conn
                    .prepare(
                        "SELECT id, thread_id, parent_id, step, channel_values,
                                channel_versions, versions_seen, metadata, created_at
                         FROM checkpoints WHERE thread_id = ?1 ORDER BY step ASC",
                    )
                    .map_err(|e| CheckpointError::Storage(format!("prepare list query: {e}")))?;
                let checkpoints = stmt
                    .query_map(params![thread_id], row_to_checkpoint)
                    .map_err(|e| CheckpointError::Storage(format!("query checkpoints: {e}")))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| CheckpointError::Storage(format!("read checkpoints: {e}")))?;
                Ok(checkpoints)
            },
        )
        .await
        .map_err(|e| CheckpointError::Storage(format!("blocking task failed: {e}")))??;
        Ok(list)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let thread_id = thread_id.to_string();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), CheckpointError> {
            let conn = conn.lock().unwrap();
            conn.execute(
                "DELETE FROM checkpoints WHERE thread_id = ?1",
                params![thread_id],
            )
            .map_err(|e| CheckpointError::Storage(format!("delete checkpoints: {e}")))?;
            conn.execute(
                "DELETE FROM checkpoint_writes WHERE thread_id = ?1",
                params![thread_id],
            )
            .map_err(|e| CheckpointError::Storage(format!("delete writes: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| CheckpointError::Storage(format!("blocking task failed: {e}")))??;
        Ok(())
    }
}
