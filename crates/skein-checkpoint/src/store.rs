use async_trait::async_trait;
use uuid::Uuid;

use skein_core::error::Result;

use crate::types::{Checkpoint, CheckpointTuple, PendingWrite};

/// Async storage backend for checkpoints and pending writes.
///
/// The engine calls `put` once per completed step and `put_writes` as
/// task outcomes settle; it never reads mid-step. Implementations must
/// be thread-safe (`Send + Sync`).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a checkpoint. If a checkpoint with the same id exists on the
    /// thread, it is overwritten.
    async fn put(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Record writes against a checkpoint. A write for an already-recorded
    /// `(task_id, channel)` pair replaces the previous value.
    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: Uuid,
        writes: Vec<PendingWrite>,
    ) -> Result<()>;

    /// Retrieve a checkpoint and its pending writes by thread and id.
    async fn get(&self, thread_id: &str, checkpoint_id: Uuid) -> Result<Option<CheckpointTuple>>;

    /// Retrieve the latest (highest-step) checkpoint for a thread.
    async fn get_latest(&self, thread_id: &str) -> Result<Option<CheckpointTuple>>;

    /// List all checkpoints for a thread, ordered by step (ascending).
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;

    /// Delete all checkpoints and writes for a given thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
