use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use skein_core::error::Result;

use crate::store::CheckpointStore;
use crate::types::{Checkpoint, CheckpointTuple, PendingWrite};

/// In-memory checkpoint store for testing and short-lived runs.
///
/// Thread-safe via `RwLock`. All data is lost when the store is dropped.
pub struct MemoryCheckpointStore {
    /// Map: thread_id -> Vec<Checkpoint> (ordered by step).
    checkpoints: RwLock<HashMap<String, Vec<Checkpoint>>>,
    /// Map: (thread_id, checkpoint_id) -> recorded writes.
    writes: RwLock<HashMap<(String, Uuid), Vec<PendingWrite>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
            writes: RwLock::new(HashMap::new()),
        }
    }

    fn writes_for(&self, thread_id: &str, checkpoint_id: Uuid) -> Vec<PendingWrite> {
        self.writes
            .read()
            .unwrap()
            .get(&(thread_id.to_string(), checkpoint_id))
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut data = self.checkpoints.write().unwrap();
        let thread = data.entry(checkpoint.thread_id.clone()).or_default();

        // Replace if same id exists, otherwise append
        if let Some(pos) = thread.iter().position(|cp| cp.id == checkpoint.id) {
            thread[pos] = checkpoint;
        } else {
            thread.push(checkpoint);
        }

        // Keep sorted by step
        thread.sort_by_key(|cp| cp.step);
        Ok(())
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        checkpoint_id: Uuid,
        writes: Vec<PendingWrite>,
    ) -> Result<()> {
        let mut data = self.writes.write().unwrap();
        let entry = data
            .entry((thread_id.to_string(), checkpoint_id))
            .or_default();
        for write in writes {
            if let Some(pos) = entry
                .iter()
                .position(|w| w.task_id == write.task_id && w.channel == write.channel)
            {
                entry[pos] = write;
            } else {
                entry.push(write);
            }
        }
        Ok(())
    }

    async fn get(&self, thread_id: &str, checkpoint_id: Uuid) -> Result<Option<CheckpointTuple>> {
        let data = self.checkpoints.read().unwrap();
        let checkpoint = data
            .get(thread_id)
            .and_then(|thread| thread.iter().find(|cp| cp.id == checkpoint_id).cloned());
        Ok(checkpoint.map(|checkpoint| CheckpointTuple {
            pending_writes: self.writes_for(thread_id, checkpoint.id),
            checkpoint,
        }))
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<CheckpointTuple>> {
        let data = self.checkpoints.read().unwrap();
        let checkpoint = data.get(thread_id).and_then(|thread| thread.last().cloned());
        Ok(checkpoint.map(|checkpoint| CheckpointTuple {
            pending_writes: self.writes_for(thread_id, checkpoint.id),
            checkpoint,
        }))
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let data = self.checkpoints.read().unwrap();
        Ok(data.get(thread_id).cloned().unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.checkpoints.write().unwrap().remove(thread_id);
        self.writes
            .write()
            .unwrap()
            .retain(|(thread, _), _| thread != thread_id);
        Ok(())
    }
}
