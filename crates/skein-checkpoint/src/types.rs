use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::version::ChannelVersion;

/// A snapshot of channel state and version bookkeeping at a step boundary.
///
/// Checkpoints are immutable at rest: the driver works on a copy
/// (`child`) and the previous checkpoint is never mutated after it has
/// been persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Logical, monotonic identifier (UUIDv7). Deterministic task ids are
    /// derived from it.
    pub id: Uuid,
    /// Thread (conversation) identifier. Multiple checkpoints share a thread.
    pub thread_id: String,
    /// Parent checkpoint id, forming a linked-list history.
    pub parent_id: Option<Uuid>,
    /// The step number at which this checkpoint was taken.
    pub step: usize,
    /// Snapshot of channel values (channels with nothing to persist are
    /// omitted).
    pub channel_values: HashMap<String, Value>,
    /// Per-channel version token; advances only when the channel's
    /// `update` reported a change.
    pub channel_versions: HashMap<String, ChannelVersion>,
    /// Per node, the channel versions as of the last time that node's
    /// triggers were evaluated.
    pub versions_seen: HashMap<String, HashMap<String, ChannelVersion>>,
    /// Metadata about how the checkpoint was created.
    pub metadata: CheckpointMetadata,
    /// When the checkpoint was created.
    pub created_at: DateTime<Utc>,
}

/// Metadata describing how a checkpoint was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Source of the checkpoint: "input", "loop", or "interrupt".
    pub source: String,
    /// The step number.
    pub step: usize,
}

impl Checkpoint {
    /// Create the empty seed checkpoint for a fresh thread.
    pub fn initial(thread_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            thread_id: thread_id.into(),
            parent_id: None,
            step: 0,
            channel_values: HashMap::new(),
            channel_versions: HashMap::new(),
            versions_seen: HashMap::new(),
            metadata: CheckpointMetadata {
                source: "input".into(),
                step: 0,
            },
            created_at: Utc::now(),
        }
    }

    /// Copy-on-write successor for the next step: fresh id, parent link,
    /// bumped step number, bookkeeping carried over.
    pub fn child(&self, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            thread_id: self.thread_id.clone(),
            parent_id: Some(self.id),
            step: self.step + 1,
            channel_values: self.channel_values.clone(),
            channel_versions: self.channel_versions.clone(),
            versions_seen: self.versions_seen.clone(),
            metadata: CheckpointMetadata {
                source: source.into(),
                step: self.step + 1,
            },
            created_at: Utc::now(),
        }
    }
}

/// A write recorded under a task's deterministic id, persisted alongside
/// the checkpoint so a crashed or interrupted step can resume without
/// re-running tasks that already succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: Uuid,
    pub channel: String,
    pub value: Value,
}

impl PendingWrite {
    pub fn new(task_id: Uuid, channel: impl Into<String>, value: Value) -> Self {
        Self {
            task_id,
            channel: channel.into(),
            value,
        }
    }
}

/// A checkpoint together with the pending writes recorded against it.
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    pub checkpoint: Checkpoint,
    pub pending_writes: Vec<PendingWrite>,
}
