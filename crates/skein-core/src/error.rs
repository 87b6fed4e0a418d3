use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the Skein engine.
#[derive(Debug, Error)]
pub enum SkeinError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by channels and the write applier.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Read attempted on a channel that has never been written, or whose
    /// value was already consumed.
    #[error("channel is empty")]
    Empty,

    /// An update violated the channel's arity or guard contract, e.g. two
    /// concurrent writers to a single-writer channel.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
}

/// Errors raised while scheduling or running tasks.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Recursion limit ({limit}) exceeded")]
    RecursionLimit { limit: usize },

    #[error("Node '{node}' failed in task {task_id}: {source}")]
    Task {
        node: String,
        task_id: Uuid,
        source: Box<SkeinError>,
    },

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),
}

/// Errors raised by checkpoint stores.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, SkeinError>;
