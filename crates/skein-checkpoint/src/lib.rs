pub mod config_ext;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod types;
pub mod version;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config_ext::{config_keys, CheckpointConfigExt};
    pub use crate::memory::MemoryCheckpointStore;
    pub use crate::sqlite::SqliteCheckpointStore;
    pub use crate::store::CheckpointStore;
    pub use crate::types::{Checkpoint, CheckpointMetadata, CheckpointTuple, PendingWrite};
    pub use crate::version::{
        hybrid_increment, increment, max_version, ChannelVersion, VersionGenerator,
    };
}
