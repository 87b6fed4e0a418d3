pub mod channel;
pub mod constants;
pub mod driver;
pub mod executor;
pub mod interrupt;
pub mod node;
pub mod scheduler;
pub mod send;
pub mod task;
pub mod writes;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use skein_checkpoint::prelude::{
        Checkpoint, CheckpointConfigExt, CheckpointStore, ChannelVersion, MemoryCheckpointStore,
        PendingWrite, SqliteCheckpointStore, VersionGenerator,
    };
    pub use skein_core::prelude::{
        CachePolicy, ChannelError, ExecutionError, Result, RetryPolicy, RunConfig, SkeinError,
    };

    pub use crate::channel::{
        AggregateOp, BinaryOperatorAggregate, Channel, ChannelMap, ChannelSpec, EphemeralValue,
        LastValue, SendQueue, Topic,
    };
    pub use crate::constants::{END, ERROR, INTERRUPT, NO_WRITES, RESUME, SENDS, START, TAG_HIDDEN};
    pub use crate::driver::{Driver, RunOutcome, StateSnapshot};
    pub use crate::interrupt::{should_interrupt, InterruptNodes, PendingInterrupt};
    pub use crate::node::{InputSource, Node, NodeFn, NodeOutput, NodeRegistry, NodeSpec, TaskContext};
    pub use crate::scheduler::{prepare_next_tasks, SchedulerContext};
    pub use crate::send::SendPacket;
    pub use crate::task::{ExecutableTask, PathSegment, PreparedTask, TaskDescriptor, TaskPath};
    pub use crate::writes::{apply_writes, triggers_next_step};
}
