use serde_json::json;

use skein_core::config::RunConfig;

/// Config key constants for checkpoint-related configuration.
pub mod config_keys {
    pub const THREAD_ID: &str = "thread_id";
    pub const CHECKPOINT_ID: &str = "checkpoint_id";
}

/// Extension trait for `RunConfig` to address a thread and checkpoint.
pub trait CheckpointConfigExt {
    fn with_thread_id(self, thread_id: impl Into<String>) -> Self;
    fn with_checkpoint_id(self, checkpoint_id: impl Into<String>) -> Self;
    fn thread_id(&self) -> Option<String>;
    fn checkpoint_id(&self) -> Option<String>;
}

impl CheckpointConfigExt for RunConfig {
    fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.configurable
            .insert(config_keys::THREAD_ID.into(), json!(thread_id.into()));
        self
    }

    fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.configurable.insert(
            config_keys::CHECKPOINT_ID.into(),
            json!(checkpoint_id.into()),
        );
        self
    }

    fn thread_id(&self) -> Option<String> {
        self.configurable
            .get(config_keys::THREAD_ID)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    fn checkpoint_id(&self) -> Option<String> {
        self.configurable
            .get(config_keys::CHECKPOINT_ID)
            .and_then(|v| v.as_str())
            .map(String::from)
    }
}
