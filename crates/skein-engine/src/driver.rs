use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use skein_checkpoint::config_ext::CheckpointConfigExt;
use skein_checkpoint::store::CheckpointStore;
use skein_checkpoint::types::{Checkpoint, PendingWrite};
use skein_checkpoint::version::{increment, VersionGenerator};
use skein_core::config::RunConfig;
use skein_core::error::{CheckpointError, ExecutionError, Result, SkeinError};

use crate::channel::{channels_from_checkpoint, ChannelMap, ChannelSpec};
use crate::constants::{is_reserved, ERROR, INPUT, INTERRUPT, RESUME, SENDS, START};
use crate::executor::{error_message, execute_tasks};
use crate::interrupt::{mark_interrupt_seen, should_interrupt, InterruptNodes, PendingInterrupt};
use crate::node::NodeRegistry;
use crate::scheduler::{prepare_next_tasks, SchedulerContext};
use crate::task::{ExecutableTask, PreparedTask, TaskDescriptor, WriteBatch};
use crate::writes::apply_writes;

/// How a run ended, short of an error.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The run completed; final state assembled from the output channels.
    Complete(Value),
    /// The run paused for external input. Resume from the checkpoint id
    /// with a `{task_id -> value}` map.
    Interrupted {
        checkpoint_id: Uuid,
        interrupts: Vec<PendingInterrupt>,
    },
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunOutcome::Complete(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunOutcome::Interrupted { .. })
    }

    /// Extract the final state value (interrupted runs have none).
    pub fn into_value(self) -> Option<Value> {
        match self {
            RunOutcome::Complete(value) => Some(value),
            RunOutcome::Interrupted { .. } => None,
        }
    }
}

/// A point-in-time view of a thread's state, for history inspection.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub checkpoint_id: Uuid,
    pub step: usize,
    pub values: HashMap<String, Value>,
}

/// The step driver: repeatedly prepare tasks, execute them, apply their
/// writes, checkpoint, and check for interrupts, until no tasks remain
/// or a limit or interrupt stops the run.
pub struct Driver {
    registry: NodeRegistry,
    channel_specs: HashMap<String, ChannelSpec>,
    output_channels: Option<Vec<String>>,
    store: Arc<dyn CheckpointStore>,
    version_gen: VersionGenerator,
    interrupt_before: InterruptNodes,
    interrupt_after: InterruptNodes,
}

impl Driver {
    pub fn new(
        registry: NodeRegistry,
        channel_specs: HashMap<String, ChannelSpec>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            registry,
            channel_specs,
            output_channels: None,
            store,
            version_gen: Arc::new(increment),
            interrupt_before: InterruptNodes::none(),
            interrupt_after: InterruptNodes::none(),
        }
    }

    /// Restrict the final output to the named channels. Default: every
    /// non-reserved channel with a value.
    pub fn with_output_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_version_generator(mut self, version_gen: VersionGenerator) -> Self {
        self.version_gen = version_gen;
        self
    }

    /// Pause before executing a step that schedules any of these nodes.
    pub fn with_interrupt_before(mut self, nodes: InterruptNodes) -> Self {
        self.interrupt_before = nodes;
        self
    }

    /// Pause after completing a step that ran any of these nodes.
    pub fn with_interrupt_after(mut self, nodes: InterruptNodes) -> Self {
        self.interrupt_after = nodes;
        self
    }

    /// Run the graph with the given input. An object input seeds the
    /// channels named by its keys. Continues from the thread's latest
    /// checkpoint when one exists.
    pub async fn run(&self, input: Value, config: &RunConfig) -> Result<RunOutcome> {
        self.run_loop(Some(input), config).await
    }

    /// Re-enter an interrupted or failed run. `resume` maps interrupted
    /// task ids to the values their nodes should continue with; an empty
    /// map replays the pending step as-is (crash recovery).
    pub async fn resume(
        &self,
        resume: HashMap<Uuid, Value>,
        config: &RunConfig,
    ) -> Result<RunOutcome> {
        let thread_id = self.thread_id(config);
        let tuple = self
            .load_checkpoint(&thread_id, config)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(thread_id.clone()))?;

        let writes: Vec<PendingWrite> = resume
            .into_iter()
            .map(|(task_id, value)| PendingWrite::new(task_id, RESUME, value))
            .collect();
        if !writes.is_empty() {
            self.store
                .put_writes(&thread_id, tuple.checkpoint.id, writes)
                .await?;
        }

        self.run_loop(None, config).await
    }

    /// What would run next for this thread, without building execution
    /// contexts or running anything.
    pub async fn next_tasks(&self, thread_id: &str) -> Result<Vec<TaskDescriptor>> {
        let Some(tuple) = self.store.get_latest(thread_id).await? else {
            return Ok(Vec::new());
        };
        let channels = channels_from_checkpoint(&self.channel_specs, &tuple.checkpoint)?;
        let scheduler_writes = scheduler_writes(&tuple.pending_writes);
        let ctx = SchedulerContext {
            step: tuple.checkpoint.step,
            checkpoint_ns: "",
            for_execution: false,
            updated_channels: None,
            trigger_to_nodes: None,
        };
        let mut descriptors: Vec<TaskDescriptor> = prepare_next_tasks(
            &tuple.checkpoint,
            &scheduler_writes,
            &self.registry,
            &channels,
            &ctx,
        )
        .into_values()
        .filter_map(|task| match task {
            PreparedTask::Descriptor(descriptor) => Some(descriptor),
            PreparedTask::Executable(_) => None,
        })
        .collect();
        descriptors.sort_by_key(|d| d.path.sort_key());
        Ok(descriptors)
    }

    /// Per-checkpoint state snapshots for a thread, oldest first.
    pub async fn history(&self, thread_id: &str) -> Result<Vec<StateSnapshot>> {
        let checkpoints = self.store.list(thread_id).await?;
        Ok(checkpoints
            .into_iter()
            .map(|cp| StateSnapshot {
                checkpoint_id: cp.id,
                step: cp.step,
                values: cp
                    .channel_values
                    .into_iter()
                    .filter(|(name, _)| !is_reserved(name) && name != SENDS)
                    .collect(),
            })
            .collect())
    }

    fn thread_id(&self, config: &RunConfig) -> String {
        config
            .thread_id()
            .unwrap_or_else(|| config.run_id.to_string())
    }

    async fn load_checkpoint(
        &self,
        thread_id: &str,
        config: &RunConfig,
    ) -> Result<Option<skein_checkpoint::types::CheckpointTuple>> {
        match config.checkpoint_id() {
            Some(id_str) => {
                let id = Uuid::parse_str(&id_str)
                    .map_err(|_| CheckpointError::NotFound(id_str.clone()))?;
                let tuple = self
                    .store
                    .get(thread_id, id)
                    .await?
                    .ok_or(CheckpointError::NotFound(id_str))?;
                Ok(Some(tuple))
            }
            None => self.store.get_latest(thread_id).await,
        }
    }

    async fn run_loop(&self, input: Option<Value>, config: &RunConfig) -> Result<RunOutcome> {
        let thread_id = self.thread_id(config);
        let (mut checkpoint, mut pending_writes) =
            match self.load_checkpoint(&thread_id, config).await? {
                Some(tuple) => (tuple.checkpoint, tuple.pending_writes),
                None => (Checkpoint::initial(&thread_id), Vec::new()),
            };
        let mut channels = channels_from_checkpoint(&self.channel_specs, &checkpoint)?;
        let trigger_map = self.registry.trigger_to_nodes();

        let mut updated_channels: Option<HashSet<String>> = None;

        if let Some(input) = input {
            let writes = input_writes(&input, &channels);
            if !writes.is_empty() {
                let mut seed = [WriteBatch::new(INPUT, writes)];
                let updated = apply_writes(
                    &mut checkpoint,
                    &mut channels,
                    &mut seed,
                    &self.version_gen,
                    Some(&trigger_map),
                )?;
                updated_channels = Some(updated);
                checkpoint.channel_values = snapshot_channels(&channels);
                self.store.put(checkpoint.clone()).await?;
            }
        }

        for _ in 0..config.recursion_limit {
            let scheduler_writes = scheduler_writes(&pending_writes);
            let ctx = SchedulerContext {
                step: checkpoint.step,
                checkpoint_ns: "",
                for_execution: true,
                updated_channels: updated_channels.as_ref(),
                trigger_to_nodes: Some(&trigger_map),
            };
            let prepared = prepare_next_tasks(
                &checkpoint,
                &scheduler_writes,
                &self.registry,
                &channels,
                &ctx,
            );
            if prepared.is_empty() {
                return Ok(RunOutcome::Complete(self.read_output(&channels)));
            }

            let mut tasks: Vec<ExecutableTask> = prepared
                .into_values()
                .filter_map(|task| match task {
                    PreparedTask::Executable(task) => Some(task),
                    PreparedTask::Descriptor(_) => None,
                })
                .collect();
            tasks.sort_by_key(|t| t.path.sort_key());
            tracing::debug!(step = checkpoint.step, tasks = tasks.len(), "step prepared");

            if should_interrupt(&checkpoint, &self.interrupt_before, &tasks, &self.registry) {
                mark_interrupt_seen(&mut checkpoint);
                checkpoint.metadata.source = "interrupt".into();
                self.store.put(checkpoint.clone()).await?;
                return Ok(RunOutcome::Interrupted {
                    checkpoint_id: checkpoint.id,
                    interrupts: Vec::new(),
                });
            }

            // Tasks that already succeeded at this step (recorded before a
            // crash or pause) get their buffers back; the executor leaves
            // settled tasks alone.
            restore_settled_writes(&mut tasks, &pending_writes);

            execute_tasks(&mut tasks, &self.registry).await;

            // Persist every outcome under the current checkpoint so the
            // step can replay without re-running finished work.
            let outcome_writes: Vec<PendingWrite> = tasks
                .iter()
                .flat_map(|task| {
                    task.writes
                        .iter()
                        .map(|(chan, value)| PendingWrite::new(task.id, chan.clone(), value.clone()))
                })
                .collect();
            self.store
                .put_writes(&thread_id, checkpoint.id, outcome_writes.clone())
                .await?;
            merge_pending(&mut pending_writes, outcome_writes);

            // A captured failure fails the step after all siblings have
            // settled. Nothing is applied, so versions_seen stays put and
            // resume re-runs exactly the failed tasks.
            if let Some((task, value)) = tasks.iter().find_map(|task| {
                task.writes
                    .iter()
                    .find(|(chan, _)| chan == ERROR)
                    .map(|(_, value)| (task, value))
            }) {
                return Err(ExecutionError::Task {
                    node: task.name.clone(),
                    task_id: task.id,
                    source: Box::new(SkeinError::Other(error_message(value))),
                }
                .into());
            }

            // Interrupted tasks pause the run before anything is applied;
            // sibling writes are already recorded for the replay.
            let interrupts: Vec<PendingInterrupt> = tasks
                .iter()
                .flat_map(|task| {
                    task.writes
                        .iter()
                        .filter(|(chan, _)| chan == INTERRUPT)
                        .map(|(_, value)| PendingInterrupt {
                            node: task.name.clone(),
                            task_id: task.id,
                            value: value.clone(),
                        })
                })
                .collect();
            if !interrupts.is_empty() {
                return Ok(RunOutcome::Interrupted {
                    checkpoint_id: checkpoint.id,
                    interrupts,
                });
            }

            let updated = apply_writes(
                &mut checkpoint,
                &mut channels,
                &mut tasks,
                &self.version_gen,
                Some(&trigger_map),
            )?;

            // Commit the step as a fresh checkpoint; the one persisted
            // before the step stays untouched.
            checkpoint = checkpoint.child("loop");
            checkpoint.channel_values = snapshot_channels(&channels);
            pending_writes.clear();

            if should_interrupt(&checkpoint, &self.interrupt_after, &tasks, &self.registry) {
                mark_interrupt_seen(&mut checkpoint);
                checkpoint.metadata.source = "interrupt".into();
                self.store.put(checkpoint.clone()).await?;
                return Ok(RunOutcome::Interrupted {
                    checkpoint_id: checkpoint.id,
                    interrupts: Vec::new(),
                });
            }

            self.store.put(checkpoint.clone()).await?;
            updated_channels = Some(updated);
        }

        Err(ExecutionError::RecursionLimit {
            limit: config.recursion_limit,
        }
        .into())
    }

    fn read_output(&self, channels: &ChannelMap) -> Value {
        let mut map = serde_json::Map::new();
        match &self.output_channels {
            Some(names) => {
                for name in names {
                    if let Some(value) = channels.get(name).and_then(|c| c.get().ok()) {
                        map.insert(name.clone(), value.clone());
                    }
                }
            }
            None => {
                let mut names: Vec<&String> = channels
                    .keys()
                    .filter(|name| !is_reserved(name) && name.as_str() != SENDS)
                    .collect();
                names.sort();
                for name in names {
                    if let Some(value) = channels.get(name).and_then(|c| c.get().ok()) {
                        map.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        Value::Object(map)
    }
}

/// The writes a node's input seeding produces: one per input key naming a
/// declared channel, plus the raw input on the START channel when one is
/// declared.
fn input_writes(input: &Value, channels: &ChannelMap) -> Vec<(String, Value)> {
    let mut writes = Vec::new();
    if let Value::Object(map) = input {
        for (key, value) in map {
            if channels.contains_key(key) {
                writes.push((key.clone(), value.clone()));
            } else {
                tracing::warn!(channel = %key, "ignoring input for undeclared channel");
            }
        }
    }
    if channels.contains_key(START) {
        writes.push((START.to_string(), input.clone()));
    }
    writes
}

/// Only resume values and error captures feed back into scheduling; a
/// task's success writes are replayed through its buffer instead, so the
/// step's apply still covers tasks that finished before a pause.
fn scheduler_writes(pending_writes: &[PendingWrite]) -> Vec<PendingWrite> {
    pending_writes
        .iter()
        .filter(|w| w.channel == RESUME || w.channel == ERROR)
        .cloned()
        .collect()
}

/// Hand previously recorded success writes back to their tasks.
fn restore_settled_writes(tasks: &mut [ExecutableTask], pending_writes: &[PendingWrite]) {
    for task in tasks.iter_mut() {
        let recorded: Vec<(String, Value)> = pending_writes
            .iter()
            .filter(|w| {
                w.task_id == task.id
                    && w.channel != ERROR
                    && w.channel != INTERRUPT
                    && w.channel != RESUME
            })
            .map(|w| (w.channel.clone(), w.value.clone()))
            .collect();
        if !recorded.is_empty() {
            task.writes = recorded;
        }
    }
}

fn snapshot_channels(channels: &ChannelMap) -> HashMap<String, Value> {
    channels
        .iter()
        .filter_map(|(name, channel)| channel.checkpoint().map(|v| (name.clone(), v)))
        .collect()
}

fn merge_pending(pending: &mut Vec<PendingWrite>, new_writes: Vec<PendingWrite>) {
    for write in new_writes {
        if let Some(pos) = pending
            .iter()
            .position(|w| w.task_id == write.task_id && w.channel == write.channel)
        {
            pending[pos] = write;
        } else {
            pending.push(write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use skein_checkpoint::memory::MemoryCheckpointStore;

    use crate::node::{InputSource, NodeFn, NodeOutput, NodeSpec};

    fn store() -> Arc<dyn CheckpointStore> {
        Arc::new(MemoryCheckpointStore::new())
    }

    fn config(thread: &str) -> RunConfig {
        RunConfig::default().with_thread_id(thread)
    }

    /// Two-node pipeline: "b" subscribes to "x" and writes "y".
    fn reader_writer_driver(store: Arc<dyn CheckpointStore>) -> Driver {
        let mut registry = NodeRegistry::new();
        registry
            .add(
                NodeSpec::new(
                    "b",
                    NodeFn::new(|input: Value, _ctx| async move {
                        let x = input.as_i64().unwrap_or(0);
                        Ok(NodeOutput::write("y", json!(x + 1)))
                    }),
                )
                .with_triggers(["x"]),
            )
            .unwrap();

        let specs = HashMap::from([
            ("x".to_string(), ChannelSpec::last_value()),
            ("y".to_string(), ChannelSpec::last_value()),
        ]);
        Driver::new(registry, specs, store)
    }

    #[tokio::test]
    async fn seeded_input_drives_subscriber_to_completion() {
        let driver = reader_writer_driver(store());
        let outcome = driver
            .run(json!({"x": 1}), &config("t1"))
            .await
            .unwrap();

        let value = outcome.into_value().unwrap();
        assert_eq!(value["x"], json!(1));
        assert_eq!(value["y"], json!(2));
    }

    #[tokio::test]
    async fn run_without_matching_input_completes_empty() {
        let driver = reader_writer_driver(store());
        let outcome = driver.run(json!({}), &config("t1")).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.into_value().unwrap(), json!({}));
    }

    #[tokio::test]
    async fn checkpoints_record_each_step() {
        let store = store();
        let driver = reader_writer_driver(store.clone());
        driver.run(json!({"x": 1}), &config("t1")).await.unwrap();

        let history = driver.history("t1").await.unwrap();
        // Seed checkpoint plus one per completed step.
        assert!(history.len() >= 2);
        assert_eq!(history[0].step, 0);
        let last = history.last().unwrap();
        assert_eq!(last.values["y"], json!(2));
    }

    #[tokio::test]
    async fn recursion_limit_fails_a_cycle() {
        // "ping" rewrites its own trigger channel forever.
        let mut registry = NodeRegistry::new();
        registry
            .add(
                NodeSpec::new(
                    "ping",
                    NodeFn::new(|input: Value, _ctx| async move {
                        let n = input.as_i64().unwrap_or(0);
                        Ok(NodeOutput::write("x", json!(n + 1)))
                    }),
                )
                .with_triggers(["x"]),
            )
            .unwrap();
        let specs = HashMap::from([("x".to_string(), ChannelSpec::last_value())]);
        let driver = Driver::new(registry, specs, store());

        let config = config("t1").with_recursion_limit(3);
        let err = driver.run(json!({"x": 0}), &config).await.unwrap_err();
        assert!(err.to_string().contains("Recursion limit"));
    }

    #[tokio::test]
    async fn next_tasks_reports_without_running() {
        let store = store();
        let driver = reader_writer_driver(store.clone());

        // Seed only; interrupt before "b" so the task stays pending.
        let driver = driver.with_interrupt_before(InterruptNodes::nodes(["b"]));
        let outcome = driver.run(json!({"x": 1}), &config("t1")).await.unwrap();
        assert!(outcome.is_interrupted());

        let descriptors = driver.next_tasks("t1").await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "b");
    }

    #[tokio::test]
    async fn map_input_nodes_read_several_channels() {
        let mut registry = NodeRegistry::new();
        registry
            .add(
                NodeSpec::new(
                    "sum",
                    NodeFn::new(|input: Value, _ctx| async move {
                        let total =
                            input["a"].as_i64().unwrap_or(0) + input["b"].as_i64().unwrap_or(0);
                        Ok(NodeOutput::write("total", json!(total)))
                    }),
                )
                .with_triggers(["a", "b"])
                .with_input(InputSource::Map(vec![
                    ("a".into(), "a".into()),
                    ("b".into(), "b".into()),
                ])),
            )
            .unwrap();
        let specs = HashMap::from([
            ("a".to_string(), ChannelSpec::last_value()),
            ("b".to_string(), ChannelSpec::last_value()),
            ("total".to_string(), ChannelSpec::last_value()),
        ]);
        let driver = Driver::new(registry, specs, store());

        let outcome = driver
            .run(json!({"a": 2, "b": 3}), &config("t1"))
            .await
            .unwrap();
        assert_eq!(outcome.into_value().unwrap()["total"], json!(5));
    }
}
