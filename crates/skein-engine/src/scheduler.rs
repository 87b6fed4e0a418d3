use std::collections::{HashMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use skein_checkpoint::types::{Checkpoint, PendingWrite};
use skein_checkpoint::version::ChannelVersion;
use skein_core::policy::CacheKey;

use crate::channel::ChannelMap;
use crate::constants::{CACHE_NS, ERROR, INTERRUPT, PULL, PUSH, RESUME, SENDS};
use crate::node::{InputSource, NodeRegistry, NodeSpec};
use crate::send::SendPacket;
use crate::task::{task_id, ExecutableTask, PreparedTask, TaskDescriptor, TaskPath};

/// Per-call scheduling context, threaded explicitly through the call
/// chain instead of living in ambient state.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerContext<'a> {
    /// The step being prepared; part of every task's identity.
    pub step: usize,
    /// Namespace for task identity, used by nested graphs. Empty at the
    /// top level.
    pub checkpoint_ns: &'a str,
    /// When false, return lightweight descriptors instead of full
    /// execution contexts ("what would run next").
    pub for_execution: bool,
    /// Channels updated by the previous step, when known. Restricts the
    /// PULL candidate scan.
    pub updated_channels: Option<&'a HashSet<String>>,
    /// Channel -> subscriber map, paired with `updated_channels`.
    pub trigger_to_nodes: Option<&'a HashMap<String, Vec<String>>>,
}

/// Compute the set of tasks that make up the next step: PUSH tasks from
/// the fan-out queue, then PULL tasks for every node with a freshly
/// advanced trigger channel.
///
/// Re-running this against the same checkpoint and pending writes yields
/// the same task set; ids are stable hashes, never random.
pub fn prepare_next_tasks(
    checkpoint: &Checkpoint,
    pending_writes: &[PendingWrite],
    registry: &NodeRegistry,
    channels: &ChannelMap,
    ctx: &SchedulerContext<'_>,
) -> HashMap<Uuid, PreparedTask> {
    let mut tasks = HashMap::new();

    if let Some(queue) = channels.get(SENDS) {
        if queue.is_available() {
            if let Ok(value) = queue.get() {
                let packets = value.as_array().cloned().unwrap_or_default();
                for (index, packet) in packets.iter().enumerate() {
                    if let Some(task) =
                        prepare_push_task(index, packet, checkpoint, pending_writes, registry, ctx)
                    {
                        tasks.insert(task.id(), task);
                    }
                }
            }
        }
    }

    for name in candidate_nodes(checkpoint, registry, ctx) {
        if let Some(task) =
            prepare_pull_task(&name, checkpoint, pending_writes, registry, channels, ctx)
        {
            tasks.insert(task.id(), task);
        }
    }

    tasks
}

/// The PULL candidates to examine, in sorted order.
fn candidate_nodes(
    checkpoint: &Checkpoint,
    registry: &NodeRegistry,
    ctx: &SchedulerContext<'_>,
) -> Vec<String> {
    if let (Some(updated), Some(trigger_to_nodes)) = (ctx.updated_channels, ctx.trigger_to_nodes) {
        let mut triggered = HashSet::new();
        for channel in updated {
            if let Some(names) = trigger_to_nodes.get(channel) {
                triggered.extend(names.iter().cloned());
            }
        }
        let mut sorted: Vec<_> = triggered.into_iter().collect();
        sorted.sort();
        return sorted;
    }

    if checkpoint.channel_versions.is_empty() {
        // Fresh checkpoint: nothing has ever been written, nothing fires.
        return Vec::new();
    }

    registry.names().map(String::from).collect()
}

/// Materialize one PUSH task from a fan-out packet.
///
/// Tolerant by design: a packet may have been queued under an older
/// graph version, so a malformed packet or unknown target is warned and
/// skipped, never fatal to the step.
fn prepare_push_task(
    index: usize,
    packet: &Value,
    checkpoint: &Checkpoint,
    pending_writes: &[PendingWrite],
    registry: &NodeRegistry,
    ctx: &SchedulerContext<'_>,
) -> Option<PreparedTask> {
    let packet: SendPacket = match serde_json::from_value(packet.clone()) {
        Ok(packet) => packet,
        Err(_) => {
            tracing::warn!(%packet, "ignoring invalid packet in fan-out queue");
            return None;
        }
    };
    let Some(spec) = registry.get(&packet.node) else {
        tracing::warn!(node = %packet.node, "ignoring unknown node in fan-out queue");
        return None;
    };

    let id = task_id(
        checkpoint.id,
        ctx.checkpoint_ns,
        ctx.step,
        &packet.node,
        PUSH,
        &index.to_string(),
    );
    let path = TaskPath::push_task(index);

    if !ctx.for_execution {
        return Some(PreparedTask::Descriptor(TaskDescriptor {
            id,
            name: packet.node,
            path,
        }));
    }

    let cache_key = cache_key_for(spec, &packet.args);
    Some(PreparedTask::Executable(ExecutableTask {
        id,
        name: packet.node,
        input: packet.args,
        triggers: vec![SENDS.to_string()],
        path,
        writes: Vec::new(),
        resume: resume_for(pending_writes, id),
        retry_policy: spec.retry_policy.clone(),
        cache_key,
    }))
}

/// Build one PULL task if any of the node's trigger channels advanced
/// past what the node has seen.
fn prepare_pull_task(
    name: &str,
    checkpoint: &Checkpoint,
    pending_writes: &[PendingWrite],
    registry: &NodeRegistry,
    channels: &ChannelMap,
    ctx: &SchedulerContext<'_>,
) -> Option<PreparedTask> {
    let spec = registry.get(name)?;
    let null_version = ChannelVersion::null();
    let seen = checkpoint.versions_seen.get(name);

    // First satisfying trigger in declaration order. Only this channel is
    // recorded on the task (and later in versions_seen), even though the
    // input below reads every subscribed channel that has a value.
    let trigger = spec.triggers.iter().find(|chan| {
        let available = channels.get(chan.as_str()).is_some_and(|c| c.is_available());
        let current = checkpoint
            .channel_versions
            .get(chan.as_str())
            .unwrap_or(&null_version);
        let last_seen = seen
            .and_then(|s| s.get(chan.as_str()))
            .unwrap_or(&null_version);
        available && current > last_seen
    })?;

    let id = task_id(checkpoint.id, ctx.checkpoint_ns, ctx.step, name, PULL, trigger);

    // A successful write already recorded under this id means the task
    // finished before a crash or interrupt; don't run it again. Error
    // captures, interrupt payloads, and resume values are not success
    // records.
    if pending_writes.iter().any(|w| {
        w.task_id == id && w.channel != ERROR && w.channel != INTERRUPT && w.channel != RESUME
    }) {
        return None;
    }

    let input = assemble_input(spec, channels)?;
    let path = TaskPath::pull_task(name);

    if !ctx.for_execution {
        return Some(PreparedTask::Descriptor(TaskDescriptor {
            id,
            name: name.to_string(),
            path,
        }));
    }

    let cache_key = cache_key_for(spec, &input);
    Some(PreparedTask::Executable(ExecutableTask {
        id,
        name: name.to_string(),
        input,
        triggers: vec![trigger.clone()],
        path,
        writes: Vec::new(),
        resume: resume_for(pending_writes, id),
        retry_policy: spec.retry_policy.clone(),
        cache_key,
    }))
}

/// Assemble a node's input from its subscribed channels. `None` means
/// the node cannot run this step (a required channel is empty); the
/// emptiness is swallowed here, not propagated.
fn assemble_input(spec: &NodeSpec, channels: &ChannelMap) -> Option<Value> {
    match spec.input_source() {
        InputSource::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (key, chan) in entries {
                let required = spec.triggers.contains(&chan);
                match channels.get(&chan).and_then(|c| c.get().ok()) {
                    Some(value) => {
                        map.insert(key, value.clone());
                    }
                    None if required => return None,
                    None => continue,
                }
            }
            Some(Value::Object(map))
        }
        InputSource::Any(chans) => chans
            .iter()
            .find_map(|chan| channels.get(chan).and_then(|c| c.get().ok()).cloned()),
    }
}

fn resume_for(pending_writes: &[PendingWrite], id: Uuid) -> Option<Value> {
    pending_writes
        .iter()
        .find(|w| w.task_id == id && w.channel == RESUME)
        .map(|w| w.value.clone())
}

fn cache_key_for(spec: &NodeSpec, input: &Value) -> Option<CacheKey> {
    spec.cache_policy.as_ref().map(|policy| CacheKey {
        ns: vec![CACHE_NS.to_string(), spec.name.clone()],
        key: Uuid::new_v5(&Uuid::NAMESPACE_OID, input.to_string().as_bytes())
            .simple()
            .to_string(),
        ttl_secs: policy.ttl_secs,
    })
}
