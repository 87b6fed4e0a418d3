use std::collections::HashSet;

use serde_json::Value;
use uuid::Uuid;

use skein_checkpoint::types::Checkpoint;
use skein_checkpoint::version::ChannelVersion;

use crate::constants::{INTERRUPT, START, TAG_HIDDEN};
use crate::node::NodeRegistry;
use crate::task::ExecutableTask;

/// Which nodes pause the run for external review.
#[derive(Debug, Clone)]
pub enum InterruptNodes {
    /// Wildcard: any node not tagged hidden.
    All,
    /// Only the named nodes.
    Named(HashSet<String>),
}

impl InterruptNodes {
    /// An empty set: never interrupt.
    pub fn none() -> Self {
        InterruptNodes::Named(HashSet::new())
    }

    pub fn nodes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        InterruptNodes::Named(names.into_iter().map(Into::into).collect())
    }
}

/// An interrupt surfaced to the caller, resumable by task id.
#[derive(Debug, Clone)]
pub struct PendingInterrupt {
    pub node: String,
    pub task_id: Uuid,
    pub value: Value,
}

/// Decide whether the run should pause for external input.
///
/// True iff some channel advanced past what the interrupt bookkeeping
/// key has seen (the synthetic START channel always reads as advanced on
/// the first step) AND some scheduled task targets an interrupt node.
/// Pure predicate: pausing and persisting are the driver's business.
pub fn should_interrupt(
    checkpoint: &Checkpoint,
    interrupt_nodes: &InterruptNodes,
    tasks: &[ExecutableTask],
    registry: &NodeRegistry,
) -> bool {
    let null_version = ChannelVersion::null();
    let seen = checkpoint.versions_seen.get(INTERRUPT);
    let seen_for = |chan: &str| {
        seen.and_then(|s| s.get(chan)).unwrap_or(&null_version)
    };

    let mut any_channel_updated = checkpoint
        .channel_versions
        .get(START)
        .unwrap_or(&null_version)
        > seen_for(START);
    if !any_channel_updated {
        any_channel_updated = checkpoint
            .channel_versions
            .iter()
            .any(|(chan, version)| version > seen_for(chan));
    }

    let any_task_in_interrupt_nodes = tasks.iter().any(|task| match interrupt_nodes {
        InterruptNodes::All => registry
            .get(&task.name)
            .is_none_or(|spec| !spec.tags.iter().any(|tag| tag == TAG_HIDDEN)),
        InterruptNodes::Named(names) => names.contains(&task.name),
    });

    any_channel_updated && any_task_in_interrupt_nodes
}

/// Stamp the interrupt bookkeeping key with the full version map, so the
/// gate stays quiet until something new happens.
pub fn mark_interrupt_seen(checkpoint: &mut Checkpoint) {
    checkpoint
        .versions_seen
        .insert(INTERRUPT.to_string(), checkpoint.channel_versions.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use serde_json::json;

    use crate::node::{NodeFn, NodeOutput, NodeSpec};
    use crate::task::{task_id, TaskPath};

    fn registry_with(names: &[&str], hidden: &[&str]) -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        for name in names {
            let mut spec = NodeSpec::new(
                *name,
                NodeFn::new(|_input, _ctx| async move { Ok(NodeOutput::none()) }),
            );
            if hidden.contains(name) {
                spec = spec.with_tag(TAG_HIDDEN);
            }
            registry.add(spec).unwrap();
        }
        registry
    }

    fn task_for(checkpoint: &Checkpoint, name: &str) -> ExecutableTask {
        ExecutableTask {
            id: task_id(checkpoint.id, "", 0, name, "__pull__", "x"),
            name: name.to_string(),
            input: json!({}),
            triggers: vec!["x".to_string()],
            path: TaskPath::pull_task(name),
            writes: Vec::new(),
            resume: None,
            retry_policy: None,
            cache_key: None,
        }
    }

    fn advanced_checkpoint() -> Checkpoint {
        let mut checkpoint = Checkpoint::initial("t");
        checkpoint
            .channel_versions
            .insert("x".into(), ChannelVersion::Int(2));
        checkpoint
    }

    #[test]
    fn quiet_when_no_task_targets_interrupt_nodes() {
        let checkpoint = advanced_checkpoint();
        let registry = registry_with(&["writer", "reviewer"], &[]);
        let tasks = vec![task_for(&checkpoint, "writer")];

        assert!(!should_interrupt(
            &checkpoint,
            &InterruptNodes::nodes(["reviewer"]),
            &tasks,
            &registry
        ));
    }

    #[test]
    fn fires_when_task_targets_interrupt_node_and_channels_advanced() {
        let checkpoint = advanced_checkpoint();
        let registry = registry_with(&["writer", "reviewer"], &[]);
        let tasks = vec![
            task_for(&checkpoint, "writer"),
            task_for(&checkpoint, "reviewer"),
        ];

        assert!(should_interrupt(
            &checkpoint,
            &InterruptNodes::nodes(["reviewer"]),
            &tasks,
            &registry
        ));
    }

    #[test]
    fn quiet_when_versions_already_seen() {
        let mut checkpoint = advanced_checkpoint();
        mark_interrupt_seen(&mut checkpoint);
        let registry = registry_with(&["reviewer"], &[]);
        let tasks = vec![task_for(&checkpoint, "reviewer")];

        assert!(!should_interrupt(
            &checkpoint,
            &InterruptNodes::nodes(["reviewer"]),
            &tasks,
            &registry
        ));
    }

    #[test]
    fn start_channel_counts_as_updated_on_first_step() {
        let mut checkpoint = Checkpoint::initial("t");
        checkpoint
            .channel_versions
            .insert(START.into(), ChannelVersion::Int(1));
        let registry = registry_with(&["reviewer"], &[]);
        let tasks = vec![task_for(&checkpoint, "reviewer")];

        assert!(should_interrupt(
            &checkpoint,
            &InterruptNodes::nodes(["reviewer"]),
            &tasks,
            &registry
        ));
    }

    #[test]
    fn wildcard_matches_any_visible_node() {
        let checkpoint = advanced_checkpoint();
        let registry = registry_with(&["writer"], &[]);
        let tasks = vec![task_for(&checkpoint, "writer")];

        assert!(should_interrupt(
            &checkpoint,
            &InterruptNodes::All,
            &tasks,
            &registry
        ));
    }

    #[test]
    fn wildcard_skips_hidden_nodes() {
        let checkpoint = advanced_checkpoint();
        let registry = registry_with(&["internal"], &["internal"]);
        let tasks = vec![task_for(&checkpoint, "internal")];

        assert!(!should_interrupt(
            &checkpoint,
            &InterruptNodes::All,
            &tasks,
            &registry
        ));
    }

    #[test]
    fn empty_interrupt_set_never_fires() {
        let checkpoint = advanced_checkpoint();
        let registry = registry_with(&["writer"], &[]);
        let tasks = vec![task_for(&checkpoint, "writer")];

        assert!(!should_interrupt(
            &checkpoint,
            &InterruptNodes::none(),
            &tasks,
            &registry
        ));
    }

    #[test]
    fn mark_interrupt_seen_copies_version_map() {
        let mut checkpoint = advanced_checkpoint();
        mark_interrupt_seen(&mut checkpoint);
        assert_eq!(
            checkpoint.versions_seen[INTERRUPT],
            HashMap::from([("x".to_string(), ChannelVersion::Int(2))])
        );
    }
}
