use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use skein_core::error::{ExecutionError, Result};
use skein_core::policy::{CachePolicy, RetryPolicy};

/// Per-task execution context handed to a node.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// The deterministic id of the running task.
    pub task_id: Uuid,
    /// Resume value supplied by the caller when re-entering an
    /// interrupted task. `None` on first execution.
    pub resume: Option<Value>,
}

impl TaskContext {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            resume: None,
        }
    }
}

/// The explicit tri-state outcome of a node execution.
///
/// Interrupts are a control signal, not an error: the task yields a
/// payload for the caller and can be re-entered later with a resume
/// value. Failures are ordinary `Err` returns.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    /// Writes the task produced, as `(channel, value)` pairs.
    Writes(Vec<(String, Value)>),
    /// Pause the run and surface this payload to the caller.
    Interrupt(Value),
}

impl NodeOutput {
    /// A single-channel write.
    pub fn write(channel: impl Into<String>, value: Value) -> Self {
        NodeOutput::Writes(vec![(channel.into(), value)])
    }

    /// No writes this step.
    pub fn none() -> Self {
        NodeOutput::Writes(Vec::new())
    }
}

/// A computation node. The engine invokes `execute` with input assembled
/// from the node's subscribed channels (or a fan-out packet payload) and
/// collects the returned writes into the task's isolated buffer.
#[async_trait]
pub trait Node: Send + Sync {
    async fn execute(&self, input: Value, ctx: TaskContext) -> Result<NodeOutput>;
}

type AsyncNodeFn = dyn Fn(Value, TaskContext) -> Pin<Box<dyn Future<Output = Result<NodeOutput>> + Send>>
    + Send
    + Sync;

/// A node that wraps an async function.
pub struct NodeFn {
    func: Arc<AsyncNodeFn>,
}

impl NodeFn {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeOutput>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |input, ctx| Box::pin(func(input, ctx))),
        }
    }
}

#[async_trait]
impl Node for NodeFn {
    async fn execute(&self, input: Value, ctx: TaskContext) -> Result<NodeOutput> {
        (self.func)(input, ctx).await
    }
}

/// How a node's input is assembled from channels.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// Map-shaped input: each `(state_key, channel)` entry reads one
    /// channel into one key. An empty trigger channel aborts scheduling
    /// of the task; an empty non-trigger channel is skipped.
    Map(Vec<(String, String)>),
    /// The first available channel's bare value. No channel available
    /// means the task is not scheduled.
    Any(Vec<String>),
}

/// Registry entry describing one node: what triggers it, how its input
/// is assembled, and how it runs.
#[derive(Clone)]
pub struct NodeSpec {
    pub name: String,
    /// Channels whose version advancing schedules this node. Declaration
    /// order is significant: the first satisfying trigger is the one
    /// recorded on the task.
    pub triggers: Vec<String>,
    /// Input assembly. Defaults to `Any(triggers)` when not set.
    pub input: Option<InputSource>,
    pub node: Arc<dyn Node>,
    pub retry_policy: Option<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    pub tags: Vec<String>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, node: impl Node + 'static) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            input: None,
            node: Arc::new(node),
            retry_policy: None,
            cache_policy: None,
            tags: Vec::new(),
        }
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, input: InputSource) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// The effective input assembly for this node.
    pub fn input_source(&self) -> InputSource {
        self.input
            .clone()
            .unwrap_or_else(|| InputSource::Any(self.triggers.clone()))
    }
}

/// The set of nodes known to a run, keyed by name.
///
/// Iteration order is the sorted node-name order, which keeps candidate
/// scans deterministic.
#[derive(Default, Clone)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, NodeSpec>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: NodeSpec) -> Result<()> {
        if self.nodes.contains_key(&spec.name) {
            return Err(ExecutionError::DuplicateNode(spec.name).into());
        }
        self.nodes.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Map each channel to the sorted list of node names it triggers.
    pub fn trigger_to_nodes(&self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (name, spec) in &self.nodes {
            for trigger in &spec.triggers {
                map.entry(trigger.clone()).or_default().push(name.clone());
            }
        }
        // BTreeMap iteration already yields names in sorted order.
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn passthrough() -> NodeFn {
        NodeFn::new(|input: Value, _ctx| async move { Ok(NodeOutput::write("out", input)) })
    }

    #[tokio::test]
    async fn node_fn_executes() {
        let node = passthrough();
        let output = node
            .execute(json!({"x": 1}), TaskContext::new(Uuid::new_v4()))
            .await
            .unwrap();
        match output {
            NodeOutput::Writes(writes) => {
                assert_eq!(writes, vec![("out".to_string(), json!({"x": 1}))]);
            }
            NodeOutput::Interrupt(_) => panic!("expected writes"),
        }
    }

    #[tokio::test]
    async fn node_fn_can_interrupt() {
        let node = NodeFn::new(|_input, ctx: TaskContext| async move {
            match ctx.resume {
                Some(value) => Ok(NodeOutput::write("answer", value)),
                None => Ok(NodeOutput::Interrupt(json!("approve?"))),
            }
        });

        let first = node
            .execute(json!({}), TaskContext::new(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(matches!(first, NodeOutput::Interrupt(_)));

        let mut ctx = TaskContext::new(Uuid::new_v4());
        ctx.resume = Some(json!("yes"));
        let second = node.execute(json!({}), ctx).await.unwrap();
        assert!(matches!(second, NodeOutput::Writes(_)));
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = NodeRegistry::new();
        registry.add(NodeSpec::new("a", passthrough())).unwrap();
        let err = registry.add(NodeSpec::new("a", passthrough())).unwrap_err();
        assert!(err.to_string().contains("Duplicate node"));
    }

    #[test]
    fn registry_names_are_sorted() {
        let mut registry = NodeRegistry::new();
        registry.add(NodeSpec::new("zeta", passthrough())).unwrap();
        registry.add(NodeSpec::new("alpha", passthrough())).unwrap();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn trigger_to_nodes_lists_sorted_subscribers() {
        let mut registry = NodeRegistry::new();
        registry
            .add(NodeSpec::new("b", passthrough()).with_triggers(["x"]))
            .unwrap();
        registry
            .add(NodeSpec::new("a", passthrough()).with_triggers(["x", "y"]))
            .unwrap();

        let map = registry.trigger_to_nodes();
        assert_eq!(map["x"], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(map["y"], vec!["a".to_string()]);
    }

    #[test]
    fn input_source_defaults_to_any_of_triggers() {
        let spec = NodeSpec::new("a", passthrough()).with_triggers(["x", "y"]);
        match spec.input_source() {
            InputSource::Any(channels) => assert_eq!(channels, vec!["x", "y"]),
            InputSource::Map(_) => panic!("expected Any"),
        }
    }
}
