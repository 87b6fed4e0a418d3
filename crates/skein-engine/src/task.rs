use serde_json::Value;
use uuid::Uuid;

use skein_core::policy::{CacheKey, RetryPolicy};

use crate::constants::{PULL, PUSH};

/// One segment of a task path. `Index` sorts before `Name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSegment {
    Index(usize),
    Name(String),
}

/// A short tuple identifying where a task came from: `[PUSH, index]` for
/// fan-out tasks, `[PULL, node]` for trigger-driven tasks.
///
/// Path order is the deterministic tie-break for channels written by
/// multiple tasks in one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPath(pub Vec<PathSegment>);

impl TaskPath {
    pub fn push_task(index: usize) -> Self {
        TaskPath(vec![
            PathSegment::Name(PUSH.to_string()),
            PathSegment::Index(index),
        ])
    }

    pub fn pull_task(node: &str) -> Self {
        TaskPath(vec![
            PathSegment::Name(PULL.to_string()),
            PathSegment::Name(node.to_string()),
        ])
    }

    /// Deterministic ordering key: the first three segments, compared
    /// lexicographically, shorter prefixes first.
    pub fn sort_key(&self) -> Vec<PathSegment> {
        self.0.iter().take(3).cloned().collect()
    }
}

/// Deterministic task identity: a stable hash of the checkpoint
/// namespace, step, node name, task kind, and a disambiguating segment,
/// namespaced under the checkpoint id. Re-preparing the same checkpoint
/// always yields the same ids, which is what makes replay idempotent.
pub fn task_id(
    checkpoint_id: Uuid,
    checkpoint_ns: &str,
    step: usize,
    name: &str,
    kind: &str,
    disambiguator: &str,
) -> Uuid {
    let payload = serde_json::json!([checkpoint_ns, step.to_string(), name, kind, disambiguator]);
    Uuid::new_v5(&checkpoint_id, payload.to_string().as_bytes())
}

/// Lightweight task form for dry-run introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub id: Uuid,
    pub name: String,
    pub path: TaskPath,
}

/// A fully-prepared unit of execution for one step.
#[derive(Debug, Clone)]
pub struct ExecutableTask {
    pub id: Uuid,
    /// Target node name.
    pub name: String,
    /// Input assembled from channel reads or a fan-out packet payload.
    pub input: Value,
    /// The channel(s) whose advance caused this task to run.
    pub triggers: Vec<String>,
    pub path: TaskPath,
    /// Isolated write buffer, filled by the executor.
    pub writes: Vec<(String, Value)>,
    /// Resume value recorded under this task's id, if any.
    pub resume: Option<Value>,
    pub retry_policy: Option<RetryPolicy>,
    pub cache_key: Option<CacheKey>,
}

/// A task prepared by the scheduler: a full execution context, or only a
/// descriptor when the caller asked what would run next.
#[derive(Debug, Clone)]
pub enum PreparedTask {
    Descriptor(TaskDescriptor),
    Executable(ExecutableTask),
}

impl PreparedTask {
    pub fn id(&self) -> Uuid {
        match self {
            PreparedTask::Descriptor(t) => t.id,
            PreparedTask::Executable(t) => t.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PreparedTask::Descriptor(t) => &t.name,
            PreparedTask::Executable(t) => &t.name,
        }
    }

    pub fn path(&self) -> &TaskPath {
        match self {
            PreparedTask::Descriptor(t) => &t.path,
            PreparedTask::Executable(t) => &t.path,
        }
    }
}

/// Access to the fields the write applier needs from a settled task.
/// Implemented by `ExecutableTask` and by the driver's input-seeding
/// batch, so both flow through the same application path.
pub trait TaskWrites {
    fn path(&self) -> &TaskPath;
    fn name(&self) -> &str;
    fn triggers(&self) -> &[String];
    fn writes(&self) -> &[(String, Value)];
}

impl TaskWrites for ExecutableTask {
    fn path(&self) -> &TaskPath {
        &self.path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn triggers(&self) -> &[String] {
        &self.triggers
    }

    fn writes(&self) -> &[(String, Value)] {
        &self.writes
    }
}

/// A plain batch of writes applied on behalf of a pseudo-task (e.g. the
/// input seed).
#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub name: String,
    pub path: TaskPath,
    pub triggers: Vec<String>,
    pub writes: Vec<(String, Value)>,
}

impl WriteBatch {
    pub fn new(name: impl Into<String>, writes: Vec<(String, Value)>) -> Self {
        Self {
            name: name.into(),
            path: TaskPath::default(),
            triggers: Vec::new(),
            writes,
        }
    }
}

impl TaskWrites for WriteBatch {
    fn path(&self) -> &TaskPath {
        &self.path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn triggers(&self) -> &[String] {
        &self.triggers
    }

    fn writes(&self) -> &[(String, Value)] {
        &self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_deterministic() {
        let checkpoint_id = Uuid::new_v4();
        let a = task_id(checkpoint_id, "", 3, "worker", PULL, "x");
        let b = task_id(checkpoint_id, "", 3, "worker", PULL, "x");
        assert_eq!(a, b);
    }

    #[test]
    fn task_ids_differ_by_disambiguator() {
        let checkpoint_id = Uuid::new_v4();
        let a = task_id(checkpoint_id, "", 3, "worker", PUSH, "0");
        let b = task_id(checkpoint_id, "", 3, "worker", PUSH, "1");
        assert_ne!(a, b);
    }

    #[test]
    fn task_ids_differ_by_checkpoint() {
        let a = task_id(Uuid::new_v4(), "", 0, "worker", PULL, "x");
        let b = task_id(Uuid::new_v4(), "", 0, "worker", PULL, "x");
        assert_ne!(a, b);
    }

    #[test]
    fn task_ids_differ_by_step() {
        let checkpoint_id = Uuid::new_v4();
        let a = task_id(checkpoint_id, "", 0, "worker", PULL, "x");
        let b = task_id(checkpoint_id, "", 1, "worker", PULL, "x");
        assert_ne!(a, b);
    }

    #[test]
    fn path_sort_is_lexicographic_over_segments() {
        // The kind markers compare as plain strings: "__pull__" sorts
        // before "__push__" ('l' < 's'), so PULL tasks merge first. The
        // comparator is asserted exactly; do not assume intuitive order.
        let push0 = TaskPath::push_task(0);
        let push1 = TaskPath::push_task(1);
        let pull_a = TaskPath::pull_task("a");

        let mut paths = vec![push1.clone(), pull_a.clone(), push0.clone()];
        paths.sort_by_key(|p| p.sort_key());
        assert_eq!(paths, vec![pull_a, push0, push1]);
    }

    #[test]
    fn index_segments_sort_before_name_segments() {
        assert!(PathSegment::Index(99) < PathSegment::Name("a".to_string()));
    }

    #[test]
    fn shorter_prefix_sorts_first() {
        let short = TaskPath(vec![PathSegment::Name(PULL.to_string())]);
        let long = TaskPath::pull_task("a");
        let mut paths = vec![long.clone(), short.clone()];
        paths.sort_by_key(|p| p.sort_key());
        assert_eq!(paths, vec![short, long]);
    }

    #[test]
    fn sort_key_truncates_to_three_segments() {
        let deep = TaskPath(vec![
            PathSegment::Name(PUSH.to_string()),
            PathSegment::Index(0),
            PathSegment::Index(1),
            PathSegment::Index(2),
        ]);
        assert_eq!(deep.sort_key().len(), 3);
    }
}
