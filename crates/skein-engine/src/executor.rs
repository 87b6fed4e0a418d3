use futures::future::join_all;
use serde_json::{json, Value};

use skein_core::error::{ChannelError, ExecutionError, Result, SkeinError};

use crate::constants::{ERROR, INTERRUPT, NO_WRITES, SENDS};
use crate::node::{NodeRegistry, TaskContext};
use crate::send::SendPacket;
use crate::task::ExecutableTask;

/// Run one step's tasks to completion, filling each task's isolated
/// write buffer.
///
/// Tasks run concurrently; each future owns a distinct task, so there is
/// no shared mutable state and no locking. Failures and interrupts are
/// captured into the buffer as control-channel writes rather than
/// raised, so sibling tasks always run to completion and the write
/// applier never interleaves with execution.
pub async fn execute_tasks(tasks: &mut [ExecutableTask], registry: &NodeRegistry) {
    join_all(tasks.iter_mut().map(|task| execute_one(task, registry))).await;
}

async fn execute_one(task: &mut ExecutableTask, registry: &NodeRegistry) {
    // A buffer restored from pending writes means the task already
    // settled in a previous attempt at this step.
    if !task.writes.is_empty() {
        return;
    }
    let Some(spec) = registry.get(&task.name) else {
        let err = ExecutionError::UnknownNode(task.name.clone());
        task.writes
            .push((ERROR.to_string(), error_value(&task.name, &err.to_string())));
        return;
    };

    let max_attempts = task
        .retry_policy
        .as_ref()
        .map(|p| p.max_attempts.max(1))
        .unwrap_or(1);

    let mut attempt = 1;
    loop {
        let mut ctx = TaskContext::new(task.id);
        ctx.resume = task.resume.clone();

        match spec.node.execute(task.input.clone(), ctx).await {
            Ok(output) => {
                match output {
                    crate::node::NodeOutput::Writes(writes) => {
                        match validate_writes(&writes, registry) {
                            Ok(()) => {
                                task.writes = if writes.is_empty() {
                                    // Record success even with nothing to
                                    // say, so replay can skip this task.
                                    vec![(NO_WRITES.to_string(), Value::Null)]
                                } else {
                                    writes
                                };
                            }
                            Err(e) => {
                                task.writes
                                    .push((ERROR.to_string(), error_value(&task.name, &e.to_string())));
                            }
                        }
                    }
                    crate::node::NodeOutput::Interrupt(value) => {
                        // A yield, not a failure: partial writes are
                        // discarded, only the payload is recorded.
                        task.writes.push((INTERRUPT.to_string(), value));
                    }
                }
                return;
            }
            Err(e) => {
                if attempt < max_attempts {
                    tracing::debug!(
                        node = %task.name,
                        attempt,
                        error = %e,
                        "task attempt failed, retrying"
                    );
                    if let Some(policy) = task.retry_policy.as_ref() {
                        tokio::time::sleep(policy.interval_for(attempt)).await;
                    }
                    attempt += 1;
                    continue;
                }
                task.writes
                    .push((ERROR.to_string(), error_value(&task.name, &e.to_string())));
                return;
            }
        }
    }
}

/// Validate a task's writes before they enter the buffer. A write to the
/// fan-out channel must carry a well-formed packet naming a registered
/// node; anything else is a programming error in the node, not a
/// tolerable stray.
fn validate_writes(writes: &[(String, Value)], registry: &NodeRegistry) -> Result<()> {
    for (channel, value) in writes {
        if channel == SENDS {
            let packet: SendPacket = serde_json::from_value(value.clone()).map_err(|_| {
                SkeinError::from(ChannelError::InvalidUpdate(format!(
                    "expected a send packet, got {value}"
                )))
            })?;
            if !registry.contains(&packet.node) {
                return Err(ChannelError::InvalidUpdate(format!(
                    "invalid node name '{}' in send packet",
                    packet.node
                ))
                .into());
            }
        }
    }
    Ok(())
}

/// Build the value recorded under the error marker for a failed task.
fn error_value(node: &str, message: &str) -> Value {
    json!({"node": node, "message": message})
}

/// Extract the failure message from a recorded error value.
pub fn error_message(value: &Value) -> String {
    value
        .get("message")
        .and_then(|m| m.as_str())
        .map(String::from)
        .unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use serde_json::json;
    use uuid::Uuid;

    use skein_core::policy::RetryPolicy;

    use crate::node::{Node, NodeFn, NodeOutput, NodeSpec};
    use crate::task::TaskPath;

    fn task_named(name: &str) -> ExecutableTask {
        ExecutableTask {
            id: Uuid::new_v4(),
            name: name.to_string(),
            input: json!({}),
            triggers: vec!["in".to_string()],
            path: TaskPath::pull_task(name),
            writes: Vec::new(),
            resume: None,
            retry_policy: None,
            cache_key: None,
        }
    }

    fn registry_of(specs: Vec<NodeSpec>) -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        for spec in specs {
            registry.add(spec).unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn successful_task_records_its_writes() {
        let registry = registry_of(vec![NodeSpec::new(
            "worker",
            NodeFn::new(|_input, _ctx| async move { Ok(NodeOutput::write("out", json!(7))) }),
        )]);
        let mut tasks = vec![task_named("worker")];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(tasks[0].writes, vec![("out".to_string(), json!(7))]);
    }

    #[tokio::test]
    async fn empty_output_records_no_writes_marker() {
        let registry = registry_of(vec![NodeSpec::new(
            "quiet",
            NodeFn::new(|_input, _ctx| async move { Ok(NodeOutput::none()) }),
        )]);
        let mut tasks = vec![task_named("quiet")];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(tasks[0].writes, vec![(NO_WRITES.to_string(), Value::Null)]);
    }

    #[tokio::test]
    async fn failure_is_captured_not_raised() {
        let registry = registry_of(vec![NodeSpec::new(
            "broken",
            NodeFn::new(|_input, _ctx| async move {
                Err::<NodeOutput, _>(SkeinError::Other("boom".into()))
            }),
        )]);
        let mut tasks = vec![task_named("broken")];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(tasks[0].writes.len(), 1);
        assert_eq!(tasks[0].writes[0].0, ERROR);
        assert_eq!(error_message(&tasks[0].writes[0].1), "boom");
    }

    #[tokio::test]
    async fn sibling_tasks_complete_despite_a_failure() {
        let registry = registry_of(vec![
            NodeSpec::new(
                "broken",
                NodeFn::new(|_input, _ctx| async move {
                    Err::<NodeOutput, _>(SkeinError::Other("boom".into()))
                }),
            ),
            NodeSpec::new(
                "fine",
                NodeFn::new(|_input, _ctx| async move { Ok(NodeOutput::write("out", json!(1))) }),
            ),
        ]);
        let mut tasks = vec![task_named("broken"), task_named("fine")];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(tasks[0].writes[0].0, ERROR);
        assert_eq!(tasks[1].writes, vec![("out".to_string(), json!(1))]);
    }

    #[tokio::test]
    async fn interrupt_outcome_records_payload_only() {
        let registry = registry_of(vec![NodeSpec::new(
            "gate",
            NodeFn::new(|_input, _ctx| async move {
                Ok(NodeOutput::Interrupt(json!({"question": "approve?"})))
            }),
        )]);
        let mut tasks = vec![task_named("gate")];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(tasks[0].writes.len(), 1);
        assert_eq!(tasks[0].writes[0].0, INTERRUPT);
        assert_eq!(tasks[0].writes[0].1["question"], "approve?");
    }

    #[tokio::test]
    async fn resume_value_reaches_the_node() {
        let registry = registry_of(vec![NodeSpec::new(
            "gate",
            NodeFn::new(|_input, ctx: TaskContext| async move {
                match ctx.resume {
                    Some(value) => Ok(NodeOutput::write("answer", value)),
                    None => Ok(NodeOutput::Interrupt(json!("approve?"))),
                }
            }),
        )]);
        let mut task = task_named("gate");
        task.resume = Some(json!("yes"));
        let mut tasks = vec![task];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(tasks[0].writes, vec![("answer".to_string(), json!("yes"))]);
    }

    #[tokio::test]
    async fn settled_task_is_not_rerun() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let registry = registry_of(vec![NodeSpec::new(
            "worker",
            NodeFn::new(move |_input, _ctx| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(NodeOutput::write("out", json!(1)))
                }
            }),
        )]);

        let mut task = task_named("worker");
        task.writes = vec![("out".to_string(), json!("restored"))];
        let mut tasks = vec![task];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(tasks[0].writes, vec![("out".to_string(), json!("restored"))]);
    }

    #[tokio::test]
    async fn retries_until_success_within_policy() {
        struct FlakyNode {
            calls: Arc<AtomicU32>,
        }

        #[async_trait::async_trait]
        impl Node for FlakyNode {
            async fn execute(&self, _input: Value, _ctx: TaskContext) -> Result<NodeOutput> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(SkeinError::Other("transient".into()))
                } else {
                    Ok(NodeOutput::write("out", json!("finally")))
                }
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let registry = registry_of(vec![NodeSpec::new(
            "flaky",
            FlakyNode {
                calls: calls.clone(),
            },
        )]);

        let mut task = task_named("flaky");
        task.retry_policy = Some(RetryPolicy {
            max_attempts: 3,
            initial_interval_ms: 1,
            backoff_factor: 1.0,
            max_interval_ms: 1,
        });
        let mut tasks = vec![task];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            tasks[0].writes,
            vec![("out".to_string(), json!("finally"))]
        );
    }

    #[tokio::test]
    async fn retries_exhausted_record_error() {
        let registry = registry_of(vec![NodeSpec::new(
            "broken",
            NodeFn::new(|_input, _ctx| async move {
                Err::<NodeOutput, _>(SkeinError::Other("still broken".into()))
            }),
        )]);

        let mut task = task_named("broken");
        task.retry_policy = Some(RetryPolicy {
            max_attempts: 2,
            initial_interval_ms: 1,
            backoff_factor: 1.0,
            max_interval_ms: 1,
        });
        let mut tasks = vec![task];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(tasks[0].writes[0].0, ERROR);
        assert_eq!(error_message(&tasks[0].writes[0].1), "still broken");
    }

    #[tokio::test]
    async fn invalid_send_packet_write_fails_the_task() {
        let registry = registry_of(vec![NodeSpec::new(
            "sender",
            NodeFn::new(|_input, _ctx| async move {
                Ok(NodeOutput::write(SENDS, json!("not a packet")))
            }),
        )]);
        let mut tasks = vec![task_named("sender")];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(tasks[0].writes[0].0, ERROR);
        assert!(error_message(&tasks[0].writes[0].1).contains("send packet"));
    }

    #[tokio::test]
    async fn send_packet_to_unknown_node_fails_the_task() {
        let registry = registry_of(vec![NodeSpec::new(
            "sender",
            NodeFn::new(|_input, _ctx| async move {
                Ok(NodeOutput::Writes(vec![
                    SendPacket::new("ghost", json!({})).into_write(),
                ]))
            }),
        )]);
        let mut tasks = vec![task_named("sender")];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(tasks[0].writes[0].0, ERROR);
        assert!(error_message(&tasks[0].writes[0].1).contains("ghost"));
    }

    #[tokio::test]
    async fn valid_send_packet_write_passes_validation() {
        let registry = registry_of(vec![
            NodeSpec::new(
                "sender",
                NodeFn::new(|_input, _ctx| async move {
                    Ok(NodeOutput::Writes(vec![
                        SendPacket::new("worker", json!({"n": 1})).into_write(),
                    ]))
                }),
            ),
            NodeSpec::new(
                "worker",
                NodeFn::new(|_input, _ctx| async move { Ok(NodeOutput::none()) }),
            ),
        ]);
        let mut tasks = vec![task_named("sender")];

        execute_tasks(&mut tasks, &registry).await;
        assert_eq!(tasks[0].writes.len(), 1);
        assert_eq!(tasks[0].writes[0].0, SENDS);
    }
}
