use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::SENDS;

/// A fan-out packet naming a target node and the input it should run
/// with.
///
/// Packets support dynamic, data-dependent branching that cannot be
/// expressed as static subscriptions: a node may emit any number of
/// packets in one step, and the next step materializes one PUSH task per
/// packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPacket {
    /// Target node name to execute.
    pub node: String,
    /// Input payload for the target node.
    pub args: Value,
}

impl SendPacket {
    pub fn new(node: impl Into<String>, args: Value) -> Self {
        Self {
            node: node.into(),
            args,
        }
    }

    /// The `(channel, value)` write pair that queues this packet.
    pub fn into_write(self) -> (String, Value) {
        (
            SENDS.to_string(),
            serde_json::json!({"node": self.node, "args": self.args}),
        )
    }
}
