use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use skein_checkpoint::types::Checkpoint;
use skein_core::error::{ChannelError, Result};

use crate::constants::SENDS;

/// Built-in aggregation operators for `BinaryOperatorAggregate`.
#[derive(Clone)]
pub enum AggregateOp {
    /// Sum numeric values (f64). Non-numeric values are ignored.
    Sum,
    /// Keep the maximum numeric value.
    Max,
    /// Keep the minimum numeric value.
    Min,
    /// Custom: use a function.
    Custom(Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>),
}

impl std::fmt::Debug for AggregateOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateOp::Sum => write!(f, "Sum"),
            AggregateOp::Max => write!(f, "Max"),
            AggregateOp::Min => write!(f, "Min"),
            AggregateOp::Custom(_) => write!(f, "Custom(...)"),
        }
    }
}

/// Specification for creating a channel. The driver creates fresh channel
/// instances from specs at the start of each run, then restores them from
/// the checkpoint snapshot.
#[derive(Clone, Debug)]
pub enum ChannelSpec {
    /// A `LastValue` channel. `guard: true` rejects multiple writers in a
    /// single step.
    LastValue { guard: bool },
    /// An `EphemeralValue` channel cleared at each step boundary.
    Ephemeral,
    /// An append-only `Topic` channel.
    Topic,
    /// A `BinaryOperatorAggregate` channel with an identity value and
    /// operator.
    BinaryOperator { default: Value, op: AggregateOp },
    /// A `SendQueue` fan-out channel.
    SendQueue,
}

impl ChannelSpec {
    /// A guarded `LastValue` spec, the most common channel kind.
    pub fn last_value() -> Self {
        ChannelSpec::LastValue { guard: true }
    }

    /// Create a fresh `Channel` instance from this spec.
    pub fn create(&self) -> Box<dyn Channel> {
        match self {
            ChannelSpec::LastValue { guard } => Box::new(LastValue::with_guard(*guard)),
            ChannelSpec::Ephemeral => Box::new(EphemeralValue::new()),
            ChannelSpec::Topic => Box::new(Topic::new()),
            ChannelSpec::BinaryOperator { default, op } => {
                Box::new(BinaryOperatorAggregate::new(default.clone(), op.clone()))
            }
            ChannelSpec::SendQueue => Box::new(SendQueue::new()),
        }
    }
}

/// The live channel set for a run, keyed by channel name.
pub type ChannelMap = HashMap<String, Box<dyn Channel>>;

/// A channel manages one piece of shared, versioned state.
///
/// Channels hold values and merge semantics only; version markers are
/// assigned externally by the write applier against the owning
/// checkpoint. Channels are mutated exclusively by the write applier and
/// read-only during task input assembly.
pub trait Channel: Send + Sync {
    /// Consume one step's incoming writes. Returns `Ok(true)` iff the
    /// channel changed.
    fn update(&mut self, values: Vec<Value>) -> Result<bool>;

    /// Get the current value.
    ///
    /// Fails with `ChannelError::Empty` when no value has ever been
    /// written, or the last write was fully consumed.
    fn get(&self) -> Result<&Value>;

    /// Whether `get` would succeed.
    fn is_available(&self) -> bool;

    /// Mark a read-once value as spent. Returns `true` iff something was
    /// consumed; used by fan-out queues so the applier bumps their
    /// version exactly once per population.
    fn consume(&mut self) -> bool {
        false
    }

    /// End-of-run settle signal. Returns `true` iff the channel changed
    /// in response.
    fn finish(&mut self) -> bool {
        false
    }

    /// Snapshot for checkpointing. `None` omits the channel from the
    /// snapshot (nothing to persist).
    fn checkpoint(&self) -> Option<Value>;

    /// Restore state from a checkpoint snapshot.
    fn restore(&mut self, snapshot: Value) -> Result<()>;
}

/// Create the live channel set for a run and restore it from a
/// checkpoint. A `SendQueue` for the fan-out channel is added when the
/// specs do not declare one.
pub fn channels_from_checkpoint(
    specs: &HashMap<String, ChannelSpec>,
    checkpoint: &Checkpoint,
) -> Result<ChannelMap> {
    let mut channels: ChannelMap = specs
        .iter()
        .map(|(name, spec)| (name.clone(), spec.create()))
        .collect();
    channels
        .entry(SENDS.to_string())
        .or_insert_with(|| Box::new(SendQueue::new()));

    for (name, snapshot) in &checkpoint.channel_values {
        if let Some(channel) = channels.get_mut(name) {
            channel.restore(snapshot.clone())?;
        }
    }
    Ok(channels)
}

// ---------------------------------------------------------------------------
// LastValue
// ---------------------------------------------------------------------------

/// A channel that keeps only the final value written in a step.
///
/// With the guard flag set, two concurrent writers in one step are an
/// `InvalidUpdate` error.
pub struct LastValue {
    value: Option<Value>,
    guard: bool,
}

impl LastValue {
    pub fn new() -> Self {
        Self::with_guard(true)
    }

    /// A `LastValue` that accepts multiple writers, keeping the last.
    pub fn unguarded() -> Self {
        Self::with_guard(false)
    }

    pub fn with_guard(guard: bool) -> Self {
        Self { value: None, guard }
    }
}

impl Default for LastValue {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for LastValue {
    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        match values.len() {
            0 => Ok(false),
            n if n > 1 && self.guard => Err(ChannelError::InvalidUpdate(format!(
                "LastValue channel received {n} values in a single step; expected at most 1"
            ))
            .into()),
            _ => {
                self.value = values.into_iter().next_back();
                Ok(true)
            }
        }
    }

    fn get(&self) -> Result<&Value> {
        self.value.as_ref().ok_or_else(|| ChannelError::Empty.into())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn restore(&mut self, snapshot: Value) -> Result<()> {
        self.value = Some(snapshot);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EphemeralValue
// ---------------------------------------------------------------------------

/// A channel for transient per-step handoff values.
///
/// Holds at most one value. An empty update clears it and reports the
/// clearing as a change, so downstream consumers observe the value going
/// away as a version bump.
pub struct EphemeralValue {
    value: Option<Value>,
    guard: bool,
}

impl EphemeralValue {
    pub fn new() -> Self {
        Self {
            value: None,
            guard: true,
        }
    }
}

impl Default for EphemeralValue {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for EphemeralValue {
    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        match values.len() {
            0 => Ok(self.value.take().is_some()),
            n if n > 1 && self.guard => Err(ChannelError::InvalidUpdate(format!(
                "EphemeralValue channel received {n} values in a single step; expected at most 1"
            ))
            .into()),
            _ => {
                self.value = values.into_iter().next_back();
                Ok(true)
            }
        }
    }

    fn get(&self) -> Result<&Value> {
        self.value.as_ref().ok_or_else(|| ChannelError::Empty.into())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn restore(&mut self, snapshot: Value) -> Result<()> {
        self.value = Some(snapshot);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// An append-only channel.
///
/// All incoming values are appended in arrival order (array values are
/// flattened). The topic never clears itself; `consume` stays a no-op.
pub struct Topic {
    values: Vec<Value>,
    /// Cached JSON array so `get()` can return `&Value`.
    cached: Value,
}

impl Topic {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            cached: Value::Array(Vec::new()),
        }
    }

    fn rebuild_cache(&mut self) {
        self.cached = Value::Array(self.values.clone());
    }
}

impl Default for Topic {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for Topic {
    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        for value in values {
            // Flatten array values: [a, b] adds a and b individually
            if let Value::Array(arr) = value {
                self.values.extend(arr);
            } else {
                self.values.push(value);
            }
        }
        self.rebuild_cache();
        Ok(true)
    }

    fn get(&self) -> Result<&Value> {
        if self.values.is_empty() {
            return Err(ChannelError::Empty.into());
        }
        Ok(&self.cached)
    }

    fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    fn checkpoint(&self) -> Option<Value> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.cached.clone())
        }
    }

    fn restore(&mut self, snapshot: Value) -> Result<()> {
        self.values = match snapshot {
            Value::Array(arr) => arr,
            other => vec![other],
        };
        self.rebuild_cache();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BinaryOperatorAggregate
// ---------------------------------------------------------------------------

/// A channel that folds incoming values into an accumulator with a binary
/// operator. Starts from its identity value, so it is always available.
pub struct BinaryOperatorAggregate {
    value: Value,
    op: AggregateOp,
}

impl BinaryOperatorAggregate {
    pub fn new(default: Value, op: AggregateOp) -> Self {
        Self { value: default, op }
    }

    fn apply(&self, current: &Value, incoming: &Value) -> Value {
        match &self.op {
            AggregateOp::Sum => {
                let a = current.as_f64().unwrap_or(0.0);
                let b = incoming.as_f64().unwrap_or(0.0);
                serde_json::json!(a + b)
            }
            AggregateOp::Max => {
                let a = current.as_f64().unwrap_or(f64::NEG_INFINITY);
                let b = incoming.as_f64().unwrap_or(f64::NEG_INFINITY);
                serde_json::json!(a.max(b))
            }
            AggregateOp::Min => {
                let a = current.as_f64().unwrap_or(f64::INFINITY);
                let b = incoming.as_f64().unwrap_or(f64::INFINITY);
                serde_json::json!(a.min(b))
            }
            AggregateOp::Custom(f) => f(current, incoming),
        }
    }
}

impl Channel for BinaryOperatorAggregate {
    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        for value in values {
            let next = self.apply(&self.value, &value);
            self.value = next;
        }
        Ok(true)
    }

    fn get(&self) -> Result<&Value> {
        Ok(&self.value)
    }

    fn is_available(&self) -> bool {
        true
    }

    fn checkpoint(&self) -> Option<Value> {
        Some(self.value.clone())
    }

    fn restore(&mut self, snapshot: Value) -> Result<()> {
        self.value = snapshot;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SendQueue
// ---------------------------------------------------------------------------

/// The fan-out queue channel.
///
/// Holds the packets written this step for PUSH-task materialization.
/// `consume` drains the queue and reports `true` exactly once per
/// population, so the applier bumps the queue's version once no matter
/// how many packets were queued. Pending packets survive checkpointing.
pub struct SendQueue {
    packets: Vec<Value>,
    cached: Value,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            packets: Vec::new(),
            cached: Value::Array(Vec::new()),
        }
    }

    fn rebuild_cache(&mut self) {
        self.cached = Value::Array(self.packets.clone());
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for SendQueue {
    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        for value in values {
            if let Value::Array(arr) = value {
                self.packets.extend(arr);
            } else {
                self.packets.push(value);
            }
        }
        self.rebuild_cache();
        Ok(true)
    }

    fn get(&self) -> Result<&Value> {
        if self.packets.is_empty() {
            return Err(ChannelError::Empty.into());
        }
        Ok(&self.cached)
    }

    fn is_available(&self) -> bool {
        !self.packets.is_empty()
    }

    fn consume(&mut self) -> bool {
        if self.packets.is_empty() {
            return false;
        }
        self.packets.clear();
        self.rebuild_cache();
        true
    }

    fn checkpoint(&self) -> Option<Value> {
        if self.packets.is_empty() {
            None
        } else {
            Some(self.cached.clone())
        }
    }

    fn restore(&mut self, snapshot: Value) -> Result<()> {
        self.packets = match snapshot {
            Value::Array(arr) => arr,
            other => vec![other],
        };
        self.rebuild_cache();
        Ok(())
    }
}
