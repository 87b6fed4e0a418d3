use std::collections::{HashMap, HashSet};

use serde_json::Value;

use skein_checkpoint::types::Checkpoint;
use skein_checkpoint::version::{max_version, ChannelVersion, VersionGenerator};
use skein_core::error::{ChannelError, Result, SkeinError};

use crate::channel::ChannelMap;
use crate::constants::{is_control_channel, is_reserved};
use crate::task::TaskWrites;

/// Whether any updated channel triggers a registered node, i.e. whether
/// the run has another step to do.
pub fn triggers_next_step(
    updated_channels: &HashSet<String>,
    trigger_to_nodes: Option<&HashMap<String, Vec<String>>>,
) -> bool {
    match trigger_to_nodes {
        Some(map) => updated_channels
            .iter()
            .any(|chan| map.get(chan).is_some_and(|nodes| !nodes.is_empty())),
        None => false,
    }
}

/// Merge one step's task writes into the channel set and advance version
/// bookkeeping. Mutates the working checkpoint copy and channels in
/// place; the caller keeps the previously persisted checkpoint untouched.
///
/// Returns the names of channels that became updated; the driver uses
/// this set (against the trigger map) as the continue-or-stop signal.
pub fn apply_writes<T: TaskWrites>(
    checkpoint: &mut Checkpoint,
    channels: &mut ChannelMap,
    tasks: &mut [T],
    get_next_version: &VersionGenerator,
    trigger_to_nodes: Option<&HashMap<String, Vec<String>>>,
) -> Result<HashSet<String>> {
    // 1. Deterministic merge order: path prefix, then truncated length.
    // This is the tie-break for channels receiving writes from several
    // tasks in the same step.
    tasks.sort_by_key(|t| t.path().sort_key());

    // Seed batches have no triggers; a step driven by real tasks does.
    let bump_step = tasks.iter().any(|t| !t.triggers().is_empty());

    // 2. Each task has now reacted to its trigger channels at their
    // current versions; record that so they don't re-trigger on the same
    // data next step.
    for task in tasks.iter() {
        let seen = checkpoint
            .versions_seen
            .entry(task.name().to_string())
            .or_default();
        for chan in task.triggers() {
            if let Some(version) = checkpoint.channel_versions.get(chan) {
                seen.insert(chan.clone(), version.clone());
            }
        }
    }

    // 3. The next version token is derived from the current maximum.
    let mut working_max: Option<ChannelVersion> =
        max_version(&checkpoint.channel_versions).cloned();

    // 4. Consume triggered read-once channels. A successful consume is a
    // version-worthy change.
    let channels_to_consume: HashSet<&str> = tasks
        .iter()
        .flat_map(|t| t.triggers())
        .map(String::as_str)
        .filter(|chan| !is_reserved(chan))
        .collect();
    let mut used_new_version = false;
    for chan in channels_to_consume {
        if let Some(channel) = channels.get_mut(chan) {
            if channel.consume() {
                checkpoint
                    .channel_versions
                    .insert(chan.to_string(), get_next_version(working_max.as_ref()));
                used_new_version = true;
            }
        }
    }
    if working_max.is_some() && used_new_version {
        working_max = Some(get_next_version(working_max.as_ref()));
    }

    // 5. Group writes by channel: per-task order preserved, concatenated
    // across tasks in the sorted order from step 1. Control-channel
    // writes are side-channel signals, not state updates.
    let mut pending_by_channel: HashMap<String, Vec<Value>> = HashMap::new();
    for task in tasks.iter() {
        for (chan, value) in task.writes() {
            if is_control_channel(chan) {
                continue;
            }
            if channels.contains_key(chan) {
                pending_by_channel
                    .entry(chan.clone())
                    .or_default()
                    .push(value.clone());
            } else {
                tracing::warn!(channel = %chan, "skipping write to undeclared channel");
            }
        }
    }

    // 6. Apply the grouped updates.
    let mut updated_channels = HashSet::new();
    for (chan, values) in pending_by_channel {
        let Some(channel) = channels.get_mut(&chan) else {
            continue;
        };
        let updated = match channel.update(values.clone()) {
            Ok(updated) => updated,
            Err(SkeinError::Channel(ChannelError::InvalidUpdate(reason))) => {
                let rendered = serde_json::to_string(&values)
                    .unwrap_or_else(|_| format!("{values:?}"));
                return Err(ChannelError::InvalidUpdate(format!(
                    "channel '{chan}' with values {rendered}: {reason}"
                ))
                .into());
            }
            Err(e) => return Err(e),
        };
        if updated {
            checkpoint
                .channel_versions
                .insert(chan.clone(), get_next_version(working_max.as_ref()));
            if channel.is_available() {
                updated_channels.insert(chan);
            }
        }
    }

    // 7. Step-continuation bump: untouched channels get one empty update
    // so ephemeral variants can report their own clearing as a change.
    if bump_step {
        for (chan, channel) in channels.iter_mut() {
            if channel.is_available() && !updated_channels.contains(chan) {
                let updated = channel.update(Vec::new())?;
                if updated {
                    checkpoint
                        .channel_versions
                        .insert(chan.clone(), get_next_version(working_max.as_ref()));
                    if channel.is_available() {
                        updated_channels.insert(chan.clone());
                    }
                }
            }
        }
    }

    // 8. Settle pass: nothing updated would trigger another step, so give
    // every channel one finish() chance to register before the run
    // concludes.
    if bump_step && !triggers_next_step(&updated_channels, trigger_to_nodes) {
        for (chan, channel) in channels.iter_mut() {
            if channel.finish() {
                checkpoint
                    .channel_versions
                    .insert(chan.clone(), get_next_version(working_max.as_ref()));
                if channel.is_available() {
                    updated_channels.insert(chan.clone());
                }
            }
        }
    }

    Ok(updated_channels)
}
