//! Splitting a node's shards into visit commands.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{CommandId, NodeId, ShardId, VisitCommand, VisitRequest, LOCK_TOKEN_PARAMETER};

/// Number of commands to spread `shard_count` shards over on one node.
///
/// Inputs:
/// - `available`: command slots this visit may still use on the node.
/// - `shard_count`: shards assigned to the node this pass.
/// - `min_shards_per_command`: smallest batch worth its own command.
///
/// Output:
/// - `max(1, min(available, shard_count / min_shards_per_command))`.
pub(super) fn visitor_count(available: u32, shard_count: usize, min_shards_per_command: u32) -> usize {
    let by_size = shard_count / min_shards_per_command.max(1) as usize;
    by_size.min(available as usize).max(1)
}

/// Deal `shards` round-robin over `count` commands, dropping empty batches.
pub(super) fn split_round_robin(shards: &[ShardId], count: usize) -> Vec<Vec<ShardId>> {
    let count = count.max(1).min(shards.len().max(1));
    let mut batches = vec![Vec::new(); count];
    for (idx, shard) in shards.iter().enumerate() {
        batches[idx % count].push(*shard);
    }
    batches.retain(|batch| !batch.is_empty());
    batches
}

/// Group `(shard, node)` assignments into per-node command batches.
pub(super) fn batch_by_node(
    assignments: &[(ShardId, NodeId)],
    available: impl Fn(NodeId) -> u32,
    min_shards_per_command: u32,
) -> Vec<(NodeId, Vec<ShardId>)> {
    let mut by_node: BTreeMap<NodeId, Vec<ShardId>> = BTreeMap::new();
    for (shard, node) in assignments {
        by_node.entry(*node).or_default().push(*shard);
    }

    let mut batches = Vec::new();
    for (node, shards) in by_node {
        let count = visitor_count(available(node), shards.len(), min_shards_per_command);
        for batch in split_round_robin(&shards, count) {
            batches.push((node, batch));
        }
    }
    batches
}

/// Request-wide fields stamped onto every command of one dispatch wave.
pub(super) struct CommandTemplate<'a> {
    request: &'a VisitRequest,
    coordinator_index: u16,
    remaining: Duration,
    to_time: u64,
    lock_token: Option<&'a str>,
    max_pending_replies: u32,
}

impl<'a> CommandTemplate<'a> {
    pub(super) fn new(
        request: &'a VisitRequest,
        coordinator_index: u16,
        remaining: Duration,
        lock_token: Option<&'a str>,
        commands_in_wave: usize,
    ) -> Self {
        let to_time = if request.to_time == 0 {
            now_micros()
        } else {
            request.to_time
        };
        let wave = u32::try_from(commands_in_wave.max(1)).unwrap_or(u32::MAX);
        Self {
            request,
            coordinator_index,
            remaining,
            to_time,
            lock_token,
            max_pending_replies: (request.max_pending_replies_per_command / wave).max(1),
        }
    }

    pub(super) fn build(&self, target: NodeId, shards: Vec<ShardId>) -> VisitCommand {
        let command_id = CommandId::next();
        let mut parameters = self.request.parameters.clone();
        if let Some(token) = self.lock_token {
            parameters.insert(LOCK_TOKEN_PARAMETER.to_string(), token.to_string());
        }
        VisitCommand {
            command_id,
            target,
            shards,
            instance_id: format!(
                "{}-{}-{}",
                self.request.instance_id, self.coordinator_index, command_id
            ),
            library_name: self.request.library_name.clone(),
            document_selection: self.request.document_selection.clone(),
            field_set: self.request.field_set.clone(),
            from_time: self.request.from_time,
            to_time: self.to_time,
            control_destination: self.request.control_destination.clone(),
            timeout: self.remaining,
            queue_timeout: self.remaining / 2,
            max_pending_replies: self.max_pending_replies,
            parameters,
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
