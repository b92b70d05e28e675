//! In-memory implementations of the visit engine's collaborators.
//!
//! These back the integration tests and the visit driver. They follow the
//! same contracts a storage node's real shard database, cluster state, and
//! message tracker would: ordered lookups, all-or-nothing ownership, and
//! continuations that fire outside of any internal lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::{Mutex, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::{
    ClusterView, CommandId, DeferredTask, MessageSender, Operation, PendingMessageTracker,
    ShardDatabase, ShardEntry, ShardId, ShardOwnership, StableOperationRegistry, TaskRunState,
    VisitCommand, VisitCommandReply, VisitReply,
};

/// Shard database over an ordered map keyed in canonical shard order.
#[derive(Debug, Default)]
pub struct MemoryShardDatabase {
    entries: RwLock<BTreeMap<ShardId, ShardEntry>>,
}

impl MemoryShardDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ShardEntry>) -> Self {
        let db = Self::new();
        for entry in entries {
            db.upsert(entry);
        }
        db
    }

    pub fn upsert(&self, entry: ShardEntry) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(entry.shard, entry);
    }

    pub fn remove(&self, shard: &ShardId) -> Option<ShardEntry> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.remove(shard)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ShardDatabase for MemoryShardDatabase {
    fn get(&self, shard: &ShardId) -> Option<ShardEntry> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.get(shard).cloned()
    }

    fn parents_of(&self, shard: &ShardId) -> Vec<ShardEntry> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        shard
            .ancestors_and_self()
            .filter_map(|prefix| entries.get(&prefix).cloned())
            .collect()
    }

    fn next_after(&self, shard: &ShardId) -> Option<ShardEntry> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries
            .range((Bound::Excluded(*shard), Bound::Unbounded))
            .next()
            .map(|(_, entry)| entry.clone())
    }
}

/// One cluster topology version: a description clients can redirect with and
/// the super-shard prefixes this coordinator owns under it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub description: String,
    #[serde(default)]
    pub owned: Vec<ShardId>,
}

impl Topology {
    pub fn owning(description: impl Into<String>, owned: Vec<ShardId>) -> Self {
        Self {
            description: description.into(),
            owned,
        }
    }

    pub fn owns(&self, shard: &ShardId) -> bool {
        self.owned.iter().any(|prefix| prefix.contains(shard))
    }
}

fn default_available() -> bool {
    true
}

/// Fixed cluster view, optionally mid-transition to a pending topology.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticClusterView {
    #[serde(default = "default_available")]
    pub available: bool,
    pub distribution_bits: u8,
    #[serde(default)]
    pub coordinator_index: u16,
    pub current: Topology,
    #[serde(default)]
    pub pending: Option<Topology>,
}

impl StaticClusterView {
    pub fn new(distribution_bits: u8, current: Topology) -> Self {
        Self {
            available: true,
            distribution_bits,
            coordinator_index: 0,
            current,
            pending: None,
        }
    }
}

impl ClusterView for StaticClusterView {
    fn has_available_coordinators(&self) -> bool {
        self.available
    }

    fn distribution_bits(&self) -> u8 {
        self.distribution_bits
    }

    fn coordinator_index(&self) -> u16 {
        self.coordinator_index
    }

    fn topology_description(&self) -> String {
        self.current.description.clone()
    }

    fn check_ownership(&self, shard: &ShardId) -> ShardOwnership {
        if let Some(pending) = &self.pending {
            if !pending.owns(shard) {
                return ShardOwnership::NotOwned {
                    topology: pending.description.clone(),
                };
            }
        }
        if !self.current.owns(shard) {
            return ShardOwnership::NotOwned {
                topology: self.current.description.clone(),
            };
        }
        ShardOwnership::Owned
    }
}

#[derive(Default)]
struct TrackerState {
    pending: HashMap<ShardId, u32>,
    merges: HashSet<ShardId>,
    waiting: Vec<(ShardId, Box<dyn DeferredTask>)>,
}

/// Pending-message tracker keeping per-shard counts in memory.
///
/// Deferred tasks are run after the internal lock is released, so a task may
/// call back into the tracker.
#[derive(Default)]
pub struct MemoryPendingTracker {
    state: Mutex<TrackerState>,
}

impl MemoryPendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more outstanding message against `shard`.
    pub fn add_pending(&self, shard: ShardId) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *state.pending.entry(shard).or_insert(0) += 1;
    }

    /// Retire one outstanding message; fires the shard's waiting tasks once
    /// nothing is left.
    pub fn complete_pending(&self, shard: ShardId, sender: &mut dyn MessageSender) {
        let ready = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let remaining = match state.pending.get_mut(&shard) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining > 0 {
                return;
            }
            state.pending.remove(&shard);
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.waiting)
                .into_iter()
                .partition(|(waiting_on, _)| *waiting_on == shard);
            state.waiting = waiting;
            ready
        };
        for (_, task) in ready {
            task.run(TaskRunState::Ok, sender);
        }
    }

    pub fn pending_count(&self, shard: &ShardId) -> u32 {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.pending.get(shard).copied().unwrap_or(0)
    }

    pub fn set_merge_pending(&self, shard: ShardId, pending: bool) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if pending {
            state.merges.insert(shard);
        } else {
            state.merges.remove(&shard);
        }
    }

    pub fn waiting_tasks(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.waiting.len()
    }

    /// Fire every waiting task as aborted, e.g. on shutdown.
    pub fn abort_deferred(&self, sender: &mut dyn MessageSender) {
        let waiting = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut state.waiting)
        };
        for (_, task) in waiting {
            task.run(TaskRunState::Aborted, sender);
        }
    }
}

impl PendingMessageTracker for MemoryPendingTracker {
    fn has_pending_merge(&self, shard: &ShardId) -> bool {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.merges.contains(shard)
    }

    fn run_once_no_pending_for_shard(
        &self,
        shard: ShardId,
        task: Box<dyn DeferredTask>,
        sender: &mut dyn MessageSender,
    ) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if state.pending.get(&shard).copied().unwrap_or(0) > 0 {
                state.waiting.push((shard, task));
                return;
            }
        }
        task.run(TaskRunState::Ok, sender);
    }
}

/// Stable registry owning started operations until they finish.
///
/// Operations are called with the registry lock released, so an operation
/// may start further operations from inside its callbacks.
#[derive(Default)]
pub struct MemoryOperationRegistry {
    ops: Mutex<Vec<Box<dyn Operation>>>,
}

impl MemoryOperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `reply` to the operation that sent its command.
    ///
    /// Returns `false` when no live operation owns the command.
    pub fn deliver(&self, reply: VisitCommandReply, sender: &mut dyn MessageSender) -> bool {
        let Some(mut op) = self.take_owner(reply.command_id) else {
            tracing::debug!(command = %reply.command_id, "no operation owns visit command reply");
            return false;
        };
        op.on_receive(sender, reply);
        self.keep_unless_finished(op);
        true
    }

    /// Close every live operation and forget them.
    pub fn close_all(&self, sender: &mut dyn MessageSender) {
        let ops = {
            let mut ops = self.ops.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *ops)
        };
        for mut op in ops {
            op.on_close(sender);
        }
    }

    pub fn len(&self) -> usize {
        self.ops.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_owner(&self, command_id: CommandId) -> Option<Box<dyn Operation>> {
        let mut ops = self.ops.lock().unwrap_or_else(|p| p.into_inner());
        let idx = ops.iter().position(|op| op.owns_command(command_id))?;
        Some(ops.remove(idx))
    }

    fn keep_unless_finished(&self, op: Box<dyn Operation>) {
        let mut ops = self.ops.lock().unwrap_or_else(|p| p.into_inner());
        // Gates finish once they hand their visit off, without a callback.
        ops.retain(|live| !live.is_finished());
        if !op.is_finished() {
            ops.push(op);
        }
    }
}

impl StableOperationRegistry for MemoryOperationRegistry {
    fn start_operation(&self, mut op: Box<dyn Operation>, sender: &mut dyn MessageSender) {
        tracing::debug!(operation = op.name(), "starting operation");
        op.on_start(sender);
        self.keep_unless_finished(op);
    }
}

/// Message sender that records everything it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingSender {
    pub commands: Vec<VisitCommand>,
    pub replies: Vec<VisitReply>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_commands(&mut self) -> Vec<VisitCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl MessageSender for RecordingSender {
    fn send_command(&mut self, command: VisitCommand) {
        self.commands.push(command);
    }

    fn send_reply(&mut self, reply: VisitReply) {
        self.replies.push(reply);
    }
}

/// Cluster state plus shard database contents, as loaded from JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub cluster: StaticClusterView,
    #[serde(default)]
    pub shards: Vec<ShardEntry>,
}

impl ClusterSnapshot {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let snapshot: ClusterSnapshot =
            serde_json::from_str(raw).context("parse cluster snapshot")?;
        for entry in &snapshot.shards {
            anyhow::ensure!(
                !entry.copies.is_empty(),
                "shard {} has no copies in snapshot",
                entry.shard
            );
        }
        Ok(snapshot)
    }

    pub fn database(&self) -> MemoryShardDatabase {
        MemoryShardDatabase::from_entries(self.shards.iter().cloned())
    }
}
