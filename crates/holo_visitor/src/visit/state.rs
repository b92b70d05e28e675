//! Per-visit round plan.
//!
//! The plan records which shards this visit expanded, in canonical order, and
//! where each one stands. Entries are only ever appended and mutated, never
//! removed, so the resumption cursor can always be derived from it.

use std::collections::{BTreeSet, HashMap};

use super::{NodeId, ShardId};

/// Where a shard stands within the current visit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardPhase {
    /// Not attempted yet, or waiting to be retried on another replica.
    Pending,
    Active(NodeId),
    Done,
    /// Every known replica was tried (or none existed).
    Exhausted,
}

/// Progress of one shard within the current visit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardRoundState {
    pub done: bool,
    pub active_node: Option<NodeId>,
    pub failed_attempts: u32,
    pub tried_nodes: BTreeSet<NodeId>,
    pub exhausted: bool,
}

impl ShardRoundState {
    pub fn phase(&self) -> ShardPhase {
        if self.done {
            ShardPhase::Done
        } else if let Some(node) = self.active_node {
            ShardPhase::Active(node)
        } else if self.exhausted {
            ShardPhase::Exhausted
        } else {
            ShardPhase::Pending
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase(), ShardPhase::Done | ShardPhase::Exhausted)
    }
}

/// Shards planned for this visit and their per-shard state.
#[derive(Clone, Debug)]
pub struct RoundPlan {
    pub super_shard: ShardId,
    pub shards_in_order: Vec<ShardId>,
    pub shards: HashMap<ShardId, ShardRoundState>,
    pub fully_expanded: bool,
}

impl RoundPlan {
    pub fn new(super_shard: ShardId) -> Self {
        Self {
            super_shard,
            shards_in_order: Vec::new(),
            shards: HashMap::new(),
            fully_expanded: false,
        }
    }

    pub fn len(&self) -> usize {
        self.shards_in_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards_in_order.is_empty()
    }

    pub fn contains(&self, shard: &ShardId) -> bool {
        self.shards.contains_key(shard)
    }

    /// Append `shard` unless it is already planned. Returns whether it was new.
    pub fn push(&mut self, shard: ShardId) -> bool {
        if self.shards.contains_key(&shard) {
            return false;
        }
        self.shards.insert(shard, ShardRoundState::default());
        self.shards_in_order.push(shard);
        true
    }

    pub fn state(&self, shard: &ShardId) -> Option<&ShardRoundState> {
        self.shards.get(shard)
    }

    pub fn state_mut(&mut self, shard: &ShardId) -> Option<&mut ShardRoundState> {
        self.shards.get_mut(shard)
    }

    pub fn first(&self) -> Option<ShardId> {
        self.shards_in_order.first().copied()
    }

    /// Shards waiting for a (re)try, in plan order.
    pub fn pending(&self) -> Vec<ShardId> {
        self.shards_in_order
            .iter()
            .filter(|shard| {
                self.shards
                    .get(*shard)
                    .is_some_and(|state| state.phase() == ShardPhase::Pending)
            })
            .copied()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.shards
            .values()
            .filter(|state| state.active_node.is_some())
            .count()
    }

    pub fn done_count(&self) -> usize {
        self.shards.values().filter(|state| state.done).count()
    }

    pub fn has_exhausted(&self) -> bool {
        self.shards.values().any(|state| state.exhausted)
    }

    /// True when no planned shard is waiting for a node or on one.
    pub fn all_terminal(&self) -> bool {
        self.shards.values().all(ShardRoundState::is_terminal)
    }

    /// Cursor to hand back to the client.
    ///
    /// Inputs:
    /// - `start_cursor`: the cursor this visit was started with.
    /// - `allow_inconsistent`: whether shards that had no usable replica (and
    ///   never failed a command) may be skipped over.
    ///
    /// Output:
    /// - The last shard of the longest fully-handled prefix of the plan, the
    ///   start cursor when no prefix was handled, or the max sentinel when the
    ///   plan is fully expanded and every shard was passed.
    pub fn resumption_cursor(&self, start_cursor: ShardId, allow_inconsistent: bool) -> ShardId {
        let mut cursor = start_cursor;
        let mut stopped = false;
        for shard in &self.shards_in_order {
            let Some(state) = self.shards.get(shard) else {
                stopped = true;
                break;
            };
            let passable = state.done
                || (allow_inconsistent && state.exhausted && state.failed_attempts == 0);
            if !passable {
                stopped = true;
                break;
            }
            cursor = *shard;
        }
        if self.fully_expanded && !stopped {
            return ShardId::MAX_SENTINEL;
        }
        cursor
    }
}
