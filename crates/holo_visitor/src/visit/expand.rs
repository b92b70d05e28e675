//! Super-shard expansion into concrete shards.
//!
//! Expansion runs in two phases over the shard database:
//! 1. ancestors: entries that contain the super-shard (left behind when the
//!    super-shard's range was split after a migration) are visited first;
//! 2. descendants: entries inside the super-shard, walked in canonical order.
//!
//! Both phases skip everything at or before the client's cursor and stop at
//! the round's shard budget, so re-running with the same cursor against the
//! same database yields the same plan prefix.

use super::{RoundPlan, ShardDatabase, ShardId};

/// Extend `plan` with up to `budget` shards after `cursor`.
///
/// Returns whether the super-shard is fully expanded; `plan.fully_expanded`
/// is updated to match. Safe to call repeatedly for the same visit: shards
/// already planned are skipped.
pub(super) fn expand_round(
    plan: &mut RoundPlan,
    db: &dyn ShardDatabase,
    cursor: ShardId,
    budget: usize,
) -> bool {
    if plan.fully_expanded {
        return true;
    }
    // A client echoing the end-of-super-shard cursor has nothing left.
    if cursor.is_max_sentinel() {
        plan.fully_expanded = true;
        return true;
    }
    let budget = budget.max(1);
    if !expand_ancestors(plan, db, cursor, budget) {
        return false;
    }
    let done = expand_descendants(plan, db, cursor, budget);
    plan.fully_expanded = done;
    done
}

fn expand_ancestors(
    plan: &mut RoundPlan,
    db: &dyn ShardDatabase,
    cursor: ShardId,
    budget: usize,
) -> bool {
    // Ancestors all sort before the super-shard's subtree; once the cursor is
    // inside it they were handled by an earlier round.
    if plan.super_shard.contains(&cursor) {
        return true;
    }

    let mut entries = db.parents_of(&plan.super_shard);
    entries.sort_by(|a, b| a.shard.cmp(&b.shard));
    for entry in entries {
        if cursor.is_set() && entry.shard <= cursor {
            continue;
        }
        if plan.contains(&entry.shard) {
            continue;
        }
        if plan.len() >= budget {
            return false;
        }
        plan.push(entry.shard);
    }
    true
}

fn expand_descendants(
    plan: &mut RoundPlan,
    db: &dyn ShardDatabase,
    cursor: ShardId,
    budget: usize,
) -> bool {
    let super_shard = plan.super_shard;
    let mut from = if super_shard.contains(&cursor) {
        cursor
    } else {
        super_shard
    };

    loop {
        let Some(entry) = db.next_after(&from) else {
            return true;
        };
        if !super_shard.contains(&entry.shard) {
            return true;
        }
        from = entry.shard;
        if plan.contains(&from) {
            continue;
        }
        if plan.len() >= budget {
            return false;
        }
        plan.push(from);
    }
}
