use std::collections::BTreeSet;

use super::{NodeId, ShardCopy, ShardEntry};

/// Pick the content node to visit `entry` on, skipping `tried` nodes.
///
/// Trusted copies win over untrusted ones. A consistent shard goes to the
/// first remaining candidate; an inconsistent one goes to the copy reporting
/// the most documents, with the earliest copy winning ties.
///
/// Returns `None` when every copy has already been tried.
pub fn pick_target_node(entry: &ShardEntry, tried: &BTreeSet<NodeId>) -> Option<NodeId> {
    let untried: Vec<&ShardCopy> = entry
        .copies
        .iter()
        .filter(|copy| !tried.contains(&copy.node))
        .collect();

    let candidates: Vec<&ShardCopy> = if untried.iter().any(|copy| copy.trusted) {
        untried.into_iter().filter(|copy| copy.trusted).collect()
    } else {
        untried
    };

    if entry.is_consistent() {
        return candidates.first().map(|copy| copy.node);
    }

    candidates
        .into_iter()
        .fold(None::<&ShardCopy>, |best, copy| match best {
            Some(best) if copy.doc_count <= best.doc_count => Some(best),
            _ => Some(copy),
        })
        .map(|copy| copy.node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visit::ShardId;

    fn copy(node: NodeId, trusted: bool, doc_count: u32, checksum: u32) -> ShardCopy {
        ShardCopy {
            node,
            trusted,
            doc_count,
            total_bytes: 0,
            checksum,
        }
    }

    fn entry(copies: Vec<ShardCopy>) -> ShardEntry {
        ShardEntry {
            shard: ShardId::new(4, 0b0001),
            copies,
        }
    }

    fn tried(nodes: &[NodeId]) -> BTreeSet<NodeId> {
        nodes.iter().copied().collect()
    }

    #[test]
    fn consistent_shard_uses_first_trusted_copy() {
        let shard = entry(vec![
            copy(1, false, 900, 3),
            copy(2, true, 10, 7),
            copy(3, true, 10, 7),
        ]);
        assert_eq!(pick_target_node(&shard, &tried(&[])), Some(2));
        assert_eq!(pick_target_node(&shard, &tried(&[2])), Some(3));
    }

    #[test]
    fn untrusted_copies_are_used_once_trusted_ones_are_tried() {
        let shard = entry(vec![copy(1, false, 5, 3), copy(2, true, 10, 7)]);
        assert_eq!(pick_target_node(&shard, &tried(&[2])), Some(1));
        assert_eq!(pick_target_node(&shard, &tried(&[1, 2])), None);
    }

    #[test]
    fn inconsistent_shard_prefers_most_documents() {
        let shard = entry(vec![
            copy(1, false, 10, 1),
            copy(2, false, 40, 2),
            copy(3, false, 20, 3),
        ]);
        assert_eq!(pick_target_node(&shard, &tried(&[])), Some(2));
        assert_eq!(pick_target_node(&shard, &tried(&[2])), Some(3));
    }

    #[test]
    fn inconsistent_trusted_copies_still_exclude_untrusted() {
        let shard = entry(vec![
            copy(1, true, 10, 1),
            copy(2, true, 20, 2),
            copy(3, false, 99, 3),
        ]);
        assert_eq!(pick_target_node(&shard, &tried(&[])), Some(2));
    }

    #[test]
    fn equal_document_counts_keep_the_earliest_copy() {
        let shard = entry(vec![
            copy(4, false, 30, 1),
            copy(2, false, 30, 2),
            copy(9, false, 30, 3),
        ]);
        assert_eq!(pick_target_node(&shard, &tried(&[])), Some(4));
    }

    #[test]
    fn empty_replica_set_has_no_candidate() {
        assert_eq!(pick_target_node(&entry(Vec::new()), &tried(&[])), None);
    }
}
