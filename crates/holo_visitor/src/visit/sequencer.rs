//! Exclusive per-shard sequencing for read-for-write visits.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use super::ShardId;

static LOCK_TOKEN_SEQ: AtomicU64 = AtomicU64::new(1);

/// Opaque token correlating a read-for-write visit with the writes that follow
/// it on the content node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Build a unique token for a lock taken by coordinator `coordinator_index`.
    ///
    /// Inputs:
    /// - `coordinator_index`: index of the coordinator taking the lock.
    ///
    /// Output:
    /// - Token of the form `c{index}-{unix_ms}-{seq}`, unique per process.
    pub fn generate(coordinator_index: u16) -> Self {
        let started_ms = now_unix_ms();
        let seq = LOCK_TOKEN_SEQ.fetch_add(1, Ordering::Relaxed);
        LockToken(format!("c{coordinator_index}-{started_ms}-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Table of shards currently held exclusively.
///
/// Cloning shares the table. Acquisition never waits: a shard that is
/// already held is reported as unavailable.
#[derive(Clone, Debug, Default)]
pub struct OperationSequencer {
    locked: Arc<Mutex<BTreeSet<ShardId>>>,
}

impl OperationSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the exclusive lock on `shard`, or `None` if someone holds it.
    pub fn try_acquire(&self, shard: ShardId, coordinator_index: u16) -> Option<SequencingHandle> {
        let mut locked = self.locked.lock().unwrap_or_else(|p| p.into_inner());
        if !locked.insert(shard) {
            return None;
        }
        Some(SequencingHandle {
            shard,
            token: LockToken::generate(coordinator_index),
            locked: self.locked.clone(),
        })
    }

    pub fn is_locked(&self, shard: &ShardId) -> bool {
        self.locked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(shard)
    }
}

/// Proof of exclusive access to one shard; releases the lock on drop.
#[derive(Debug)]
pub struct SequencingHandle {
    shard: ShardId,
    token: LockToken,
    locked: Arc<Mutex<BTreeSet<ShardId>>>,
}

impl SequencingHandle {
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }
}

impl Drop for SequencingHandle {
    fn drop(&mut self) {
        let mut locked = self.locked.lock().unwrap_or_else(|p| p.into_inner());
        locked.remove(&self.shard);
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_handle_drops() {
        let sequencer = OperationSequencer::new();
        let shard = ShardId::new(4, 0b0001);

        let handle = sequencer.try_acquire(shard, 0).unwrap();
        assert!(sequencer.is_locked(&shard));
        assert!(sequencer.try_acquire(shard, 0).is_none());
        assert!(sequencer.clone().try_acquire(shard, 1).is_none());

        drop(handle);
        assert!(!sequencer.is_locked(&shard));
        assert!(sequencer.try_acquire(shard, 0).is_some());
    }

    #[test]
    fn locks_are_per_shard() {
        let sequencer = OperationSequencer::new();
        let _a = sequencer.try_acquire(ShardId::new(4, 0b0001), 0).unwrap();
        assert!(sequencer.try_acquire(ShardId::new(4, 0b1001), 0).is_some());
    }

    #[test]
    fn tokens_are_unique_and_carry_coordinator() {
        let a = LockToken::generate(7);
        let b = LockToken::generate(7);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("c7-"));
        assert_eq!(a.as_str().split('-').count(), 3);
    }
}
