//! Read-for-write front for visit operations.
//!
//! A read-for-write visit must be the only thing touching its shard: the
//! client follows it with writes that depend on what it read. The gate
//! verifies the request, refuses to run next to a pending merge or another
//! read-for-write visit on the same shard, and then waits (without blocking)
//! until the pending-message tracker reports the shard idle. The wrapped
//! operation then moves, together with its lock, into the stable registry.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    CommandId, DeferredTask, MessageSender, Operation, OperationSequencer, PendingMessageTracker,
    SequencingHandle, StableOperationRegistry, TaskRunState, VisitCommandReply, VisitOperation,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GateState {
    Idle = 0,
    Verifying = 1,
    LockPending = 2,
    Deferred = 3,
    Running = 4,
    Replied = 5,
}

impl GateState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => GateState::Verifying,
            2 => GateState::LockPending,
            3 => GateState::Deferred,
            4 => GateState::Running,
            5 => GateState::Replied,
            _ => GateState::Idle,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SharedGateState(Arc<AtomicU8>);

impl SharedGateState {
    fn get(&self) -> GateState {
        GateState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: GateState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Operation and lock parked while the gate waits for the shard to go idle.
/// Whoever takes it first (the tracker continuation or a close) owns them.
type DeferredSlot = Arc<Mutex<Option<(Box<VisitOperation>, SequencingHandle)>>>;

fn take_deferred(slot: &DeferredSlot) -> Option<(Box<VisitOperation>, SequencingHandle)> {
    slot.lock().unwrap_or_else(|p| p.into_inner()).take()
}

pub struct ExclusiveVisitGate {
    op: Option<Box<VisitOperation>>,
    deferred: DeferredSlot,
    state: SharedGateState,
    sequencer: OperationSequencer,
    tracker: Arc<dyn PendingMessageTracker>,
    registry: Arc<dyn StableOperationRegistry>,
}

impl ExclusiveVisitGate {
    pub fn new(
        op: VisitOperation,
        sequencer: OperationSequencer,
        tracker: Arc<dyn PendingMessageTracker>,
        registry: Arc<dyn StableOperationRegistry>,
    ) -> Self {
        Self {
            op: Some(Box::new(op)),
            deferred: DeferredSlot::default(),
            state: SharedGateState::default(),
            sequencer,
            tracker,
            registry,
        }
    }

    pub fn state(&self) -> GateState {
        self.state.get()
    }
}

impl Operation for ExclusiveVisitGate {
    fn name(&self) -> &'static str {
        "read_for_write_visit_gate"
    }

    fn on_start(&mut self, sender: &mut dyn MessageSender) {
        let Some(mut op) = self.op.take() else {
            return;
        };

        self.state.set(GateState::Verifying);
        if !op.verify_and_expand(sender) {
            self.state.set(GateState::Replied);
            return;
        }

        let Some(shard) = op.first_shard_to_visit() else {
            // Nothing to lock; the visit completes immediately.
            self.state.set(GateState::Running);
            op.start_new_visitors(sender);
            self.op = Some(op);
            return;
        };

        self.state.set(GateState::LockPending);
        if self.tracker.has_pending_merge(&shard) {
            tracing::debug!(
                visitor = %op.request().instance_id,
                shard = %shard,
                "read-for-write visit conflicts with a pending merge"
            );
            op.fail_with_merge_pending(shard, sender);
            self.state.set(GateState::Replied);
            return;
        }
        let Some(handle) = self.sequencer.try_acquire(shard, op.coordinator_index()) else {
            tracing::debug!(
                visitor = %op.request().instance_id,
                shard = %shard,
                "read-for-write visit found shard already locked"
            );
            op.fail_with_shard_already_locked(shard, sender);
            self.state.set(GateState::Replied);
            return;
        };

        self.state.set(GateState::Deferred);
        tracing::debug!(
            visitor = %op.request().instance_id,
            shard = %shard,
            token = %handle.token(),
            "deferring read-for-write visit until shard is idle"
        );
        *self.deferred.lock().unwrap_or_else(|p| p.into_inner()) = Some((op, handle));
        let task = DeferredVisitStart {
            slot: self.deferred.clone(),
            registry: self.registry.clone(),
            state: self.state.clone(),
        };
        self.tracker
            .run_once_no_pending_for_shard(shard, Box::new(task), sender);
    }

    fn on_receive(&mut self, sender: &mut dyn MessageSender, reply: VisitCommandReply) {
        if let Some(op) = self.op.as_mut() {
            op.on_receive(sender, reply);
        }
    }

    fn on_close(&mut self, sender: &mut dyn MessageSender) {
        if let Some(op) = self.op.as_mut() {
            op.on_close(sender);
            return;
        }
        let Some((mut op, handle)) = take_deferred(&self.deferred) else {
            return;
        };
        tracing::debug!(
            visitor = %op.request().instance_id,
            shard = %handle.shard(),
            "read-for-write visit closed while waiting for the shard"
        );
        drop(handle);
        op.fail_with_aborted("read-for-write visit closed while waiting for the shard", sender);
        self.state.set(GateState::Replied);
    }

    fn owns_command(&self, command_id: CommandId) -> bool {
        self.op
            .as_ref()
            .is_some_and(|op| op.owns_command(command_id))
    }

    fn is_finished(&self) -> bool {
        match &self.op {
            Some(op) => op.is_finished(),
            None => matches!(self.state.get(), GateState::Running | GateState::Replied),
        }
    }
}

/// Continuation run by the pending-message tracker once the shard is idle.
///
/// A no-op when the gate was closed first.
struct DeferredVisitStart {
    slot: DeferredSlot,
    registry: Arc<dyn StableOperationRegistry>,
    state: SharedGateState,
}

impl DeferredTask for DeferredVisitStart {
    fn run(self: Box<Self>, run_state: TaskRunState, sender: &mut dyn MessageSender) {
        let DeferredVisitStart {
            slot,
            registry,
            state,
        } = *self;
        let Some((mut op, handle)) = take_deferred(&slot) else {
            return;
        };
        match run_state {
            TaskRunState::Ok => {
                tracing::debug!(
                    visitor = %op.request().instance_id,
                    shard = %handle.shard(),
                    "starting deferred read-for-write visit"
                );
                op.assign_lock_handle(handle);
                state.set(GateState::Running);
                registry.start_operation(op, sender);
            }
            TaskRunState::Aborted => {
                tracing::debug!(
                    visitor = %op.request().instance_id,
                    shard = %handle.shard(),
                    "deferred read-for-write visit abandoned"
                );
                drop(handle);
                op.fail_with_aborted(
                    "read-for-write visit abandoned while waiting for the shard",
                    sender,
                );
                state.set(GateState::Replied);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VisitorConfig;
    use crate::visit::memory::{
        MemoryOperationRegistry, MemoryPendingTracker, MemoryShardDatabase, RecordingSender,
        StaticClusterView, Topology,
    };
    use crate::visit::{ResultCode, ShardCopy, ShardEntry, ShardId, VisitRequest};

    struct Fixture {
        db: Arc<MemoryShardDatabase>,
        cluster: Arc<StaticClusterView>,
        tracker: Arc<MemoryPendingTracker>,
        registry: Arc<MemoryOperationRegistry>,
        sequencer: OperationSequencer,
    }

    fn shard() -> ShardId {
        ShardId::new(2, 0b01)
    }

    fn fixture() -> Fixture {
        let db = MemoryShardDatabase::new();
        db.upsert(ShardEntry {
            shard: shard(),
            copies: vec![ShardCopy {
                node: 1,
                trusted: true,
                doc_count: 4,
                total_bytes: 40,
                checksum: 1,
            }],
        });
        Fixture {
            db: Arc::new(db),
            cluster: Arc::new(StaticClusterView::new(
                2,
                Topology::owning("v1", vec![shard()]),
            )),
            tracker: Arc::new(MemoryPendingTracker::new()),
            registry: Arc::new(MemoryOperationRegistry::new()),
            sequencer: OperationSequencer::new(),
        }
    }

    fn gate(fx: &Fixture, request: VisitRequest) -> ExclusiveVisitGate {
        let op = VisitOperation::new(
            request,
            VisitorConfig::default(),
            fx.db.clone(),
            fx.cluster.clone(),
        );
        ExclusiveVisitGate::new(
            op,
            fx.sequencer.clone(),
            fx.tracker.clone(),
            fx.registry.clone(),
        )
    }

    fn rfw_request() -> VisitRequest {
        VisitRequest::new("rfw", "reindexingvisitor", shard())
    }

    #[test]
    fn idle_shard_starts_immediately_with_lock_token() {
        let fx = fixture();
        let mut gate = gate(&fx, rfw_request());
        let mut sender = RecordingSender::new();

        gate.on_start(&mut sender);
        assert_eq!(gate.state(), GateState::Running);
        assert!(gate.is_finished());
        assert_eq!(fx.registry.len(), 1);
        assert!(fx.sequencer.is_locked(&shard()));
        assert_eq!(sender.commands.len(), 1);
        assert!(sender.commands[0].lock_token().is_some());
    }

    #[test]
    fn verification_failure_never_takes_the_lock() {
        let fx = fixture();
        let mut request = rfw_request();
        request.max_shards_per_round = 2;
        let mut gate = gate(&fx, request);
        let mut sender = RecordingSender::new();

        gate.on_start(&mut sender);
        assert_eq!(gate.state(), GateState::Replied);
        assert_eq!(sender.replies[0].result.code, ResultCode::IllegalParameters);
        assert!(!fx.sequencer.is_locked(&shard()));
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            GateState::Idle,
            GateState::Verifying,
            GateState::LockPending,
            GateState::Deferred,
            GateState::Running,
            GateState::Replied,
        ] {
            assert_eq!(GateState::from_u8(state as u8), state);
        }
    }
}
