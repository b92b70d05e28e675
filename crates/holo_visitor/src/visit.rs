//! Visit protocol module wiring.
//!
//! `shard` defines the shard id and its canonical order, `types` holds the
//! request/command/reply shapes and the collaborator traits, `state` the
//! per-visit round plan. `expand`, `select`, `dispatch` and `aggregate` are the
//! engine pieces that `operation` glues together, and `gate` is the
//! read-for-write front that serializes a visit against writers of its shard.

mod aggregate;
mod context;
mod dispatch;
mod expand;
mod gate;
pub mod memory;
mod operation;
mod select;
mod sequencer;
mod shard;
mod state;
mod types;
mod verify;

pub use context::{create_operation, VisitContext};
pub use gate::{ExclusiveVisitGate, GateState};
pub use operation::{VisitOperation, VisitStatus};
pub use select::pick_target_node;
pub use sequencer::{LockToken, OperationSequencer, SequencingHandle};
pub use shard::{ParseShardIdError, ShardId, MAX_USED_BITS};
pub use state::{RoundPlan, ShardPhase, ShardRoundState};
pub use types::{
    ClusterView, CommandId, DeferredTask, MessageSender, NodeId, Operation,
    PendingMessageTracker, ResultCode, ReturnCode, ShardCopy, ShardDatabase, ShardEntry,
    ShardOwnership, StableOperationRegistry, TaskRunState, VisitCommand, VisitCommandReply,
    VisitReply, VisitRequest, VisitStatistics, LOCK_TOKEN_PARAMETER, NO_FIELDS_FIELD_SET,
    READ_FOR_WRITE_LIBRARY,
};
