use std::sync::Arc;

use super::{
    ClusterView, ExclusiveVisitGate, Operation, OperationSequencer, PendingMessageTracker,
    ShardDatabase, StableOperationRegistry, VisitOperation, VisitRequest,
};
use crate::config::VisitorConfig;

/// Everything a coordinator stripe shares between the visits it runs.
#[derive(Clone)]
pub struct VisitContext {
    pub config: VisitorConfig,
    pub db: Arc<dyn ShardDatabase>,
    pub cluster: Arc<dyn ClusterView>,
    pub tracker: Arc<dyn PendingMessageTracker>,
    pub sequencer: OperationSequencer,
    pub registry: Arc<dyn StableOperationRegistry>,
}

/// Build the operation that serves `request`.
///
/// Read-for-write visits are wrapped in an `ExclusiveVisitGate`; everything
/// else runs as a plain `VisitOperation`.
pub fn create_operation(request: VisitRequest, ctx: &VisitContext) -> Box<dyn Operation> {
    let read_for_write = request.is_read_for_write();
    let op = VisitOperation::new(request, ctx.config, ctx.db.clone(), ctx.cluster.clone());
    if read_for_write {
        Box::new(ExclusiveVisitGate::new(
            op,
            ctx.sequencer.clone(),
            ctx.tracker.clone(),
            ctx.registry.clone(),
        ))
    } else {
        Box::new(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visit::memory::{
        MemoryOperationRegistry, MemoryPendingTracker, MemoryShardDatabase, StaticClusterView,
        Topology,
    };
    use crate::visit::ShardId;

    fn context() -> VisitContext {
        VisitContext {
            config: VisitorConfig::default(),
            db: Arc::new(MemoryShardDatabase::new()),
            cluster: Arc::new(StaticClusterView::new(
                2,
                Topology::owning("v1", vec![ShardId::new(2, 1)]),
            )),
            tracker: Arc::new(MemoryPendingTracker::new()),
            sequencer: OperationSequencer::new(),
            registry: Arc::new(MemoryOperationRegistry::new()),
        }
    }

    #[test]
    fn read_for_write_requests_get_the_gate() {
        let ctx = context();
        let shard = ShardId::new(2, 1);
        let rfw = create_operation(VisitRequest::new("a", "ReindexingVisitor", shard), &ctx);
        let plain = create_operation(VisitRequest::new("b", "dumpvisitor", shard), &ctx);
        assert_eq!(rfw.name(), "read_for_write_visit_gate");
        assert_eq!(plain.name(), "visit");
    }
}
