//! Shared helpers for visit integration tests.
//!
//! The fixture cluster uses 2 distribution bits and owns super-shard `2:0x1`.
//! Inside it live three shards which sort as `A1 < A2 < B`.

#![allow(dead_code)]

use std::sync::Arc;

use holo_visitor::visit::memory::{
    MemoryOperationRegistry, MemoryPendingTracker, MemoryShardDatabase, RecordingSender,
    StaticClusterView, Topology,
};
use holo_visitor::visit::{
    create_operation, NodeId, OperationSequencer, ReturnCode, ShardCopy, ShardEntry, ShardId,
    StableOperationRegistry, VisitCommand, VisitContext, VisitReply, VisitRequest,
    VisitStatistics,
};
use holo_visitor::VisitorConfig;

pub fn super_shard() -> ShardId {
    ShardId::new(2, 0b01)
}

pub fn a1() -> ShardId {
    ShardId::new(4, 0b0001)
}

pub fn a2() -> ShardId {
    ShardId::new(4, 0b1001)
}

pub fn b() -> ShardId {
    ShardId::new(3, 0b101)
}

/// Wider shard left over from before the super-shard was split.
pub fn ancestor() -> ShardId {
    ShardId::new(1, 0b1)
}

/// Shard owned by a different super-shard.
pub fn outside() -> ShardId {
    ShardId::new(3, 0b011)
}

pub fn trusted(node: NodeId, doc_count: u32) -> ShardCopy {
    ShardCopy {
        node,
        trusted: true,
        doc_count,
        total_bytes: u64::from(doc_count) * 100,
        checksum: 7,
    }
}

pub fn untrusted(node: NodeId, doc_count: u32, checksum: u32) -> ShardCopy {
    ShardCopy {
        node,
        trusted: false,
        doc_count,
        total_bytes: u64::from(doc_count) * 100,
        checksum,
    }
}

pub fn entry(shard: ShardId, copies: Vec<ShardCopy>) -> ShardEntry {
    ShardEntry { shard, copies }
}

pub fn request(library: &str) -> VisitRequest {
    VisitRequest::new("client-visit", library, super_shard())
}

/// Coordinator-side world for one test: collaborators plus the sender that
/// captures everything operations emit.
pub struct Harness {
    pub db: Arc<MemoryShardDatabase>,
    pub cluster: Arc<StaticClusterView>,
    pub tracker: Arc<MemoryPendingTracker>,
    pub registry: Arc<MemoryOperationRegistry>,
    pub sequencer: OperationSequencer,
    pub sender: RecordingSender,
    pub config: VisitorConfig,
}

impl Harness {
    pub fn new(entries: Vec<ShardEntry>) -> Self {
        let topology = Topology::owning("distribution:2 version:1", vec![super_shard()]);
        Self::with_cluster(entries, StaticClusterView::new(2, topology))
    }

    pub fn with_cluster(entries: Vec<ShardEntry>, cluster: StaticClusterView) -> Self {
        Self {
            db: Arc::new(MemoryShardDatabase::from_entries(entries)),
            cluster: Arc::new(cluster),
            tracker: Arc::new(MemoryPendingTracker::new()),
            registry: Arc::new(MemoryOperationRegistry::new()),
            sequencer: OperationSequencer::new(),
            sender: RecordingSender::new(),
            config: VisitorConfig::default(),
        }
    }

    /// The fixture layout: A1, A2 and B on node 1, plus a shard outside the
    /// super-shard that must never be visited.
    pub fn three_shards() -> Self {
        Self::new(vec![
            entry(a1(), vec![trusted(1, 10)]),
            entry(a2(), vec![trusted(1, 20)]),
            entry(b(), vec![trusted(1, 30)]),
            entry(outside(), vec![trusted(1, 40)]),
        ])
    }

    pub fn context(&self) -> VisitContext {
        VisitContext {
            config: self.config,
            db: self.db.clone(),
            cluster: self.cluster.clone(),
            tracker: self.tracker.clone(),
            sequencer: self.sequencer.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Create the operation for `request` and start it through the registry.
    pub fn start(&mut self, request: VisitRequest) {
        let op = create_operation(request, &self.context());
        self.registry.start_operation(op, &mut self.sender);
    }

    pub fn take_commands(&mut self) -> Vec<VisitCommand> {
        self.sender.take_commands()
    }

    pub fn answer(&mut self, command: &VisitCommand, result: ReturnCode) {
        let statistics = if result.is_success() {
            stats_for(command)
        } else {
            VisitStatistics::default()
        };
        let reply = command.reply(result, statistics);
        assert!(
            self.registry.deliver(reply, &mut self.sender),
            "no operation owns command {}",
            command.command_id
        );
    }

    /// Answer every outstanding command successfully until none are left.
    pub fn answer_all_ok(&mut self) {
        loop {
            let commands = self.take_commands();
            if commands.is_empty() {
                return;
            }
            for command in &commands {
                self.answer(command, ReturnCode::ok());
            }
        }
    }

    pub fn single_reply(&self) -> &VisitReply {
        assert_eq!(self.sender.replies.len(), 1, "expected exactly one reply");
        &self.sender.replies[0]
    }
}

pub fn stats_for(command: &VisitCommand) -> VisitStatistics {
    VisitStatistics {
        shards_visited: command.shards.len() as u64,
        documents_visited: command.shards.len() as u64 * 10,
        bytes_visited: command.shards.len() as u64 * 1000,
        documents_returned: command.shards.len() as u64 * 10,
        bytes_returned: command.shards.len() as u64 * 1000,
    }
}
