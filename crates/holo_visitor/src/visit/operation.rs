//! One client visit round on the coordinator.
//!
//! `VisitOperation` owns the round plan and every in-flight command. It is
//! driven entirely by callbacks from the event loop (start, command reply,
//! close), so none of its state needs locking. The flow is:
//! verify once, expand the super-shard into this round's plan, pick a replica
//! for every pending shard, batch shards per node into commands, and on each
//! reply mark shards done or retry them elsewhere. When nothing is in flight
//! and nothing more can be sent, exactly one reply goes back to the client.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time::Instant;

use super::aggregate::ReplyAggregator;
use super::dispatch::{batch_by_node, CommandTemplate};
use super::expand::expand_round;
use super::select::pick_target_node;
use super::verify::verify_request;
use super::{
    ClusterView, CommandId, MessageSender, NodeId, Operation, ResultCode, ReturnCode, RoundPlan,
    SequencingHandle, ShardDatabase, ShardId, VisitCommandReply, VisitReply, VisitRequest,
};
use crate::config::VisitorConfig;

#[derive(Debug)]
struct InFlightCommand {
    target: NodeId,
    shards: Vec<ShardId>,
}

/// Point-in-time view of an operation's progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisitStatus {
    pub verified: bool,
    pub reply_sent: bool,
    pub in_flight: usize,
    pub active_shards: usize,
    pub planned: usize,
    pub done: usize,
    pub fully_expanded: bool,
    pub result: ReturnCode,
}

pub struct VisitOperation {
    request: VisitRequest,
    config: VisitorConfig,
    db: Arc<dyn ShardDatabase>,
    cluster: Arc<dyn ClusterView>,
    plan: RoundPlan,
    start_cursor: ShardId,
    in_flight: BTreeMap<CommandId, InFlightCommand>,
    active_per_node: BTreeMap<NodeId, u32>,
    aggregator: ReplyAggregator,
    deadline: Instant,
    timed_out: bool,
    verified: bool,
    reply_sent: bool,
    lock_handle: Option<SequencingHandle>,
}

impl VisitOperation {
    /// Build an operation for one round of `request`.
    ///
    /// The overall deadline starts counting now, so time spent waiting for a
    /// read-for-write lock is part of the visit's budget.
    pub fn new(
        request: VisitRequest,
        config: VisitorConfig,
        db: Arc<dyn ShardDatabase>,
        cluster: Arc<dyn ClusterView>,
    ) -> Self {
        let plan = RoundPlan::new(request.super_shard().unwrap_or(ShardId::UNSET));
        let start_cursor = request.resumption_cursor();
        let deadline = Instant::now() + request.timeout;
        Self {
            request,
            config,
            db,
            cluster,
            plan,
            start_cursor,
            in_flight: BTreeMap::new(),
            active_per_node: BTreeMap::new(),
            aggregator: ReplyAggregator::default(),
            deadline,
            timed_out: false,
            verified: false,
            reply_sent: false,
            lock_handle: None,
        }
    }

    pub fn request(&self) -> &VisitRequest {
        &self.request
    }

    pub fn plan(&self) -> &RoundPlan {
        &self.plan
    }

    pub fn status(&self) -> VisitStatus {
        VisitStatus {
            verified: self.verified,
            reply_sent: self.reply_sent,
            in_flight: self.in_flight.len(),
            active_shards: self.plan.active_count(),
            planned: self.plan.len(),
            done: self.plan.done_count(),
            fully_expanded: self.plan.fully_expanded,
            result: self.aggregator.result().clone(),
        }
    }

    /// Verify the request (once) and expand this round's plan.
    ///
    /// Returns `false` when verification failed; the failure reply has then
    /// already been sent.
    pub fn verify_and_expand(&mut self, sender: &mut dyn MessageSender) -> bool {
        if self.reply_sent {
            return false;
        }
        if !self.verified {
            if let Err(err) = verify_request(&self.request, self.cluster.as_ref()) {
                tracing::debug!(
                    visitor = %self.request.instance_id,
                    error = %err,
                    "visit request failed verification"
                );
                self.aggregator.merge_critical(err);
                self.send_reply(sender);
                return false;
            }
            self.verified = true;
        }
        expand_round(
            &mut self.plan,
            self.db.as_ref(),
            self.start_cursor,
            self.request.max_shards_per_round as usize,
        );
        true
    }

    pub fn first_shard_to_visit(&self) -> Option<ShardId> {
        self.plan.first()
    }

    pub(super) fn coordinator_index(&self) -> u16 {
        self.cluster.coordinator_index()
    }

    /// Hand the operation the exclusive lock it runs under. The lock is
    /// released together with the reply.
    pub fn assign_lock_handle(&mut self, handle: SequencingHandle) {
        self.lock_handle = Some(handle);
    }

    pub fn fail_with_merge_pending(&mut self, shard: ShardId, sender: &mut dyn MessageSender) {
        self.fail_terminal(
            ReturnCode::new(
                ResultCode::Busy,
                format!("a merge operation is pending for shard {shard}"),
            ),
            sender,
        );
    }

    pub fn fail_with_shard_already_locked(
        &mut self,
        shard: ShardId,
        sender: &mut dyn MessageSender,
    ) {
        self.fail_terminal(
            ReturnCode::new(
                ResultCode::Busy,
                format!("shard {shard} is already locked by another read-for-write visit"),
            ),
            sender,
        );
    }

    pub fn fail_with_aborted(&mut self, message: &str, sender: &mut dyn MessageSender) {
        self.fail_terminal(ReturnCode::new(ResultCode::Aborted, message), sender);
    }

    fn fail_terminal(&mut self, result: ReturnCode, sender: &mut dyn MessageSender) {
        self.aggregator.merge_critical(result);
        self.send_reply(sender);
    }

    fn available_on(&self, node: NodeId) -> u32 {
        let active = self.active_per_node.get(&node).copied().unwrap_or(0);
        self.config
            .max_visitors_per_node_per_client_visitor
            .saturating_sub(active)
    }

    /// Dispatch whatever can be dispatched, then reply if nothing is left in
    /// flight.
    ///
    /// Shards without a replica never hold back the rest of the round: they
    /// are only escalated once every planned shard has settled.
    pub(super) fn start_new_visitors(&mut self, sender: &mut dyn MessageSender) {
        if self.reply_sent {
            return;
        }
        if !self.timed_out && Instant::now() >= self.deadline {
            self.timed_out = true;
            tracing::warn!(
                visitor = %self.request.instance_id,
                in_flight = self.in_flight.len(),
                "visit timed out"
            );
            self.aggregator.merge_ordinary(ReturnCode::new(
                ResultCode::Aborted,
                format!("visit timed out after {:?}", self.request.timeout),
            ));
        }

        if self.aggregator.is_success() {
            expand_round(
                &mut self.plan,
                self.db.as_ref(),
                self.start_cursor,
                self.request.max_shards_per_round as usize,
            );
            let assignments = self.assign_pending_shards();
            if !assignments.is_empty() {
                self.send_commands(&assignments, sender);
            }
        }

        if self.in_flight.is_empty() {
            if self.plan.all_terminal() {
                self.escalate_exhausted();
            }
            self.send_reply(sender);
        }
    }

    /// Pick a node for every pending shard. Shards with no candidate left are
    /// marked exhausted; shards whose node has no free command slot stay
    /// pending for a later pass.
    fn assign_pending_shards(&mut self) -> Vec<(ShardId, NodeId)> {
        let mut assignments = Vec::new();
        for shard in self.plan.pending() {
            let tried = self
                .plan
                .state(&shard)
                .map(|state| state.tried_nodes.clone())
                .unwrap_or_default();
            let target = self
                .db
                .get(&shard)
                .and_then(|entry| pick_target_node(&entry, &tried));
            match target {
                Some(node) => {
                    if self.available_on(node) > 0 {
                        assignments.push((shard, node));
                    }
                }
                None => {
                    if let Some(state) = self.plan.state_mut(&shard) {
                        state.exhausted = true;
                    }
                }
            }
        }
        assignments
    }

    fn escalate_exhausted(&mut self) {
        if self.request.allow_inconsistent
            || !self.aggregator.is_success()
            || !self.plan.has_exhausted()
        {
            return;
        }
        let Some(shard) = self
            .plan
            .shards_in_order
            .iter()
            .find(|shard| self.plan.state(shard).is_some_and(|state| state.exhausted))
            .copied()
        else {
            return;
        };
        tracing::debug!(
            visitor = %self.request.instance_id,
            shard = %shard,
            "no replica left to visit shard"
        );
        self.aggregator.merge_ordinary(ReturnCode::new(
            ResultCode::BucketNotFound,
            format!("no available replica left for shard {shard}"),
        ));
    }

    fn send_commands(&mut self, assignments: &[(ShardId, NodeId)], sender: &mut dyn MessageSender) {
        let batches = batch_by_node(
            assignments,
            |node| self.available_on(node),
            self.config.min_shards_per_command,
        );
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let template = CommandTemplate::new(
            &self.request,
            self.cluster.coordinator_index(),
            remaining,
            self.lock_handle.as_ref().map(|handle| handle.token().as_str()),
            batches.len(),
        );
        let commands: Vec<_> = batches
            .into_iter()
            .map(|(node, shards)| template.build(node, shards))
            .collect();

        for command in commands {
            for shard in &command.shards {
                if let Some(state) = self.plan.state_mut(shard) {
                    state.active_node = Some(command.target);
                }
            }
            *self.active_per_node.entry(command.target).or_insert(0) += 1;
            self.in_flight.insert(
                command.command_id,
                InFlightCommand {
                    target: command.target,
                    shards: command.shards.clone(),
                },
            );
            tracing::debug!(
                visitor = %self.request.instance_id,
                command = %command.command_id,
                node = command.target,
                shards = command.shards.len(),
                "sending visit command"
            );
            sender.send_command(command);
        }
    }

    fn send_reply(&mut self, sender: &mut dyn MessageSender) {
        if self.reply_sent {
            return;
        }
        self.reply_sent = true;

        let cursor = self
            .plan
            .resumption_cursor(self.start_cursor, self.request.allow_inconsistent);
        self.aggregator.push_trace(format!(
            "visited {} of {} planned shards, resuming after {cursor}",
            self.plan.done_count(),
            self.plan.len()
        ));
        let result = self.aggregator.result().clone();
        tracing::debug!(
            visitor = %self.request.instance_id,
            result = %result.code,
            cursor = %cursor,
            "sending visit reply"
        );
        sender.send_reply(VisitReply {
            instance_id: self.request.instance_id.clone(),
            result,
            resumption_cursor: cursor,
            statistics: self.aggregator.statistics(),
            trace: self.aggregator.take_trace(),
        });
        self.lock_handle = None;
    }
}

impl Operation for VisitOperation {
    fn name(&self) -> &'static str {
        "visit"
    }

    fn on_start(&mut self, sender: &mut dyn MessageSender) {
        if self.verify_and_expand(sender) {
            self.start_new_visitors(sender);
        }
    }

    fn on_receive(&mut self, sender: &mut dyn MessageSender, mut reply: VisitCommandReply) {
        let Some(command) = self.in_flight.remove(&reply.command_id) else {
            tracing::warn!(
                visitor = %self.request.instance_id,
                command = %reply.command_id,
                "reply for unknown visit command"
            );
            return;
        };
        if let Some(active) = self.active_per_node.get_mut(&command.target) {
            *active = active.saturating_sub(1);
        }

        if !reply.result.is_success() && reply.result.is_critical_for_visit_dispatch() {
            tracing::warn!(
                visitor = %self.request.instance_id,
                node = command.target,
                error = %reply.result,
                "content node failed visit command"
            );
        }
        let ok = self.aggregator.absorb(command.target, &mut reply);
        for shard in &command.shards {
            let Some(state) = self.plan.state_mut(shard) else {
                continue;
            };
            state.active_node = None;
            if ok {
                state.done = true;
            } else {
                state.failed_attempts += 1;
                state.tried_nodes.insert(command.target);
            }
        }

        self.start_new_visitors(sender);
    }

    fn on_close(&mut self, sender: &mut dyn MessageSender) {
        self.in_flight.clear();
        self.active_per_node.clear();
        if !self.reply_sent {
            self.aggregator
                .merge_ordinary(ReturnCode::new(ResultCode::Aborted, "visit operation closed"));
            self.send_reply(sender);
        }
        self.lock_handle = None;
    }

    fn owns_command(&self, command_id: CommandId) -> bool {
        self.in_flight.contains_key(&command_id)
    }

    fn is_finished(&self) -> bool {
        self.reply_sent && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visit::memory::{MemoryShardDatabase, RecordingSender, StaticClusterView, Topology};
    use crate::visit::{ShardCopy, ShardEntry, VisitCommand, VisitStatistics};

    fn super_shard() -> ShardId {
        ShardId::new(2, 0b01)
    }

    fn entry(shard: ShardId, nodes: &[NodeId]) -> ShardEntry {
        ShardEntry {
            shard,
            copies: nodes
                .iter()
                .map(|node| ShardCopy {
                    node: *node,
                    trusted: true,
                    doc_count: 10,
                    total_bytes: 100,
                    checksum: 1,
                })
                .collect(),
        }
    }

    fn operation(request: VisitRequest, entries: Vec<ShardEntry>) -> VisitOperation {
        let db = Arc::new(MemoryShardDatabase::from_entries(entries));
        let cluster = Arc::new(StaticClusterView::new(
            2,
            Topology::owning("v1", vec![super_shard()]),
        ));
        VisitOperation::new(request, VisitorConfig::default(), db, cluster)
    }

    fn ok_reply(command: &VisitCommand) -> VisitCommandReply {
        command.reply(
            ReturnCode::ok(),
            VisitStatistics {
                shards_visited: command.shards.len() as u64,
                ..Default::default()
            },
        )
    }

    #[test]
    fn shards_on_one_node_share_a_command() {
        let a = ShardId::new(4, 0b0001);
        let b = ShardId::new(4, 0b1001);
        let mut req = VisitRequest::new("v", "dumpvisitor", super_shard());
        req.max_shards_per_round = 10;
        let mut op = operation(req, vec![entry(a, &[1]), entry(b, &[1])]);
        let mut sender = RecordingSender::new();

        op.on_start(&mut sender);
        let commands = sender.take_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].shards, vec![a, b]);
        assert_eq!(op.plan().state(&a).unwrap().active_node, Some(1));
        assert_eq!(op.status().active_shards, 2);

        op.on_receive(&mut sender, ok_reply(&commands[0]));
        assert!(op.is_finished());
        assert_eq!(sender.replies.len(), 1);
        assert_eq!(sender.replies[0].resumption_cursor, ShardId::MAX_SENTINEL);
        assert_eq!(sender.replies[0].statistics.shards_visited, 2);
    }

    #[test]
    fn failed_shard_moves_to_next_replica() {
        let a = ShardId::new(4, 0b0001);
        let mut op = operation(
            VisitRequest::new("v", "dumpvisitor", super_shard()),
            vec![entry(a, &[1, 2])],
        );
        let mut sender = RecordingSender::new();

        op.on_start(&mut sender);
        let first = sender.take_commands();
        assert_eq!(first[0].target, 1);
        op.on_receive(
            &mut sender,
            first[0].reply(ReturnCode::new(ResultCode::Busy, "busy"), Default::default()),
        );

        let second = sender.take_commands();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].target, 2);
        let state = op.plan().state(&a).unwrap();
        assert_eq!(state.failed_attempts, 1);
        assert!(state.tried_nodes.contains(&1));

        op.on_receive(&mut sender, ok_reply(&second[0]));
        assert_eq!(sender.replies.len(), 1);
        assert!(sender.replies[0].result.is_success());
    }

    #[test]
    fn node_slots_bound_concurrent_commands() {
        let shards: Vec<ShardId> = (0..3u64).map(|i| ShardId::new(4, (i << 2) | 0b01)).collect();
        let mut req = VisitRequest::new("v", "dumpvisitor", super_shard());
        req.max_shards_per_round = 10;
        let db = Arc::new(MemoryShardDatabase::from_entries(
            shards.iter().map(|s| entry(*s, &[1])),
        ));
        let cluster = Arc::new(StaticClusterView::new(
            2,
            Topology::owning("v1", vec![super_shard()]),
        ));
        let config = VisitorConfig {
            max_visitors_per_node_per_client_visitor: 2,
            min_shards_per_command: 1,
        };
        let mut op = VisitOperation::new(req, config, db, cluster);
        let mut sender = RecordingSender::new();

        op.on_start(&mut sender);
        let commands = sender.take_commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(op.status().in_flight, 2);
        assert_eq!(commands.iter().map(|c| c.shards.len()).sum::<usize>(), 3);
    }

    #[test]
    fn unknown_reply_is_ignored() {
        let a = ShardId::new(4, 0b0001);
        let mut op = operation(
            VisitRequest::new("v", "dumpvisitor", super_shard()),
            vec![entry(a, &[1])],
        );
        let mut sender = RecordingSender::new();
        op.on_start(&mut sender);
        let stray = VisitCommandReply {
            command_id: CommandId(u64::MAX),
            result: ReturnCode::ok(),
            statistics: Default::default(),
            trace: Vec::new(),
        };
        op.on_receive(&mut sender, stray);
        assert!(sender.replies.is_empty());
        assert_eq!(op.status().in_flight, 1);
    }

    #[test]
    fn verification_failure_replies_with_start_cursor() {
        let cursor = ShardId::new(4, 0b0001);
        let mut req = VisitRequest::new("v", "dumpvisitor", super_shard()).with_cursor(cursor);
        req.field_set = "[none]".into();
        let mut op = operation(req, Vec::new());
        let mut sender = RecordingSender::new();

        op.on_start(&mut sender);
        assert!(sender.commands.is_empty());
        assert_eq!(sender.replies.len(), 1);
        assert_eq!(sender.replies[0].result.code, ResultCode::IllegalParameters);
        assert_eq!(sender.replies[0].resumption_cursor, cursor);
        assert!(!op.verify_and_expand(&mut sender));
        assert_eq!(sender.replies.len(), 1);
    }

    #[test]
    fn close_clears_in_flight_and_replies_once() {
        let a = ShardId::new(4, 0b0001);
        let mut op = operation(
            VisitRequest::new("v", "dumpvisitor", super_shard()),
            vec![entry(a, &[1])],
        );
        let mut sender = RecordingSender::new();
        op.on_start(&mut sender);
        op.on_close(&mut sender);
        op.on_close(&mut sender);
        assert_eq!(sender.replies.len(), 1);
        assert_eq!(sender.replies[0].result.code, ResultCode::Aborted);
        assert_eq!(sender.replies[0].resumption_cursor, ShardId::UNSET);
        assert!(op.is_finished());
    }
}
