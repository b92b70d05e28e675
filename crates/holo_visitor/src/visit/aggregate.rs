//! Severity-ranked merging of command outcomes.

use super::{NodeId, ReturnCode, VisitCommandReply, VisitStatistics};

/// Running outcome of one visit.
#[derive(Debug, Default)]
pub(super) struct ReplyAggregator {
    result: ReturnCode,
    statistics: VisitStatistics,
    trace: Vec<String>,
}

impl ReplyAggregator {
    pub(super) fn result(&self) -> &ReturnCode {
        &self.result
    }

    pub(super) fn is_success(&self) -> bool {
        self.result.is_success()
    }

    pub(super) fn statistics(&self) -> VisitStatistics {
        self.statistics
    }

    /// Overwrite the running result unconditionally.
    pub(super) fn merge_critical(&mut self, result: ReturnCode) {
        self.result = result;
    }

    /// Take `result` only when it is strictly more severe than what is held.
    pub(super) fn merge_ordinary(&mut self, result: ReturnCode) {
        if result.severity() > self.result.severity() {
            self.result = result;
        }
    }

    /// Fold one content node reply in.
    ///
    /// Successful replies contribute statistics. Failures that are critical for
    /// dispatch overwrite the result, tagged with the failing node; other
    /// failures are left to replica retry and do not touch the result.
    ///
    /// Returns whether the reply succeeded.
    pub(super) fn absorb(&mut self, node: NodeId, reply: &mut VisitCommandReply) -> bool {
        self.trace.append(&mut reply.trace);
        if reply.result.is_success() {
            self.statistics += reply.statistics;
            return true;
        }
        if reply.result.is_critical_for_visit_dispatch() {
            self.merge_critical(ReturnCode::new(
                reply.result.code,
                format!("[from content node {node}] {}", reply.result.message),
            ));
        }
        false
    }

    pub(super) fn push_trace(&mut self, line: String) {
        self.trace.push(line);
    }

    pub(super) fn take_trace(&mut self) -> Vec<String> {
        std::mem::take(&mut self.trace)
    }
}
