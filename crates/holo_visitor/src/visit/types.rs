//! Shared types for the visit protocol.
//!
//! Request/command/reply shapes, result codes, and the trait contracts for the
//! collaborators the visit engine does not own: the shard database, the
//! cluster view, the message sender, the pending-message tracker, and the
//! stable operation registry.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ShardId;

/// Content node identifier.
pub type NodeId = u64;

/// Field-set marker meaning "return no fields at all".
pub const NO_FIELDS_FIELD_SET: &str = "[none]";
/// Library name reserved for read-for-write visits (matched case-insensitively).
pub const READ_FOR_WRITE_LIBRARY: &str = "reindexingvisitor";
/// Command parameter carrying the exclusive lock token to content nodes.
pub const LOCK_TOKEN_PARAMETER: &str = "__visit_lock_token";

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Result codes, numbered so that a larger value is more severe.
///
/// The `1xxxx` range is transient (another replica or a later retry may
/// succeed); the `2xxxx` range is fatal for the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ResultCode {
    Ok = 0,
    NotReady = 10001,
    WrongDistribution = 10002,
    Rejected = 10003,
    Aborted = 10004,
    BucketNotFound = 10005,
    BucketDeleted = 10006,
    Busy = 10007,
    Timeout = 10008,
    NotConnected = 10009,
    InternalFailure = 20001,
    IllegalParameters = 20002,
}

impl ResultCode {
    pub fn severity(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::NotReady => "NOT_READY",
            ResultCode::WrongDistribution => "WRONG_DISTRIBUTION",
            ResultCode::Rejected => "REJECTED",
            ResultCode::Aborted => "ABORTED",
            ResultCode::BucketNotFound => "BUCKET_NOT_FOUND",
            ResultCode::BucketDeleted => "BUCKET_DELETED",
            ResultCode::Busy => "BUSY",
            ResultCode::Timeout => "TIMEOUT",
            ResultCode::NotConnected => "NOT_CONNECTED",
            ResultCode::InternalFailure => "INTERNAL_FAILURE",
            ResultCode::IllegalParameters => "ILLEGAL_PARAMETERS",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A result code plus a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ReturnCode {
    pub code: ResultCode,
    pub message: String,
}

impl ReturnCode {
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            message: String::new(),
        }
    }

    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Ok
    }

    pub fn severity(&self) -> u32 {
        self.code.severity()
    }

    /// Whether a content node failure with this code must fail the whole
    /// visit instead of being retried against another replica.
    pub fn is_critical_for_visit_dispatch(&self) -> bool {
        !matches!(
            self.code,
            ResultCode::Ok
                | ResultCode::NotReady
                | ResultCode::WrongDistribution
                | ResultCode::Rejected
                | ResultCode::Aborted
                | ResultCode::BucketNotFound
                | ResultCode::BucketDeleted
                | ResultCode::Busy
                | ResultCode::Timeout
                | ResultCode::NotConnected
        )
    }
}

impl Default for ReturnCode {
    fn default() -> Self {
        Self::ok()
    }
}

/// Counters reported by content nodes and summed into the client reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitStatistics {
    pub shards_visited: u64,
    pub documents_visited: u64,
    pub bytes_visited: u64,
    pub documents_returned: u64,
    pub bytes_returned: u64,
}

impl AddAssign for VisitStatistics {
    fn add_assign(&mut self, rhs: Self) {
        self.shards_visited += rhs.shards_visited;
        self.documents_visited += rhs.documents_visited;
        self.bytes_visited += rhs.bytes_visited;
        self.documents_returned += rhs.documents_returned;
        self.bytes_returned += rhs.bytes_returned;
    }
}

/// One replica of a shard as recorded in the shard database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCopy {
    pub node: NodeId,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub doc_count: u32,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub checksum: u32,
}

/// A shard and its currently known replicas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub shard: ShardId,
    pub copies: Vec<ShardCopy>,
}

impl ShardEntry {
    /// True when at least one copy is trusted and all trusted copies agree on
    /// one checksum.
    pub fn is_consistent(&self) -> bool {
        let mut trusted = self.copies.iter().filter(|copy| copy.trusted);
        let Some(first) = trusted.next() else {
            return false;
        };
        trusted.all(|copy| copy.checksum == first.checksum)
    }

    pub fn copy_on(&self, node: NodeId) -> Option<&ShardCopy> {
        self.copies.iter().find(|copy| copy.node == node)
    }
}

/// Inbound client request for one round of a (possibly multi-round) visit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisitRequest {
    pub instance_id: String,
    pub library_name: String,
    /// `[super_shard]` or `[super_shard, resumption_cursor]`.
    pub shards: Vec<ShardId>,
    pub from_time: u64,
    /// Zero means "now".
    pub to_time: u64,
    pub document_selection: String,
    pub field_set: String,
    pub max_shards_per_round: u32,
    pub allow_inconsistent: bool,
    pub control_destination: String,
    pub timeout: Duration,
    pub max_pending_replies_per_command: u32,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl VisitRequest {
    pub fn new(
        instance_id: impl Into<String>,
        library_name: impl Into<String>,
        super_shard: ShardId,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            library_name: library_name.into(),
            shards: vec![super_shard],
            from_time: 0,
            to_time: 0,
            document_selection: String::new(),
            field_set: "[all]".to_string(),
            max_shards_per_round: 1,
            allow_inconsistent: false,
            control_destination: String::new(),
            timeout: Duration::from_secs(180),
            max_pending_replies_per_command: 8,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_cursor(mut self, cursor: ShardId) -> Self {
        self.shards.truncate(1);
        if cursor.is_set() {
            self.shards.push(cursor);
        }
        self
    }

    pub fn super_shard(&self) -> Option<ShardId> {
        self.shards.first().copied()
    }

    pub fn resumption_cursor(&self) -> ShardId {
        self.shards.get(1).copied().unwrap_or(ShardId::UNSET)
    }

    pub fn is_read_for_write(&self) -> bool {
        self.library_name.eq_ignore_ascii_case(READ_FOR_WRITE_LIBRARY)
    }
}

/// Identity of one in-flight command; replies carry it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub u64);

impl CommandId {
    pub fn next() -> Self {
        CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scoped visit command sent to one content node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisitCommand {
    pub command_id: CommandId,
    pub target: NodeId,
    pub shards: Vec<ShardId>,
    pub instance_id: String,
    pub library_name: String,
    pub document_selection: String,
    pub field_set: String,
    pub from_time: u64,
    pub to_time: u64,
    pub control_destination: String,
    pub timeout: Duration,
    pub queue_timeout: Duration,
    pub max_pending_replies: u32,
    pub parameters: BTreeMap<String, String>,
}

impl VisitCommand {
    pub fn lock_token(&self) -> Option<&str> {
        self.parameters.get(LOCK_TOKEN_PARAMETER).map(String::as_str)
    }

    /// Build the reply a content node sends back for this command.
    pub fn reply(&self, result: ReturnCode, statistics: VisitStatistics) -> VisitCommandReply {
        VisitCommandReply {
            command_id: self.command_id,
            result,
            statistics,
            trace: Vec::new(),
        }
    }
}

/// Content node reply to a `VisitCommand`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisitCommandReply {
    pub command_id: CommandId,
    pub result: ReturnCode,
    pub statistics: VisitStatistics,
    #[serde(default)]
    pub trace: Vec<String>,
}

/// The single reply sent back to the client for a visit request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisitReply {
    pub instance_id: String,
    pub result: ReturnCode,
    pub resumption_cursor: ShardId,
    pub statistics: VisitStatistics,
    pub trace: Vec<String>,
}

/// Read access to the coordinator's shard database.
///
/// All lookups observe the canonical `ShardId` order.
pub trait ShardDatabase: Send + Sync + 'static {
    fn get(&self, shard: &ShardId) -> Option<ShardEntry>;

    /// Entries whose shard contains `shard`, including an exact match.
    fn parents_of(&self, shard: &ShardId) -> Vec<ShardEntry>;

    /// First entry strictly after `shard` in canonical order.
    fn next_after(&self, shard: &ShardId) -> Option<ShardEntry>;
}

/// Result of an ownership check against the cluster topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardOwnership {
    Owned,
    /// Not owned under the described topology; clients use the description to
    /// redirect.
    NotOwned { topology: String },
}

/// Coordinator's view of cluster membership and shard ownership.
pub trait ClusterView: Send + Sync + 'static {
    fn has_available_coordinators(&self) -> bool;
    fn distribution_bits(&self) -> u8;
    fn coordinator_index(&self) -> u16;
    fn topology_description(&self) -> String;

    /// Ownership under both the pending and the active topology; a shard is
    /// only owned when both agree.
    fn check_ownership(&self, shard: &ShardId) -> ShardOwnership;
}

/// Outbound message sink of the event loop that runs an operation.
pub trait MessageSender {
    fn send_command(&mut self, command: VisitCommand);
    fn send_reply(&mut self, reply: VisitReply);
}

/// Whether a deferred task runs normally or is being torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskRunState {
    Ok,
    Aborted,
}

/// One-shot continuation handed to the pending-message tracker.
pub trait DeferredTask: Send {
    fn run(self: Box<Self>, state: TaskRunState, sender: &mut dyn MessageSender);
}

/// Knows which operations are outstanding against each shard.
pub trait PendingMessageTracker: Send + Sync + 'static {
    fn has_pending_merge(&self, shard: &ShardId) -> bool;

    /// Run `task` once nothing is pending against `shard`; immediately when
    /// that already holds.
    fn run_once_no_pending_for_shard(
        &self,
        shard: ShardId,
        task: Box<dyn DeferredTask>,
        sender: &mut dyn MessageSender,
    );
}

/// Event-driven operation run on a coordinator stripe.
pub trait Operation: Send {
    fn name(&self) -> &'static str;
    fn on_start(&mut self, sender: &mut dyn MessageSender);
    fn on_receive(&mut self, sender: &mut dyn MessageSender, reply: VisitCommandReply);
    fn on_close(&mut self, sender: &mut dyn MessageSender);
    fn owns_command(&self, command_id: CommandId) -> bool;

    /// Replied and with nothing in flight.
    fn is_finished(&self) -> bool;
}

/// Long-lived registry that owns started operations and routes their replies.
pub trait StableOperationRegistry: Send + Sync + 'static {
    fn start_operation(&self, op: Box<dyn Operation>, sender: &mut dyn MessageSender);
}
