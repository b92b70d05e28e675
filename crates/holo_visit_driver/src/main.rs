//! Visit driver for exercising the coordinator visit protocol.
//!
//! This binary loads a cluster snapshot, plays a client that visits one
//! super-shard round by round (each request carries the previous reply's
//! cursor), simulates the content nodes, and writes a JSON history of every
//! round for later inspection.

use std::collections::{BTreeMap, BTreeSet};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_visitor::visit::memory::{
    ClusterSnapshot, MemoryOperationRegistry, MemoryPendingTracker, MemoryShardDatabase,
};
use holo_visitor::visit::{
    create_operation, CommandId, MessageSender, NodeId, OperationSequencer, ResultCode,
    ReturnCode, ShardDatabase, ShardId, StableOperationRegistry, VisitCommand, VisitCommandReply,
    VisitContext, VisitReply, VisitRequest, VisitStatistics,
};
use holo_visitor::VisitorConfig;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-visit-driver")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for a multi-round visit.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// JSON cluster snapshot: `{"cluster": {...}, "shards": [...]}`.
    #[arg(long, env = "HOLO_VISIT_SNAPSHOT")]
    snapshot: PathBuf,

    /// Super-shard to visit, as `bits:raw` (e.g. `2:0x1`).
    #[arg(long)]
    super_shard: ShardId,

    /// Shards planned per round.
    #[arg(long, default_value_t = 1)]
    max_shards_per_round: u32,

    /// Visitor library; `reindexingvisitor` runs read-for-write visits.
    #[arg(long, default_value = "dumpvisitor")]
    library: String,

    /// Skip shards that have no usable replica instead of failing.
    #[arg(long, default_value_t = false)]
    allow_inconsistent: bool,

    /// Comma-separated node ids that answer every command with NOT_CONNECTED.
    #[arg(long)]
    fail_nodes: Option<String>,

    /// Percent of commands a healthy node answers with BUSY.
    #[arg(long, default_value_t = 0)]
    fault_pct: u8,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Overall timeout of each visit round.
    #[arg(long, env = "HOLO_VISIT_TIMEOUT", default_value = "10s")]
    timeout: humantime::Duration,

    /// Simulated per-command latency on content nodes.
    #[arg(long, default_value = "1ms")]
    node_latency: humantime::Duration,

    /// Stop after this many rounds even if the visit is not complete.
    #[arg(long, default_value_t = 1000)]
    max_rounds: usize,

    /// Write a JSON history of every round to this path.
    #[arg(long, default_value = ".tmp/visits/history.json")]
    out: PathBuf,
}

/// Metadata embedded in the history file for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct HistoryMeta {
    snapshot: String,
    super_shard: ShardId,
    library: String,
    max_shards_per_round: u32,
    allow_inconsistent: bool,
    fail_nodes: Vec<NodeId>,
    fault_pct: u8,
    seed: u64,
    timeout_ms: u64,
    config: VisitorConfig,
}

/// How the run ended.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum RunOutcome {
    /// The coordinator returned the end-of-super-shard cursor.
    Completed,
    /// A round failed without moving the cursor.
    Failed,
    /// A round succeeded without moving the cursor.
    Stalled,
    MaxRounds,
}

/// Full run history.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct History {
    meta: HistoryMeta,
    outcome: RunOutcome,
    totals: VisitStatistics,
    rounds: Vec<RoundRecord>,
}

/// One client round: the request cursor, the reply, and every command sent.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct RoundRecord {
    round: usize,
    cursor_in: ShardId,
    cursor_out: ShardId,
    result: ReturnCode,
    statistics: VisitStatistics,
    elapsed_us: u64,
    commands: Vec<CommandRecord>,
}

/// One visit command and how its node answered.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct CommandRecord {
    command_id: CommandId,
    node: NodeId,
    shards: Vec<ShardId>,
    result: Option<ResultCode>,
}

/// How a simulated content node answers commands.
#[derive(Debug, Clone, Copy)]
struct NodeBehavior {
    down: bool,
    fault_pct: u8,
    latency: Duration,
    seed: u64,
}

/// Message sender that routes commands to simulated nodes and keeps the
/// client replies and a record of every command for the history.
struct ChannelSender {
    nodes: BTreeMap<NodeId, mpsc::UnboundedSender<VisitCommand>>,
    sent: Vec<CommandRecord>,
    replies: Vec<VisitReply>,
}

impl ChannelSender {
    fn new(nodes: BTreeMap<NodeId, mpsc::UnboundedSender<VisitCommand>>) -> Self {
        Self {
            nodes,
            sent: Vec::new(),
            replies: Vec::new(),
        }
    }

    fn record_result(&mut self, reply: &VisitCommandReply) {
        if let Some(record) = self
            .sent
            .iter_mut()
            .find(|record| record.command_id == reply.command_id)
        {
            record.result = Some(reply.result.code);
        }
    }

    fn take_sent(&mut self) -> Vec<CommandRecord> {
        std::mem::take(&mut self.sent)
    }
}

impl MessageSender for ChannelSender {
    fn send_command(&mut self, command: VisitCommand) {
        self.sent.push(CommandRecord {
            command_id: command.command_id,
            node: command.target,
            shards: command.shards.clone(),
            result: None,
        });
        let node = command.target;
        match self.nodes.get(&node) {
            Some(tx) => {
                if tx.send(command).is_err() {
                    tracing::warn!(node, "simulated node stopped; command dropped");
                }
            }
            None => tracing::warn!(node, "command for unknown node dropped"),
        }
    }

    fn send_reply(&mut self, reply: VisitReply) {
        self.replies.push(reply);
    }
}

#[tokio::main(flavor = "current_thread")]
/// Parse CLI args, initialize logging, and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => {
            let out = args.out.clone();
            let history = run(args).await?;
            tracing::info!(
                outcome = ?history.outcome,
                rounds = history.rounds.len(),
                shards_visited = history.totals.shards_visited,
                documents_visited = history.totals.documents_visited,
                history = %out.display(),
                "visit run finished"
            );
            if history.outcome == RunOutcome::Failed {
                let last = history.rounds.last().map(|round| round.result.to_string());
                anyhow::bail!(
                    "visit failed without progress: {}",
                    last.unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}

/// Run rounds until the super-shard is done, then write the history file.
async fn run(args: RunArgs) -> anyhow::Result<History> {
    anyhow::ensure!(args.fault_pct <= 100, "--fault-pct must be <= 100");
    anyhow::ensure!(args.max_rounds > 0, "--max-rounds must be > 0");
    anyhow::ensure!(
        args.max_shards_per_round > 0,
        "--max-shards-per-round must be > 0"
    );

    let raw = std::fs::read_to_string(&args.snapshot)
        .with_context(|| format!("read snapshot {}", args.snapshot.display()))?;
    let snapshot = ClusterSnapshot::from_json(&raw)
        .with_context(|| format!("load snapshot {}", args.snapshot.display()))?;
    let fail_nodes = parse_nodes(args.fail_nodes.as_deref().unwrap_or(""))?;

    let config = VisitorConfig::default().with_env_overrides();
    config.validate()?;

    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let timeout: Duration = args.timeout.into();

    let db = Arc::new(snapshot.database());
    let registry = Arc::new(MemoryOperationRegistry::new());
    let ctx = VisitContext {
        config,
        db: db.clone(),
        cluster: Arc::new(snapshot.cluster.clone()),
        tracker: Arc::new(MemoryPendingTracker::new()),
        sequencer: OperationSequencer::new(),
        registry: registry.clone(),
    };

    let node_ids: BTreeSet<NodeId> = snapshot
        .shards
        .iter()
        .flat_map(|entry| entry.copies.iter().map(|copy| copy.node))
        .collect();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let mut nodes = BTreeMap::new();
    for node in node_ids {
        let (tx, rx) = mpsc::unbounded_channel();
        let behavior = NodeBehavior {
            down: fail_nodes.contains(&node),
            fault_pct: args.fault_pct,
            latency: args.node_latency.into(),
            // Mix the base seed with the node id for deterministic per-node RNG.
            seed: seed ^ node.wrapping_mul(0x9e3779b97f4a7c15),
        };
        tokio::spawn(run_node(node, db.clone(), behavior, rx, reply_tx.clone()));
        nodes.insert(node, tx);
    }
    drop(reply_tx);
    let mut sender = ChannelSender::new(nodes);

    let mut cursor = ShardId::UNSET;
    let mut totals = VisitStatistics::default();
    let mut rounds = Vec::new();
    let mut outcome = RunOutcome::MaxRounds;
    for round in 0..args.max_rounds {
        let mut request =
            VisitRequest::new(format!("visit-{seed}"), args.library.clone(), args.super_shard)
                .with_cursor(cursor);
        request.max_shards_per_round = args.max_shards_per_round;
        request.allow_inconsistent = args.allow_inconsistent;
        request.timeout = timeout;

        let started = time::Instant::now();
        registry.start_operation(create_operation(request, &ctx), &mut sender);
        let reply = drive_round(&registry, &mut sender, &mut reply_rx, timeout).await?;
        let commands = sender.take_sent();
        totals += reply.statistics;

        tracing::info!(
            round,
            cursor_in = %cursor,
            cursor_out = %reply.resumption_cursor,
            result = %reply.result.code,
            commands = commands.len(),
            "visit round finished"
        );
        rounds.push(RoundRecord {
            round,
            cursor_in: cursor,
            cursor_out: reply.resumption_cursor,
            result: reply.result.clone(),
            statistics: reply.statistics,
            elapsed_us: started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64,
            commands,
        });

        let progressed = reply.resumption_cursor != cursor;
        cursor = reply.resumption_cursor;
        if cursor.is_max_sentinel() {
            outcome = RunOutcome::Completed;
            break;
        }
        if !progressed {
            outcome = if reply.result.is_success() {
                RunOutcome::Stalled
            } else {
                RunOutcome::Failed
            };
            break;
        }
    }

    let history = History {
        meta: HistoryMeta {
            snapshot: args.snapshot.display().to_string(),
            super_shard: args.super_shard,
            library: args.library.clone(),
            max_shards_per_round: args.max_shards_per_round,
            allow_inconsistent: args.allow_inconsistent,
            fail_nodes: fail_nodes.into_iter().collect(),
            fault_pct: args.fault_pct,
            seed,
            timeout_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            config,
        },
        outcome,
        totals,
        rounds,
    };
    write_history(&args.out, &history)?;
    Ok(history)
}

/// Feed node replies to the registry until the round's client reply appears.
///
/// A round that hears nothing for a whole timeout is closed, which makes the
/// operation answer with whatever progress it has.
async fn drive_round(
    registry: &MemoryOperationRegistry,
    sender: &mut ChannelSender,
    replies: &mut mpsc::UnboundedReceiver<VisitCommandReply>,
    timeout: Duration,
) -> anyhow::Result<VisitReply> {
    loop {
        if !sender.replies.is_empty() {
            return Ok(sender.replies.remove(0));
        }
        match time::timeout(timeout, replies.recv()).await {
            Ok(Some(reply)) => {
                sender.record_result(&reply);
                let command_id = reply.command_id;
                if !registry.deliver(reply, sender) {
                    tracing::debug!(command = %command_id, "dropping reply for finished visit");
                }
            }
            Ok(None) => anyhow::bail!("all simulated nodes stopped"),
            Err(_) => {
                tracing::warn!(timeout = ?timeout, "no command reply in time; closing visit");
                registry.close_all(sender);
                anyhow::ensure!(!sender.replies.is_empty(), "visit closed without a reply");
            }
        }
    }
}

/// Simulated content node: scans its copies of the requested shards.
async fn run_node(
    node: NodeId,
    db: Arc<MemoryShardDatabase>,
    behavior: NodeBehavior,
    mut commands: mpsc::UnboundedReceiver<VisitCommand>,
    replies: mpsc::UnboundedSender<VisitCommandReply>,
) {
    let mut rng = SmallRng::seed_from_u64(behavior.seed);
    while let Some(command) = commands.recv().await {
        if !behavior.latency.is_zero() {
            time::sleep(behavior.latency).await;
        }
        let reply = if behavior.down {
            command.reply(
                ReturnCode::new(ResultCode::NotConnected, format!("node {node} is down")),
                VisitStatistics::default(),
            )
        } else if rng.gen_range(0..100) < u32::from(behavior.fault_pct) {
            command.reply(
                ReturnCode::new(ResultCode::Busy, format!("node {node} is overloaded")),
                VisitStatistics::default(),
            )
        } else {
            command.reply(ReturnCode::ok(), scan_statistics(node, &command.shards, db.as_ref()))
        };
        if replies.send(reply).is_err() {
            return;
        }
    }
}

/// Statistics a node reports for visiting its copies of `shards`.
fn scan_statistics(node: NodeId, shards: &[ShardId], db: &dyn ShardDatabase) -> VisitStatistics {
    let mut stats = VisitStatistics::default();
    for shard in shards {
        let Some(entry) = db.get(shard) else {
            continue;
        };
        let Some(copy) = entry.copy_on(node) else {
            continue;
        };
        stats.shards_visited += 1;
        stats.documents_visited += u64::from(copy.doc_count);
        stats.bytes_visited += copy.total_bytes;
        stats.documents_returned += u64::from(copy.doc_count);
        stats.bytes_returned += copy.total_bytes;
    }
    stats
}

/// Parse a comma-separated list of node ids.
fn parse_nodes(input: &str) -> anyhow::Result<BTreeSet<NodeId>> {
    let mut out = BTreeSet::new();
    for part in input.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        out.insert(
            part.parse::<NodeId>()
                .with_context(|| format!("invalid node id {part:?}"))?,
        );
    }
    Ok(out)
}

/// Write the history JSON file, creating parent directories as needed.
fn write_history(path: &PathBuf, history: &History) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(history).context("serialize history")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
