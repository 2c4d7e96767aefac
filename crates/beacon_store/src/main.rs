//! CLI entry point for a beacon-store node.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beacon_raft::raft::Config;
use beacon_store::{server, NodeState};

#[derive(Parser, Debug)]
#[command(name = "beacon-store")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Node(NodeArgs),
}

/// CLI options for running a node.
#[derive(Parser, Debug)]
pub struct NodeArgs {
    /// This node's id and listen address, e.g. `127.0.0.1:8868`.
    #[arg(long, env = "BEACON_SERVER_ID")]
    server_id: String,

    /// Comma-separated cluster membership, e.g.
    /// `127.0.0.1:8868,127.0.0.1:8869,127.0.0.1:8870`.
    #[arg(long, env = "BEACON_MEMBERS")]
    members: String,

    #[arg(long, env = "BEACON_DATA_DIR", default_value = "./beacon-data")]
    data_dir: PathBuf,

    /// Election timer lower bound (ms).
    #[arg(long, env = "BEACON_ELECT_TIMEOUT_MIN_MS", default_value_t = 1_000)]
    elect_timeout_min_ms: u64,

    /// Election timer upper bound (ms).
    #[arg(long, env = "BEACON_ELECT_TIMEOUT_MAX_MS", default_value_t = 3_000)]
    elect_timeout_max_ms: u64,

    /// Leader heartbeat period (ms).
    #[arg(long, env = "BEACON_HEARTBEAT_INTERVAL_MS", default_value_t = 50)]
    heartbeat_interval_ms: u64,

    /// Per-RPC timeout (ms).
    #[arg(long, env = "BEACON_RPC_TIMEOUT_MS", default_value_t = 2_000)]
    rpc_timeout_ms: u64,

    /// Max entries per AppendEntries batch.
    #[arg(long, env = "BEACON_LOG_REP_BATCH_MAX", default_value_t = 500)]
    log_rep_batch_max: usize,

    /// Backoff before retrying a busy or unreachable peer (ms).
    #[arg(long, env = "BEACON_REPLICATION_RETRY_MS", default_value_t = 500)]
    replication_retry_ms: u64,

    /// Default session TTL and post-election lock window (microseconds).
    #[arg(long, env = "BEACON_SESSION_EXPIRE_TIMEOUT_US", default_value_t = 6_000_000)]
    session_expire_timeout_us: i64,

    /// Reject new writes once this many acks are pending.
    #[arg(long, env = "BEACON_MAX_WRITE_PENDING", default_value_t = 10_000)]
    max_write_pending: usize,

    /// Followers reply busy once commit runs this far ahead of apply.
    #[arg(long, env = "BEACON_MAX_COMMIT_PENDING", default_value_t = 10_000)]
    max_commit_pending: i64,

    /// Catch-up threshold for committing a joining node into membership.
    #[arg(long, env = "BEACON_MIN_LOG_GAP", default_value_t = 64)]
    min_log_gap: i64,

    /// Membership change timeout (seconds).
    #[arg(long, env = "BEACON_ADD_NODE_TIMEOUT_S", default_value_t = 60)]
    add_node_timeout_s: u64,

    #[arg(long, env = "BEACON_MAX_CLUSTER_SIZE", default_value_t = 7)]
    max_cluster_size: usize,

    /// Bootstrap quietly: stay out of membership and elections until added.
    #[arg(long, env = "BEACON_QUIET_MODE")]
    quiet_mode: bool,

    /// Enable binlog GC.
    #[arg(long, env = "BEACON_ENABLE_LOG_COMPACTION")]
    enable_log_compaction: bool,

    /// Binlog GC period (seconds).
    #[arg(long, env = "BEACON_GC_INTERVAL_S", default_value_t = 60)]
    gc_interval_s: u64,

    /// Enable periodic snapshots.
    #[arg(long, env = "BEACON_ENABLE_SNAPSHOT")]
    enable_snapshot: bool,

    /// Snapshot production period (seconds).
    #[arg(long, env = "BEACON_SNAPSHOT_INTERVAL_S", default_value_t = 600)]
    snapshot_interval_s: u64,

    /// Max bytes per InstallSnapshot request.
    #[arg(long, env = "BEACON_MAX_SNAPSHOT_REQUEST_SIZE", default_value_t = 1 << 20)]
    max_snapshot_request_size: usize,
}

impl NodeArgs {
    fn to_config(&self) -> Config {
        let members = self
            .members
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        let mut config = Config::new(self.server_id.clone(), members, self.data_dir.clone());
        config.elect_timeout_min = Duration::from_millis(self.elect_timeout_min_ms);
        config.elect_timeout_max = Duration::from_millis(self.elect_timeout_max_ms);
        config.heartbeat_interval = Duration::from_millis(self.heartbeat_interval_ms);
        config.rpc_timeout = Duration::from_millis(self.rpc_timeout_ms);
        config.log_rep_batch_max = self.log_rep_batch_max;
        config.replication_retry_timespan = Duration::from_millis(self.replication_retry_ms);
        config.session_expire_timeout_us = self.session_expire_timeout_us;
        config.max_write_pending = self.max_write_pending;
        config.max_commit_pending = self.max_commit_pending;
        config.min_log_gap = self.min_log_gap;
        config.add_node_timeout = Duration::from_secs(self.add_node_timeout_s);
        config.max_cluster_size = self.max_cluster_size;
        config.quiet_mode = self.quiet_mode;
        config.enable_log_compaction = self.enable_log_compaction;
        config.gc_interval = Duration::from_secs(self.gc_interval_s);
        config.enable_snapshot = self.enable_snapshot;
        config.snapshot_interval = Duration::from_secs(self.snapshot_interval_s);
        config.max_snapshot_request_bytes = self.max_snapshot_request_size;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let Command::Node(node_args) = args.cmd;
    let config = node_args.to_config();
    let listen_addr = config.server_id.clone();

    let node = NodeState::start(config).await?;
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("bind {listen_addr}"))?;
    info!(%listen_addr, "beacon-store node listening");

    tokio::select! {
        result = server::serve(listener, node.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            node.stop().await;
        }
    }
    Ok(())
}
