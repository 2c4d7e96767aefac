//! Shared types for the Raft engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the consensus engine and the transport/state-machine layers.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Peer address, e.g. `127.0.0.1:8868`. Doubles as the node identity.
pub type ServerId = String;

/// Operations carried by replicated log entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Nop,
    Put,
    Del,
    Lock,
    Unlock,
    Login,
    Logout,
    Register,
    AddNode,
}

/// One replicated log entry. Entries are immutable once written and durable
/// before they are acknowledged to the leader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: i64,
    pub op: OpKind,
    pub user: String,
    pub key: String,
    pub value: String,
}

impl LogEntry {
    pub fn nop(term: i64) -> Self {
        Self {
            term,
            op: OpKind::Nop,
            user: String::new(),
            key: "Ping".to_string(),
            value: String::new(),
        }
    }
}

/// Node role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Follower,
    Candidate,
    Leader,
}

/// Wire-level status taxonomy shared with clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcStatus {
    Ok,
    NotFound,
    UnknownUser,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: i64,
    pub leader_id: ServerId,
    pub prev_log_index: i64,
    pub prev_log_term: i64,
    pub leader_commit_index: i64,
    pub entries: Vec<LogEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub current_term: i64,
    pub success: bool,
    pub log_length: i64,
    pub is_busy: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: i64,
    pub candidate_id: ServerId,
    pub last_log_index: i64,
    pub last_log_term: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: i64,
    pub vote_granted: bool,
}

/// One key/value record of a snapshot, addressed by user namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub user: String,
    pub key: String,
    pub value: Vec<u8>,
}

/// Consensus state captured at the snapshot boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub term: i64,
    pub voted_for: ServerId,
    pub log_index: i64,
    pub membership: Vec<ServerId>,
}

/// Snapshot stream item. The meta record must be the final item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SnapshotItem {
    Record(RawRecord),
    Meta(SnapshotMeta),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Per-attempt timestamp; items for other timestamps are rejected while an
    /// install is in flight.
    pub timestamp: i64,
    pub items: Vec<SnapshotItem>,
    pub is_last: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub success: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanBinlogRequest {
    /// Entries below this index may be reclaimed.
    pub end_index: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanBinlogResponse {
    pub success: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: NodeStatus,
    pub term: i64,
    pub last_log_index: i64,
    pub last_log_term: i64,
    pub commit_index: i64,
    pub last_applied: i64,
    pub members: Vec<ServerId>,
}

/// Completion of a proposed entry, released once the entry is applied.
#[derive(Clone, Debug)]
pub struct AckResult {
    pub success: bool,
    pub status: RpcStatus,
    pub uuid: String,
}

impl AckResult {
    pub fn applied() -> Self {
        Self {
            success: true,
            status: RpcStatus::Ok,
            uuid: String::new(),
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            status: RpcStatus::Error,
            uuid: String::new(),
        }
    }
}

/// Side data produced by applying one entry.
#[derive(Clone, Debug)]
pub struct ApplyOutcome {
    pub status: RpcStatus,
    pub uuid: String,
}

impl Default for ApplyOutcome {
    fn default() -> Self {
        Self {
            status: RpcStatus::Ok,
            uuid: String::new(),
        }
    }
}

/// Compact view of the role controller, taken under the node lock.
#[derive(Clone, Debug)]
pub struct RoleSnapshot {
    pub status: NodeStatus,
    pub term: i64,
    pub current_leader: ServerId,
    pub in_safe_mode: bool,
    /// Microsecond timestamp of the most recent leader transition, used for
    /// the post-election lock/scan lockout window.
    pub leader_since_us: i64,
    pub members: Vec<ServerId>,
}

/// Per-node configuration and operational tuning.
///
/// The timeout values guard against slow/failed peers; batch settings bound
/// per-RPC work without sacrificing correctness.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_id: ServerId,
    /// Initial cluster membership. Must contain `server_id` unless the node
    /// boots in quiet mode.
    pub members: Vec<ServerId>,
    /// Node-specific data directory; the binlog, meta, and snapshot state
    /// live underneath it.
    pub data_dir: PathBuf,

    pub elect_timeout_min: Duration,
    pub elect_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,

    /// Max entries per AppendEntries batch.
    pub log_rep_batch_max: usize,
    /// Backoff before retrying a busy or unreachable peer.
    pub replication_retry_timespan: Duration,
    /// Followers reply busy once commit runs this far ahead of apply.
    pub max_commit_pending: i64,
    /// Leaders reject new writes once this many acks are pending.
    pub max_write_pending: usize,

    /// A joining node is committed into membership once its log is within
    /// this many entries of the leader's tail.
    pub min_log_gap: i64,
    pub add_node_timeout: Duration,
    pub max_cluster_size: usize,
    /// Boot without counting self in membership and without election timers;
    /// used by joining nodes.
    pub quiet_mode: bool,

    pub enable_log_compaction: bool,
    pub gc_interval: Duration,
    pub enable_snapshot: bool,
    pub snapshot_interval: Duration,
    pub max_snapshot_request_bytes: usize,

    /// Default session TTL in microseconds; also the post-election lockout
    /// window for locks and scans.
    pub session_expire_timeout_us: i64,
}

impl Config {
    pub fn new(server_id: ServerId, members: Vec<ServerId>, data_dir: PathBuf) -> Self {
        Self {
            server_id,
            members,
            data_dir,
            elect_timeout_min: Duration::from_millis(500),
            elect_timeout_max: Duration::from_millis(800),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(2),
            log_rep_batch_max: 64,
            replication_retry_timespan: Duration::from_millis(500),
            max_commit_pending: 10_000,
            max_write_pending: 10_000,
            min_log_gap: 64,
            add_node_timeout: Duration::from_secs(60),
            max_cluster_size: 7,
            quiet_mode: false,
            enable_log_compaction: false,
            gc_interval: Duration::from_secs(60),
            enable_snapshot: false,
            snapshot_interval: Duration::from_secs(600),
            max_snapshot_request_bytes: 1 << 20,
            session_expire_timeout_us: 6_000_000,
        }
    }

    /// Peers other than self, in the given membership.
    pub fn peers_of<'a>(&self, members: &'a [ServerId]) -> Vec<&'a ServerId> {
        members.iter().filter(|m| **m != self.server_id).collect()
    }
}

/// Application-specific state machine driven by the apply worker.
///
/// The engine treats entry payloads as opaque strings; `apply` implements the
/// storage semantics and must persist its own apply cursor atomically with
/// each entry's effect so recovery resumes from the correct position.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, index: i64, entry: &LogEntry) -> anyhow::Result<ApplyOutcome>;
    /// Apply position recovered from storage; -1 when nothing was applied.
    fn last_applied(&self) -> anyhow::Result<i64>;
    /// Full dump of the state for snapshot production.
    fn raw_records(&self) -> anyhow::Result<Vec<RawRecord>>;
    /// Drop all state ahead of a snapshot install.
    fn reset(&self) -> anyhow::Result<()>;
    /// Re-insert one record during snapshot install.
    fn restore(&self, record: RawRecord) -> anyhow::Result<()>;
}

/// Transport interface for consensus RPCs.
///
/// The engine is transport-agnostic; concrete implementations can use framed
/// TCP, gRPC, or in-memory channels. An `Err` means the peer was unreachable
/// or timed out.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn append_entries(
        &self,
        target: &str,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse>;

    async fn request_vote(&self, target: &str, req: VoteRequest) -> anyhow::Result<VoteResponse>;

    async fn install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse>;

    async fn clean_binlog(
        &self,
        target: &str,
        req: CleanBinlogRequest,
    ) -> anyhow::Result<CleanBinlogResponse>;

    async fn show_status(&self, target: &str) -> anyhow::Result<StatusReport>;
}
