//! Raft module wiring.
//!
//! `node` contains the role controller, replicators, and the commit/apply
//! pipeline, `log` the durable binlog, `meta` the term/vote store, `snapshot`
//! the snapshot slot storage, and `types` the shared request/response and
//! trait contracts (transport, state machine).

mod log;
mod meta;
mod node;
mod snapshot;
mod types;

pub use log::Binlog;
pub use meta::MetaStore;
pub use node::RaftNode;
pub use snapshot::SnapshotStore;
pub use types::{
    AckResult, AppendEntriesRequest, AppendEntriesResponse, ApplyOutcome, CleanBinlogRequest,
    CleanBinlogResponse, Config, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry,
    NodeStatus, OpKind, RawRecord, RoleSnapshot, RpcStatus, SnapshotItem, SnapshotMeta,
    StateMachine, StatusReport, Transport, VoteRequest, VoteResponse,
};
