//! Wire messages.
//!
//! Every RPC travels as one length-delimited bincode frame carrying a
//! `Request`, answered by a matching `Response` variant. Client responses
//! carry `leader_id` so non-leader nodes can redirect, and `uuid_expired`
//! where a stale login can be reported.

use serde::{Deserialize, Serialize};

use beacon_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, CleanBinlogRequest, CleanBinlogResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, NodeStatus, RpcStatus, StatusReport,
    VoteRequest, VoteResponse,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub uuid: String,
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
    pub leader_id: String,
    pub uuid_expired: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRequest {
    pub uuid: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetResponse {
    pub success: bool,
    pub hit: bool,
    pub value: String,
    pub leader_id: String,
    pub uuid_expired: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelRequest {
    pub uuid: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DelResponse {
    pub success: bool,
    pub leader_id: String,
    pub uuid_expired: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRequest {
    pub uuid: String,
    pub key: String,
    pub session_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LockResponse {
    pub success: bool,
    pub leader_id: String,
    pub uuid_expired: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub uuid: String,
    pub key: String,
    pub session_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnlockResponse {
    pub success: bool,
    pub leader_id: String,
    pub uuid_expired: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanRequest {
    pub uuid: String,
    pub start_key: String,
    pub end_key: String,
    pub size_limit: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanItem {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScanResponse {
    pub success: bool,
    pub leader_id: String,
    pub uuid_expired: bool,
    pub items: Vec<ScanItem>,
    pub has_more: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchRequest {
    pub uuid: String,
    pub session_id: String,
    pub key: String,
    /// The caller's view of the value; a mismatch fires immediately.
    pub old_value: String,
    pub key_exist: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WatchResponse {
    pub success: bool,
    pub leader_id: String,
    pub uuid_expired: bool,
    pub watch_key: String,
    pub key: String,
    pub value: String,
    pub deleted: bool,
    pub canceled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: String,
    pub uuid: String,
    /// Session TTL override in milliseconds.
    pub timeout_milliseconds: Option<i64>,
    /// Locks the client believes it holds.
    pub locks: Vec<String>,
    pub forward_from_leader: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub success: bool,
    pub leader_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub passwd: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub status: RpcStatus,
    pub uuid: String,
    pub leader_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub uuid: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub status: RpcStatus,
    pub leader_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub passwd: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: RpcStatus,
    pub leader_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddNodeRequest {
    pub node_addr: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddNodeResponse {
    pub success: bool,
    pub leader_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcStatRequest {
    /// Op codes to report; empty means all.
    pub ops: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatInfo {
    pub current_stat: i64,
    pub average_stat: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcStatResponse {
    pub status: NodeStatus,
    pub stats: Vec<StatInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    AppendEntries(AppendEntriesRequest),
    Vote(VoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
    CleanBinlog(CleanBinlogRequest),
    ShowStatus,
    Put(PutRequest),
    Get(GetRequest),
    Del(DelRequest),
    Lock(LockRequest),
    Unlock(UnlockRequest),
    Scan(ScanRequest),
    Watch(WatchRequest),
    KeepAlive(KeepAliveRequest),
    Login(LoginRequest),
    Logout(LogoutRequest),
    Register(RegisterRequest),
    AddNode(AddNodeRequest),
    RpcStat(RpcStatRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    AppendEntries(AppendEntriesResponse),
    Vote(VoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
    CleanBinlog(CleanBinlogResponse),
    ShowStatus(StatusReport),
    Put(PutResponse),
    Get(GetResponse),
    Del(DelResponse),
    Lock(LockResponse),
    Unlock(UnlockResponse),
    Scan(ScanResponse),
    Watch(WatchResponse),
    KeepAlive(KeepAliveResponse),
    Login(LoginResponse),
    Logout(LogoutResponse),
    Register(RegisterResponse),
    AddNode(AddNodeResponse),
    RpcStat(RpcStatResponse),
}

pub fn encode(message: &impl Serialize) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        message,
        bincode::config::standard(),
    )?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> anyhow::Result<T> {
    let (message, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(message)
}
