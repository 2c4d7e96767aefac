//! Framed-TCP wire client and the consensus `Transport` implementation.
//!
//! One `PeerClient` per peer keeps a small pool of length-delimited framed
//! connections; each call checks a connection out, runs one request/response
//! round, and returns it to the pool on success. Connections are re-dialed
//! lazily after failures.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use beacon_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, CleanBinlogRequest, CleanBinlogResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, StatusReport, Transport, VoteRequest,
    VoteResponse,
};

use crate::wire::{self, KeepAliveRequest, KeepAliveResponse, Request, Response};

const POOL_SIZE: usize = 4;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type Conn = Framed<TcpStream, LengthDelimitedCodec>;

pub struct PeerClient {
    addr: String,
    pool: AsyncMutex<Vec<Conn>>,
}

impl PeerClient {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            pool: AsyncMutex::new(Vec::new()),
        }
    }

    async fn checkout(&self) -> anyhow::Result<Conn> {
        if let Some(conn) = self.pool.lock().await.pop() {
            return Ok(conn);
        }
        debug!(peer = %self.addr, "dialing");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .context("connect timed out")??;
        stream.set_nodelay(true)?;
        Ok(Framed::new(stream, LengthDelimitedCodec::new()))
    }

    async fn checkin(&self, conn: Conn) {
        let mut pool = self.pool.lock().await;
        if pool.len() < POOL_SIZE {
            pool.push(conn);
        }
    }

    /// One request/response round trip.
    pub async fn call(&self, request: &Request) -> anyhow::Result<Response> {
        let mut conn = self.checkout().await?;
        let payload = wire::encode(request)?;
        conn.send(Bytes::from(payload)).await.context("send request")?;
        let frame = conn
            .next()
            .await
            .context("connection closed")?
            .context("read response")?;
        let response = wire::decode(&frame)?;
        self.checkin(conn).await;
        Ok(response)
    }
}

/// Dial an address and run a single request; used by tests and tools.
pub async fn call_once(addr: &str, request: &Request) -> anyhow::Result<Response> {
    PeerClient::new(addr).call(request).await
}

/// Peer connection registry implementing the consensus transport.
#[derive(Default)]
pub struct TcpTransport {
    peers: Mutex<HashMap<String, std::sync::Arc<PeerClient>>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer(&self, addr: &str) -> std::sync::Arc<PeerClient> {
        let mut peers = self.peers.lock().unwrap();
        peers
            .entry(addr.to_string())
            .or_insert_with(|| std::sync::Arc::new(PeerClient::new(addr)))
            .clone()
    }

    /// Best-effort keep-alive forwarding from the leader to a follower.
    pub async fn forward_keep_alive(
        &self,
        addr: &str,
        req: KeepAliveRequest,
    ) -> anyhow::Result<KeepAliveResponse> {
        match self.peer(addr).call(&Request::KeepAlive(req)).await? {
            Response::KeepAlive(resp) => Ok(resp),
            other => anyhow::bail!("unexpected response: {other:?}"),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn append_entries(
        &self,
        target: &str,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        match self.peer(target).call(&Request::AppendEntries(req)).await? {
            Response::AppendEntries(resp) => Ok(resp),
            other => anyhow::bail!("unexpected response: {other:?}"),
        }
    }

    async fn request_vote(&self, target: &str, req: VoteRequest) -> anyhow::Result<VoteResponse> {
        match self.peer(target).call(&Request::Vote(req)).await? {
            Response::Vote(resp) => Ok(resp),
            other => anyhow::bail!("unexpected response: {other:?}"),
        }
    }

    async fn install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        match self.peer(target).call(&Request::InstallSnapshot(req)).await? {
            Response::InstallSnapshot(resp) => Ok(resp),
            other => anyhow::bail!("unexpected response: {other:?}"),
        }
    }

    async fn clean_binlog(
        &self,
        target: &str,
        req: CleanBinlogRequest,
    ) -> anyhow::Result<CleanBinlogResponse> {
        match self.peer(target).call(&Request::CleanBinlog(req)).await? {
            Response::CleanBinlog(resp) => Ok(resp),
            other => anyhow::bail!("unexpected response: {other:?}"),
        }
    }

    async fn show_status(&self, target: &str) -> anyhow::Result<StatusReport> {
        match self.peer(target).call(&Request::ShowStatus).await? {
            Response::ShowStatus(resp) => Ok(resp),
            other => anyhow::bail!("unexpected response: {other:?}"),
        }
    }
}
