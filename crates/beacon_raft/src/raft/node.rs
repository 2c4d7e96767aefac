//! Raft node core.
//!
//! This file contains the role controller, the election and heartbeat timers,
//! per-peer replicators, the commit tracker, and the single apply worker that
//! drives the application state machine. It also wires in the snapshot
//! produce/install/send paths and binlog GC.
//!
//! Locking: one coarse mutex (`state`) protects the role controller; a
//! dedicated mutex (`snapshot_mu`) makes snapshot produce/install mutually
//! exclusive with entry application. `snapshot_mu` is always taken before
//! `state`, and `state` is never held across RPC sends or log appends.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time;
use tracing::{debug, info, warn};

use super::log::Binlog;
use super::meta::MetaStore;
use super::snapshot::SnapshotStore;
use super::types::{
    AckResult, AppendEntriesRequest, AppendEntriesResponse, CleanBinlogRequest,
    CleanBinlogResponse, Config, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry,
    NodeStatus, OpKind, RoleSnapshot, ServerId, SnapshotItem, SnapshotMeta, StateMachine,
    StatusReport, Transport, VoteRequest, VoteResponse,
};

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(i64::MAX as u128) as i64
}

struct MembershipChange {
    addr: ServerId,
    /// Index of the AddNode entry once written, -1 before.
    log_index: i64,
    epoch: u64,
    responder: Option<oneshot::Sender<AckResult>>,
}

struct RoleState {
    status: NodeStatus,
    current_term: i64,
    voted_for: HashMap<i64, ServerId>,
    vote_grant: HashMap<i64, usize>,
    current_leader: ServerId,
    commit_index: i64,
    last_applied: i64,
    heartbeat_count: u64,
    in_safe_mode: bool,
    in_quiet_mode: bool,
    single_node_mode: bool,
    members: Vec<ServerId>,
    /// Ordered membership history: once the entry at an index commits, the
    /// mapped member list governs quorum for indices beyond it.
    changed_members: BTreeMap<i64, Vec<ServerId>>,
    next_index: HashMap<ServerId, i64>,
    match_index: HashMap<ServerId, i64>,
    replicating: HashSet<ServerId>,
    client_acks: HashMap<i64, oneshot::Sender<AckResult>>,
    membership_change: Option<MembershipChange>,
    change_epoch: u64,
    heartbeat_running: bool,
    /// Microsecond timestamp of the last confirmed heartbeat quorum; bounds
    /// how stale a leader-local read may be.
    heartbeat_read_us: i64,
    leader_since_us: i64,
    last_safe_clean_index: i64,
}

struct InstallState {
    /// Timestamp of the in-flight snapshot install, -1 when idle.
    doing_timestamp: i64,
}

/// Single-group Raft node.
pub struct RaftNode {
    config: Config,
    log: Binlog,
    meta: MetaStore,
    snapshots: SnapshotStore,
    sm: Arc<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    state: Mutex<RoleState>,
    snapshot_mu: Mutex<InstallState>,
    /// Serializes local index assignment so acks are registered before their
    /// entry becomes visible to replicators.
    append_mu: Mutex<()>,
    commit_notify: Notify,
    replication_notify: Notify,
    append_tx: mpsc::Sender<AppendJob>,
    stop: AtomicBool,
}

type AppendJob = (AppendEntriesRequest, oneshot::Sender<AppendEntriesResponse>);

impl RaftNode {
    pub async fn start(
        config: Config,
        keyspace: fjall::Keyspace,
        sm: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut members = Vec::new();
        let mut self_in_cluster = false;
        for member in &config.members {
            if *member == config.server_id && config.quiet_mode {
                // Quiet bootstrap: membership picks self up once the AddNode
                // entry for this address commits.
                continue;
            }
            members.push(member.clone());
            if *member == config.server_id {
                info!(member = %member, "cluster member (self)");
                self_in_cluster = true;
            } else {
                info!(member = %member, "cluster member");
            }
        }
        anyhow::ensure!(
            self_in_cluster || config.quiet_mode,
            "this node is not in the cluster membership, check the configuration"
        );
        anyhow::ensure!(
            members.len() <= config.max_cluster_size,
            "cluster size {} is larger than the configured max {}",
            members.len(),
            config.max_cluster_size
        );
        let single_node_mode = self_in_cluster && members.len() == 1;

        let log = Binlog::open(keyspace.clone())?;
        let meta = MetaStore::open(keyspace)?;
        let snapshots = SnapshotStore::open(config.data_dir.join("snapshot"))?;
        let current_term = meta.read_current_term()?;
        let voted_for = meta.read_voted_for()?;
        let last_applied = sm.last_applied()?;

        let mut changed_members = BTreeMap::new();
        changed_members.insert(-1, members.clone());

        let (append_tx, append_rx) = mpsc::channel(1024);
        let node = Arc::new(Self {
            state: Mutex::new(RoleState {
                status: NodeStatus::Follower,
                current_term,
                voted_for,
                vote_grant: HashMap::new(),
                current_leader: String::new(),
                commit_index: last_applied,
                last_applied,
                heartbeat_count: 0,
                in_safe_mode: true,
                in_quiet_mode: config.quiet_mode,
                single_node_mode,
                members,
                changed_members,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                replicating: HashSet::new(),
                client_acks: HashMap::new(),
                membership_change: None,
                change_epoch: 0,
                heartbeat_running: false,
                heartbeat_read_us: 0,
                leader_since_us: 0,
                last_safe_clean_index: -1,
            }),
            snapshot_mu: Mutex::new(InstallState {
                doing_timestamp: -1,
            }),
            append_mu: Mutex::new(()),
            commit_notify: Notify::new(),
            replication_notify: Notify::new(),
            append_tx,
            stop: AtomicBool::new(false),
            config,
            log,
            meta,
            snapshots,
            sm,
            transport,
        });

        if node.config.enable_snapshot {
            let install = node.snapshot_mu.lock().await;
            if let Err(err) = node.load_snapshot_locked(&install).await {
                warn!(error = ?err, "no snapshot loaded at boot");
            }
        }

        {
            let node = node.clone();
            tokio::spawn(async move { node.follower_loop(append_rx).await });
        }
        {
            let node = node.clone();
            tokio::spawn(async move { node.apply_loop().await });
        }
        {
            let node = node.clone();
            tokio::spawn(async move { node.election_loop().await });
        }
        if node.config.enable_log_compaction {
            let node = node.clone();
            tokio::spawn(async move { node.gc_loop().await });
        }
        if node.config.enable_snapshot {
            let node = node.clone();
            tokio::spawn(async move { node.snapshot_produce_loop().await });
        }

        Ok(node)
    }

    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.commit_notify.notify_waiters();
        self.replication_notify.notify_waiters();
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub async fn status(&self) -> StatusReport {
        let (last_log_index, last_log_term) = self.log.last_index_and_term();
        let state = self.state.lock().await;
        StatusReport {
            status: state.status,
            term: state.current_term,
            last_log_index,
            last_log_term,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            members: state.members.clone(),
        }
    }

    pub async fn role(&self) -> RoleSnapshot {
        let state = self.state.lock().await;
        RoleSnapshot {
            status: state.status,
            term: state.current_term,
            current_leader: state.current_leader.clone(),
            in_safe_mode: state.in_safe_mode,
            leader_since_us: state.leader_since_us,
            members: state.members.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    fn trans_to_follower_locked(&self, state: &mut RoleState, reason: &str, new_term: i64) {
        info!(
            reason,
            old_term = state.current_term,
            new_term,
            "term is outdated, becoming follower"
        );
        state.status = NodeStatus::Follower;
        state.current_term = new_term;
        if let Err(err) = self.meta.write_current_term(new_term) {
            warn!(error = ?err, "persist current term failed");
        }
        self.fail_pending_acks_locked(state);
    }

    fn fail_pending_acks_locked(&self, state: &mut RoleState) {
        for (_, tx) in state.client_acks.drain() {
            let _ = tx.send(AckResult::failed());
        }
        if let Some(mut change) = state.membership_change.take() {
            state.change_epoch += 1;
            if let Some(tx) = change.responder.take() {
                let _ = tx.send(AckResult::failed());
            }
        }
    }

    fn trans_to_leader_locked(self: &Arc<Self>, state: &mut RoleState) {
        state.in_safe_mode = true;
        state.status = NodeStatus::Leader;
        state.current_leader = self.config.server_id.clone();
        state.leader_since_us = now_us();
        state.heartbeat_read_us = 0;
        info!(term = state.current_term, "won the election");
        if !state.heartbeat_running {
            state.heartbeat_running = true;
            let node = self.clone();
            tokio::spawn(async move { node.heartbeat_loop().await });
        }
        let members = state.members.clone();
        for member in members {
            if member == self.config.server_id {
                continue;
            }
            state.next_index.insert(member.clone(), self.log.next_index());
            state.match_index.insert(member.clone(), -1);
            self.ensure_replicator_locked(state, &member);
        }
    }

    fn ensure_replicator_locked(self: &Arc<Self>, state: &mut RoleState, peer: &str) {
        if state.replicating.contains(peer) {
            debug!(peer, "replicator already running");
            return;
        }
        state.next_index.entry(peer.to_string()).or_insert_with(|| self.log.next_index());
        state.match_index.entry(peer.to_string()).or_insert(-1);
        let node = self.clone();
        let peer = peer.to_string();
        tokio::spawn(async move { node.replicate_loop(peer).await });
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    fn random_election_timeout(&self) -> Duration {
        let min = self.config.elect_timeout_min.as_millis() as u64;
        let max = self.config.elect_timeout_max.as_millis() as u64;
        let span = rand::thread_rng().gen_range(min..=max.max(min + 1));
        Duration::from_millis(span)
    }

    async fn election_loop(self: Arc<Self>) {
        loop {
            time::sleep(self.random_election_timeout()).await;
            if self.stopped() {
                return;
            }
            if let Some((term, peers)) = self.election_tick().await {
                self.broadcast_vote_requests(term, peers);
            }
        }
    }

    /// One election-timer firing. Returns the vote broadcast to perform, if
    /// this node just became a candidate.
    async fn election_tick(&self) -> Option<(i64, Vec<ServerId>)> {
        let mut state = self.state.lock().await;
        if state.in_quiet_mode {
            return None;
        }
        if state.single_node_mode {
            if state.status != NodeStatus::Leader {
                state.status = NodeStatus::Leader;
                state.current_leader = self.config.server_id.clone();
                state.in_safe_mode = false;
                state.commit_index = state.commit_index.max(state.last_applied);
                state.current_term += 1;
                state.leader_since_us = now_us();
                if let Err(err) = self.meta.write_current_term(state.current_term) {
                    warn!(error = ?err, "persist current term failed");
                }
                info!(term = state.current_term, "single node mode, taking leadership");
            }
            return None;
        }
        if state.status == NodeStatus::Leader {
            return None;
        }
        if state.status == NodeStatus::Follower && state.heartbeat_count > 0 {
            state.heartbeat_count = 0;
            return None;
        }

        state.current_term += 1;
        let term = state.current_term;
        if let Err(err) = self.meta.write_current_term(term) {
            warn!(error = ?err, "persist current term failed, skipping election");
            state.current_term -= 1;
            return None;
        }
        state.status = NodeStatus::Candidate;
        state
            .voted_for
            .insert(term, self.config.server_id.clone());
        if let Err(err) = self.meta.write_voted_for(term, &self.config.server_id) {
            warn!(error = ?err, "persist vote failed");
        }
        *state.vote_grant.entry(term).or_insert(0) += 1;
        info!(term, "broadcasting vote requests");
        let peers = state
            .members
            .iter()
            .filter(|m| **m != self.config.server_id)
            .cloned()
            .collect();
        Some((term, peers))
    }

    fn broadcast_vote_requests(self: &Arc<Self>, term: i64, peers: Vec<ServerId>) {
        let (last_log_index, last_log_term) = self.log.last_index_and_term();
        for peer in peers {
            let node = self.clone();
            let req = VoteRequest {
                term,
                candidate_id: self.config.server_id.clone(),
                last_log_index,
                last_log_term,
            };
            tokio::spawn(async move {
                let resp =
                    time::timeout(node.config.rpc_timeout, node.transport.request_vote(&peer, req))
                        .await;
                if let Ok(Ok(resp)) = resp {
                    node.on_vote_reply(resp).await;
                }
            });
        }
    }

    async fn on_vote_reply(self: &Arc<Self>, resp: VoteResponse) {
        let mut state = self.state.lock().await;
        if state.status != NodeStatus::Candidate {
            return;
        }
        debug!(term = resp.term, granted = resp.vote_granted, "vote reply");
        if resp.vote_granted && resp.term == state.current_term {
            let term = state.current_term;
            let grants = state.vote_grant.entry(term).or_insert(0);
            *grants += 1;
            if *grants > state.members.len() / 2 {
                self.trans_to_leader_locked(&mut state);
                drop(state);
                self.append_leader_nop().await;
            }
        } else if resp.term > state.current_term {
            self.trans_to_follower_locked(&mut state, "vote reply", resp.term);
        }
    }

    /// The no-op entry of the new term; safe mode clears once it applies.
    async fn append_leader_nop(&self) {
        let _append = self.append_mu.lock().await;
        let term = self.state.lock().await.current_term;
        if let Err(err) = self.log.append(&LogEntry::nop(term)) {
            warn!(error = ?err, "append nop entry failed");
            return;
        }
        self.replication_notify.notify_waiters();
    }

    /// Vote RPC receiver.
    pub async fn handle_vote(&self, req: VoteRequest) -> VoteResponse {
        let mut state = self.state.lock().await;
        let denied = |term: i64| VoteResponse {
            term,
            vote_granted: false,
        };
        if req.term < state.current_term {
            return denied(state.current_term);
        }
        let (last_log_index, last_log_term) = self.log.last_index_and_term();
        if req.last_log_term < last_log_term {
            return denied(state.current_term);
        }
        if req.last_log_term == last_log_term && req.last_log_index < last_log_index {
            return denied(state.current_term);
        }
        if req.term > state.current_term {
            self.trans_to_follower_locked(&mut state, "vote request", req.term);
        }
        let term = state.current_term;
        match state.voted_for.get(&term) {
            Some(candidate) if *candidate != req.candidate_id => denied(term),
            _ => {
                state.voted_for.insert(term, req.candidate_id.clone());
                if let Err(err) = self.meta.write_voted_for(term, &req.candidate_id) {
                    warn!(error = ?err, "persist vote failed, denying");
                    return denied(term);
                }
                VoteResponse {
                    term,
                    vote_granted: true,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Heartbeats and linearizable reads
    // ------------------------------------------------------------------

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = time::interval(self.config.heartbeat_interval);
        loop {
            interval.tick().await;
            if self.stopped() {
                return;
            }
            let (term, commit_index, peers) = {
                let mut state = self.state.lock().await;
                if state.status != NodeStatus::Leader {
                    state.heartbeat_running = false;
                    return;
                }
                let peers: Vec<ServerId> = state
                    .members
                    .iter()
                    .filter(|m| **m != self.config.server_id)
                    .cloned()
                    .collect();
                (state.current_term, state.commit_index, peers)
            };
            for peer in peers {
                let node = self.clone();
                let req = AppendEntriesRequest {
                    term,
                    leader_id: self.config.server_id.clone(),
                    prev_log_index: -1,
                    prev_log_term: -1,
                    leader_commit_index: commit_index,
                    entries: Vec::new(),
                };
                tokio::spawn(async move {
                    let resp = time::timeout(
                        node.config.rpc_timeout,
                        node.transport.append_entries(&peer, req),
                    )
                    .await;
                    if let Ok(Ok(resp)) = resp {
                        let mut state = node.state.lock().await;
                        if state.status == NodeStatus::Leader
                            && resp.current_term > state.current_term
                        {
                            node.trans_to_follower_locked(
                                &mut state,
                                "heartbeat reply",
                                resp.current_term,
                            );
                        }
                    }
                });
            }
        }
    }

    /// Confirm leadership with a fresh heartbeat quorum before a linearizable
    /// read, unless a recent round already did. Every caller gets its own
    /// quorum context.
    pub async fn read_barrier(self: &Arc<Self>) -> anyhow::Result<()> {
        let (term, commit_index, peers, member_count) = {
            let state = self.state.lock().await;
            anyhow::ensure!(state.status == NodeStatus::Leader, "not leader");
            if state.members.len() <= 1 {
                return Ok(());
            }
            let fresh_window_us = self.config.elect_timeout_min.as_micros() as i64;
            if now_us() - state.heartbeat_read_us <= fresh_window_us {
                return Ok(());
            }
            let peers: Vec<ServerId> = state
                .members
                .iter()
                .filter(|m| **m != self.config.server_id)
                .cloned()
                .collect();
            (
                state.current_term,
                state.commit_index,
                peers,
                state.members.len(),
            )
        };
        debug!("broadcasting heartbeat for read");
        let (tx, mut rx) = mpsc::channel(peers.len());
        for peer in peers {
            let node = self.clone();
            let tx = tx.clone();
            let req = AppendEntriesRequest {
                term,
                leader_id: self.config.server_id.clone(),
                prev_log_index: -1,
                prev_log_term: -1,
                leader_commit_index: commit_index,
                entries: Vec::new(),
            };
            tokio::spawn(async move {
                let resp = time::timeout(
                    node.config.rpc_timeout,
                    node.transport.append_entries(&peer, req),
                )
                .await;
                let _ = tx
                    .send(match resp {
                        Ok(Ok(resp)) => Some(resp),
                        _ => None,
                    })
                    .await;
            });
        }
        drop(tx);

        let mut succ_count = 1usize; // self
        let mut err_count = 0usize;
        while let Some(reply) = rx.recv().await {
            match reply {
                Some(resp) => {
                    if resp.current_term > term {
                        let mut state = self.state.lock().await;
                        if resp.current_term > state.current_term {
                            self.trans_to_follower_locked(
                                &mut state,
                                "read heartbeat reply",
                                resp.current_term,
                            );
                        }
                        anyhow::bail!("no longer leader");
                    }
                    succ_count += 1;
                    if succ_count > member_count / 2 {
                        let mut state = self.state.lock().await;
                        anyhow::ensure!(state.status == NodeStatus::Leader, "no longer leader");
                        state.heartbeat_read_us = now_us();
                        return Ok(());
                    }
                }
                None => {
                    err_count += 1;
                    if err_count > member_count / 2 {
                        anyhow::bail!("read heartbeat quorum failed");
                    }
                }
            }
        }
        anyhow::bail!("read heartbeat quorum failed")
    }

    // ------------------------------------------------------------------
    // Local appends
    // ------------------------------------------------------------------

    /// Append a client operation to the log, returning the ack released once
    /// the entry commits and applies.
    pub async fn propose(
        &self,
        op: OpKind,
        user: String,
        key: String,
        value: String,
    ) -> anyhow::Result<oneshot::Receiver<AckResult>> {
        let _append = self.append_mu.lock().await;
        let (term, single_node) = {
            let state = self.state.lock().await;
            anyhow::ensure!(state.status == NodeStatus::Leader, "not leader");
            anyhow::ensure!(
                state.client_acks.len() <= self.config.max_write_pending,
                "too many pending writes"
            );
            (state.current_term, state.single_node_mode)
        };
        let entry = LogEntry {
            term,
            op,
            user,
            key,
            value,
        };
        let index = self.log.next_index();
        let (tx, rx) = oneshot::channel();
        self.state.lock().await.client_acks.insert(index, tx);
        if let Err(err) = self.log.append(&entry) {
            self.state.lock().await.client_acks.remove(&index);
            return Err(err).context("append log entry");
        }
        {
            let mut state = self.state.lock().await;
            if state.status != NodeStatus::Leader {
                // Deposed mid-append; the entry will be truncated away.
                state.client_acks.remove(&index);
                anyhow::bail!("not leader");
            }
            if single_node {
                self.update_commit_index_locked(&mut state, index);
            }
        }
        self.replication_notify.notify_waiters();
        Ok(rx)
    }

    /// Append without waiting for an ack; used by session expiry.
    pub async fn propose_background(
        &self,
        op: OpKind,
        user: String,
        key: String,
        value: String,
    ) -> anyhow::Result<()> {
        let _append = self.append_mu.lock().await;
        let (term, single_node) = {
            let state = self.state.lock().await;
            anyhow::ensure!(state.status == NodeStatus::Leader, "not leader");
            (state.current_term, state.single_node_mode)
        };
        let entry = LogEntry {
            term,
            op,
            user,
            key,
            value,
        };
        let index = self.log.append(&entry).context("append log entry")?;
        if single_node {
            let mut state = self.state.lock().await;
            self.update_commit_index_locked(&mut state, index);
        }
        self.replication_notify.notify_waiters();
        Ok(())
    }

    // ------------------------------------------------------------------
    // AppendEntries receiver
    // ------------------------------------------------------------------

    /// AppendEntries RPC receiver; work is serialized on the follower worker.
    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let (tx, rx) = oneshot::channel();
        if self.append_tx.send((req, tx)).await.is_err() {
            return AppendEntriesResponse {
                current_term: -1,
                success: false,
                log_length: self.log.next_index(),
                is_busy: false,
            };
        }
        rx.await.unwrap_or(AppendEntriesResponse {
            current_term: -1,
            success: false,
            log_length: 0,
            is_busy: false,
        })
    }

    async fn follower_loop(self: Arc<Self>, mut rx: mpsc::Receiver<AppendJob>) {
        while let Some((req, tx)) = rx.recv().await {
            if self.stopped() {
                return;
            }
            let resp = self.do_append_entries(req).await;
            let _ = tx.send(resp);
        }
    }

    async fn do_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock().await;
        let fail = |state: &RoleState, log_length: i64, is_busy: bool| AppendEntriesResponse {
            current_term: state.current_term,
            success: false,
            log_length,
            is_busy,
        };

        if req.term < state.current_term {
            debug!(
                term = req.term,
                current_term = state.current_term,
                "append entries from an outdated term"
            );
            return fail(&state, self.log.next_index(), false);
        }
        if req.term > state.current_term {
            if let Err(err) = self.meta.write_current_term(req.term) {
                warn!(error = ?err, "persist current term failed");
            }
        }
        if state.status != NodeStatus::Follower {
            self.fail_pending_acks_locked(&mut state);
        }
        state.current_term = req.term;
        state.status = NodeStatus::Follower;
        state.current_leader = req.leader_id.clone();
        state.heartbeat_count += 1;

        if !req.entries.is_empty() {
            if req.prev_log_index >= self.log.next_index() {
                debug!(
                    prev_log_index = req.prev_log_index,
                    log_length = self.log.next_index(),
                    "prev entry is beyond the local log"
                );
                return fail(&state, self.log.next_index(), false);
            }
            let prev_log_term = if req.prev_log_index >= 0 {
                match self.log.term_at(req.prev_log_index) {
                    Ok(Some(term)) => term,
                    _ => -1,
                }
            } else {
                -1
            };
            if prev_log_term != req.prev_log_term {
                if let Err(err) = self.log.truncate(req.prev_log_index - 1) {
                    warn!(error = ?err, "truncate after term mismatch failed");
                }
                info!(
                    local_term = prev_log_term,
                    leader_term = req.prev_log_term,
                    "prev entry term mismatch"
                );
                return fail(&state, self.log.next_index(), false);
            }
            if state.commit_index - state.last_applied > self.config.max_commit_pending {
                info!(
                    commit_index = state.commit_index,
                    last_applied = state.last_applied,
                    "apply backlog too deep, asking the leader to back off"
                );
                return fail(&state, self.log.next_index(), true);
            }
            if self.log.next_index() > req.prev_log_index + 1 {
                let old_length = self.log.next_index();
                if let Err(err) = self.log.truncate(req.prev_log_index) {
                    warn!(error = ?err, "alignment truncate failed");
                    return fail(&state, self.log.next_index(), false);
                }
                info!(
                    old_length,
                    new_length = self.log.next_index(),
                    "log length alignment"
                );
            }
            drop(state);
            let appended = self.log.append_batch(&req.entries);
            state = self.state.lock().await;
            if let Err(err) = appended {
                warn!(error = ?err, "append entries failed");
                return fail(&state, self.log.next_index(), false);
            }
        }

        let old_commit = state.commit_index;
        state.commit_index = (self.log.next_index() - 1).min(req.leader_commit_index);
        if state.commit_index > old_commit {
            debug!(commit_index = state.commit_index, "follower commit advanced");
            self.commit_notify.notify_one();
        }
        AppendEntriesResponse {
            current_term: state.current_term,
            success: true,
            log_length: self.log.next_index(),
            is_busy: false,
        }
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    async fn replicate_loop(self: Arc<Self>, follower: ServerId) {
        {
            let mut state = self.state.lock().await;
            if state.replicating.contains(&follower) {
                info!(peer = %follower, "another task is already replicating");
                return;
            }
            state.replicating.insert(follower.clone());
        }
        let mut latest_replicating_ok = true;
        loop {
            let params = {
                let state = self.state.lock().await;
                if self.stopped() || state.status != NodeStatus::Leader {
                    break;
                }
                let next = state
                    .next_index
                    .get(&follower)
                    .copied()
                    .unwrap_or_else(|| self.log.next_index());
                if self.log.next_index() <= next {
                    None
                } else {
                    Some((next, state.current_term, state.commit_index))
                }
            };
            let Some((next, current_term, commit_index)) = params else {
                // Bounded wait so leadership changes are noticed.
                tokio::select! {
                    _ = self.replication_notify.notified() => {}
                    _ = time::sleep(Duration::from_secs(2)) => {}
                }
                continue;
            };

            let prev_log_index = next - 1;
            let prev_log_term = if prev_log_index > -1 {
                match self.log.term_at(prev_log_index) {
                    Ok(Some(term)) => term,
                    Ok(None) => {
                        warn!(
                            slot = prev_log_index,
                            peer = %follower,
                            "slot reclaimed, falling back to snapshot install"
                        );
                        self.try_send_snapshot(&follower).await;
                        continue;
                    }
                    Err(err) => {
                        warn!(error = ?err, slot = prev_log_index, "slot read failed");
                        time::sleep(self.config.replication_retry_timespan).await;
                        continue;
                    }
                }
            } else {
                -1
            };

            let mut batch_span = (self.log.next_index() - next).min(self.config.log_rep_batch_max as i64);
            if !latest_replicating_ok {
                // Probe with a single entry after a failure.
                batch_span = batch_span.min(1);
            }
            let mut entries = Vec::with_capacity(batch_span.max(0) as usize);
            let mut max_term = -1;
            let mut bad_slot = false;
            for idx in next..next + batch_span {
                match self.log.read_slot(idx) {
                    Ok(Some(entry)) => {
                        max_term = max_term.max(entry.term);
                        entries.push(entry);
                    }
                    _ => {
                        bad_slot = true;
                        break;
                    }
                }
            }
            if bad_slot {
                warn!(peer = %follower, "bad slot in batch, falling back to snapshot install");
                self.try_send_snapshot(&follower).await;
                continue;
            }
            let sent = entries.len() as i64;
            let req = AppendEntriesRequest {
                term: current_term,
                leader_id: self.config.server_id.clone(),
                prev_log_index,
                prev_log_term,
                leader_commit_index: commit_index,
                entries,
            };

            let reply = time::timeout(
                self.config.rpc_timeout,
                self.transport.append_entries(&follower, req),
            )
            .await;
            let reply = match reply {
                Ok(Ok(resp)) => resp,
                _ => {
                    debug!(peer = %follower, "replicate rpc failed");
                    latest_replicating_ok = false;
                    time::sleep(self.config.replication_retry_timespan).await;
                    continue;
                }
            };

            let mut state = self.state.lock().await;
            if reply.current_term > state.current_term {
                self.trans_to_follower_locked(&mut state, "replicate reply", reply.current_term);
            }
            if state.status != NodeStatus::Leader {
                break;
            }
            if reply.success {
                let new_next = next + sent;
                state.next_index.insert(follower.clone(), new_next);
                state.match_index.insert(follower.clone(), new_next - 1);
                let in_membership =
                    Self::membership_at(&state.changed_members, new_next - 1).contains(&follower);
                if in_membership {
                    if max_term == state.current_term {
                        self.update_commit_index_locked(&mut state, new_next - 1);
                    }
                } else {
                    debug!(peer = %follower, "peer is still joining, not counted for commit");
                }
                if !in_membership
                    && new_next + self.config.min_log_gap >= self.log.next_index()
                {
                    if state.membership_change.is_none() {
                        warn!(peer = %follower, "not in a membership change, maybe timed out");
                        break;
                    }
                    info!(peer = %follower, "new node caught up, writing membership change entry");
                    drop(state);
                    self.write_membership_change_log(&follower).await;
                    continue;
                }
                latest_replicating_ok = true;
            } else if reply.is_busy {
                drop(state);
                debug!(peer = %follower, "peer is busy, backing off");
                time::sleep(self.config.replication_retry_timespan).await;
                latest_replicating_ok = true;
            } else {
                let current = state.next_index.get(&follower).copied().unwrap_or(0);
                let adjusted = (current - 1).min(reply.log_length).max(0);
                state.next_index.insert(follower.clone(), adjusted);
                info!(peer = %follower, next_index = adjusted, "adjusted next index");
            }
        }
        let mut state = self.state.lock().await;
        state.replicating.remove(&follower);
    }

    fn membership_at<'a>(
        changed_members: &'a BTreeMap<i64, Vec<ServerId>>,
        index: i64,
    ) -> &'a Vec<ServerId> {
        changed_members
            .range(..index)
            .next_back()
            .map(|(_, members)| members)
            .expect("membership history always has a base entry")
    }

    fn update_commit_index_locked(&self, state: &mut RoleState, candidate: i64) {
        let members = Self::membership_at(&state.changed_members, candidate);
        let mut match_count = 0usize;
        for member in members {
            if *member == self.config.server_id {
                continue;
            }
            if state.match_index.get(member).copied().unwrap_or(-1) >= candidate {
                match_count += 1;
            }
        }
        // Self counts implicitly: local entries are durable before this runs.
        if match_count + 1 > members.len() / 2 && candidate > state.commit_index {
            // Entries from prior terms are only committed transitively via an
            // entry of the current term.
            match self.log.term_at(candidate) {
                Ok(Some(term)) if term == state.current_term => {
                    state.commit_index = candidate;
                    debug!(commit_index = candidate, "commit index advanced");
                    self.commit_notify.notify_one();
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Apply worker
    // ------------------------------------------------------------------

    async fn apply_loop(self: Arc<Self>) {
        loop {
            if self.stopped() {
                return;
            }
            let (from, to) = {
                let state = self.state.lock().await;
                (state.last_applied, state.commit_index)
            };
            if to <= from {
                tokio::select! {
                    _ = self.commit_notify.notified() => {}
                    _ = time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }
            for index in (from + 1)..=to {
                if self.stopped() {
                    return;
                }
                let (entry, outcome) = {
                    let _snapshot_guard = self.snapshot_mu.lock().await;
                    // A snapshot install may have moved the apply cursor while
                    // this batch was in flight; recompute if so.
                    if self.state.lock().await.last_applied != index - 1 {
                        break;
                    }
                    let entry = match self.log.read_slot(index) {
                        Ok(Some(entry)) => entry,
                        other => {
                            // Committed slots must be readable; anything else
                            // is corruption.
                            panic!("binlog slot {index} unreadable during apply: {other:?}");
                        }
                    };
                    match self.sm.apply(index, &entry) {
                        Ok(outcome) => (entry, outcome),
                        Err(err) => {
                            panic!("apply entry {index} failed: {err:?}");
                        }
                    }
                };

                let mut state = self.state.lock().await;
                state.last_applied = index;
                match entry.op {
                    OpKind::Nop => {
                        if entry.term == state.current_term && state.status == NodeStatus::Leader {
                            if state.in_safe_mode {
                                state.in_safe_mode = false;
                                info!(term = entry.term, "leaving safe mode");
                            }
                        }
                    }
                    OpKind::AddNode => {
                        let addr = entry.key.clone();
                        info!(index, node = %addr, "membership change entry applied");
                        self.update_membership_locked(&mut state, index, &addr);
                        if addr == self.config.server_id && state.in_quiet_mode {
                            // This node is the newcomer; join elections now.
                            state.in_quiet_mode = false;
                            info!("added to the cluster, leaving quiet mode");
                        }
                        if state.status == NodeStatus::Leader {
                            self.ensure_replicator_locked(&mut state, &addr);
                            if !state.single_node_mode && !state.heartbeat_running {
                                state.heartbeat_running = true;
                                let node = self.clone();
                                tokio::spawn(async move { node.heartbeat_loop().await });
                            }
                        }
                    }
                    _ => {}
                }
                if let Some(tx) = state.client_acks.remove(&index) {
                    if entry.op == OpKind::AddNode {
                        state.change_epoch += 1;
                        state.membership_change = None;
                    }
                    let _ = tx.send(AckResult {
                        success: true,
                        status: outcome.status,
                        uuid: outcome.uuid,
                    });
                }
            }
        }
    }

    fn update_membership_locked(&self, state: &mut RoleState, index: i64, addr: &str) {
        if !state.changed_members.contains_key(&index) {
            let mut new_members = state.members.clone();
            if !new_members.contains(&addr.to_string()) {
                new_members.push(addr.to_string());
            }
            state.changed_members.insert(index, new_members);
        }
        if !state.members.iter().any(|m| m == addr) {
            state.members.push(addr.to_string());
        }
        state.single_node_mode =
            state.members.len() == 1 && state.members[0] == self.config.server_id;
    }

    // ------------------------------------------------------------------
    // Membership change
    // ------------------------------------------------------------------

    /// Begin adding `addr` to the cluster. The returned ack resolves when the
    /// AddNode entry commits, or fails on refusal or timeout.
    pub async fn add_node(self: &Arc<Self>, addr: ServerId) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;
        if state.status != NodeStatus::Leader {
            let _ = tx.send(AckResult::failed());
            return rx;
        }
        if state.membership_change.is_some() {
            info!("a membership change is already in progress, refusing");
            let _ = tx.send(AckResult::failed());
            return rx;
        }
        if state.members.iter().any(|m| *m == addr) {
            info!(node = %addr, "already a cluster member, refusing");
            let _ = tx.send(AckResult::failed());
            return rx;
        }
        if state.members.len() + 1 > self.config.max_cluster_size {
            warn!(node = %addr, "cluster is at the configured maximum size");
            let _ = tx.send(AckResult::failed());
            return rx;
        }
        state.change_epoch += 1;
        let epoch = state.change_epoch;
        state.membership_change = Some(MembershipChange {
            addr: addr.clone(),
            log_index: -1,
            epoch,
            responder: Some(tx),
        });
        state.next_index.insert(addr.clone(), 0);
        state.match_index.insert(addr.clone(), -1);
        info!(node = %addr, "starting membership change");
        self.ensure_replicator_locked(&mut state, &addr);
        drop(state);

        let node = self.clone();
        let timeout = self.config.add_node_timeout;
        tokio::spawn(async move {
            time::sleep(timeout).await;
            node.check_membership_change_failure(epoch).await;
        });
        rx
    }

    async fn check_membership_change_failure(&self, epoch: u64) {
        let mut state = self.state.lock().await;
        let matches = state
            .membership_change
            .as_ref()
            .map(|c| c.epoch == epoch)
            .unwrap_or(false);
        if !matches {
            return;
        }
        info!("membership change timed out");
        let mut change = state.membership_change.take().unwrap();
        state.change_epoch += 1;
        let responder = if change.log_index >= 0 {
            state.client_acks.remove(&change.log_index)
        } else {
            change.responder.take()
        };
        if let Some(tx) = responder {
            let _ = tx.send(AckResult::failed());
        }
    }

    /// Once the joining node has caught up, commit it into membership through
    /// the log.
    async fn write_membership_change_log(&self, addr: &str) {
        let _append = self.append_mu.lock().await;
        let mut state = self.state.lock().await;
        let Some(change) = state.membership_change.as_mut() else {
            info!("not in a membership change, maybe timed out");
            return;
        };
        if change.addr != addr || change.log_index >= 0 {
            return;
        }
        let Some(tx) = change.responder.take() else {
            return;
        };
        let index = self.log.next_index();
        change.log_index = index;
        let entry = LogEntry {
            term: state.current_term,
            op: OpKind::AddNode,
            user: String::new(),
            key: addr.to_string(),
            value: String::new(),
        };
        state.client_acks.insert(index, tx);
        self.update_membership_locked(&mut state, index, addr);
        let single_node = state.single_node_mode;
        drop(state);

        if let Err(err) = self.log.append(&entry) {
            warn!(error = ?err, "append membership change entry failed");
            let mut state = self.state.lock().await;
            if let Some(tx) = state.client_acks.remove(&index) {
                let _ = tx.send(AckResult::failed());
            }
            return;
        }
        if single_node {
            let mut state = self.state.lock().await;
            self.update_commit_index_locked(&mut state, index);
        }
        self.replication_notify.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// InstallSnapshot RPC receiver.
    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let mut install = self.snapshot_mu.lock().await;
        let fail = InstallSnapshotResponse { success: false };
        if install.doing_timestamp != -1 {
            if install.doing_timestamp != req.timestamp {
                warn!(
                    in_flight = install.doing_timestamp,
                    rejected = req.timestamp,
                    "already installing a snapshot, refusing another"
                );
                return fail;
            }
        } else {
            install.doing_timestamp = req.timestamp;
            if let Err(err) = self.snapshots.begin_install() {
                warn!(error = ?err, "begin snapshot install failed");
                install.doing_timestamp = -1;
                return fail;
            }
            info!(timestamp = req.timestamp, "receiving snapshot");
        }
        for item in &req.items {
            if let Err(err) = self.snapshots.stage_item(item) {
                warn!(error = ?err, "stage snapshot item failed");
                self.snapshots.abort_install();
                install.doing_timestamp = -1;
                return fail;
            }
        }
        if req.is_last {
            if let Err(err) = self.snapshots.finish_install() {
                warn!(error = ?err, "seal snapshot failed");
                self.snapshots.abort_install();
                install.doing_timestamp = -1;
                return fail;
            }
            install.doing_timestamp = -1;
            info!(timestamp = req.timestamp, "snapshot received, loading");
            if let Err(err) = self.load_snapshot_locked(&install).await {
                warn!(error = ?err, "load received snapshot failed");
                return fail;
            }
        }
        InstallSnapshotResponse { success: true }
    }

    /// Swap the current snapshot into the live state. Caller holds
    /// `snapshot_mu`, which keeps the apply worker out.
    async fn load_snapshot_locked(&self, _install: &InstallState) -> anyhow::Result<bool> {
        let Some((meta, records)) = self.snapshots.read_all()? else {
            anyhow::bail!("no snapshot available");
        };
        info!(
            term = meta.term,
            last_applied = meta.log_index,
            "loading snapshot"
        );
        let mut state = self.state.lock().await;
        self.sm.reset()?;
        for record in records {
            self.sm.restore(record)?;
        }
        self.meta.write_current_term(meta.term)?;
        if !meta.voted_for.is_empty() {
            self.meta.write_voted_for(meta.term, &meta.voted_for)?;
            state.voted_for.insert(meta.term, meta.voted_for.clone());
        }
        state.current_term = meta.term;
        state.last_applied = meta.log_index;
        state.commit_index = meta.log_index;
        state.members = meta.membership.clone();
        state.changed_members = BTreeMap::new();
        let members_snapshot = state.members.clone();
        state.changed_members.insert(-1, members_snapshot);
        let self_in_cluster = state.members.iter().any(|m| *m == self.config.server_id);
        if !self_in_cluster {
            warn!("this node is not in the snapshot's membership");
        }
        if self_in_cluster && state.in_quiet_mode {
            state.in_quiet_mode = false;
            info!("snapshot already contains this node, leaving quiet mode");
        }
        state.single_node_mode =
            state.members.len() == 1 && state.members[0] == self.config.server_id;
        self.log.reset_for_snapshot(meta.log_index + 1, meta.term)?;
        info!(
            last_applied = state.last_applied,
            commit_index = state.commit_index,
            term = state.current_term,
            "snapshot loaded"
        );
        Ok(true)
    }

    async fn snapshot_produce_loop(self: Arc<Self>) {
        let mut interval = time::interval(self.config.snapshot_interval);
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            if self.stopped() {
                return;
            }
            match self.produce_snapshot().await {
                Ok(true) => info!("snapshot produced"),
                Ok(false) => {}
                Err(err) => warn!(error = ?err, "snapshot produce failed"),
            }
        }
    }

    /// Capture {term, votedFor, lastApplied, membership, KV records} and
    /// replace the previous snapshot slot.
    pub async fn produce_snapshot(&self) -> anyhow::Result<bool> {
        let install = self.snapshot_mu.lock().await;
        if install.doing_timestamp != -1 {
            info!("receiving a snapshot, skipping produce");
            return Ok(false);
        }
        let meta = {
            let state = self.state.lock().await;
            if state.last_applied < 0 {
                return Ok(false);
            }
            SnapshotMeta {
                term: state.current_term,
                voted_for: state
                    .voted_for
                    .get(&state.current_term)
                    .cloned()
                    .unwrap_or_default(),
                log_index: state.last_applied,
                membership: state.members.clone(),
            }
        };
        // Holding `snapshot_mu` keeps the apply worker out, so the record
        // dump stays consistent with `meta.log_index`.
        let records = self.sm.raw_records()?;
        self.snapshots.write(&records, &meta)?;
        Ok(true)
    }

    /// Stream the current snapshot to a follower whose required log slots are
    /// gone, then resume replication from the snapshot boundary.
    async fn try_send_snapshot(&self, follower: &str) {
        let install = self.snapshot_mu.lock().await;
        let loaded = match self.snapshots.read_all() {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                warn!(peer = %follower, "no snapshot to send");
                drop(install);
                time::sleep(self.config.replication_retry_timespan).await;
                return;
            }
            Err(err) => {
                warn!(error = ?err, "read snapshot failed");
                drop(install);
                time::sleep(self.config.replication_retry_timespan).await;
                return;
            }
        };
        let (meta, records) = loaded;
        let timestamp = now_us();
        info!(peer = %follower, timestamp, "sending snapshot");

        let mut items = Vec::new();
        let mut pending_bytes = 0usize;
        for record in records {
            pending_bytes += record.user.len() + record.key.len() + record.value.len();
            items.push(SnapshotItem::Record(record));
            if pending_bytes >= self.config.max_snapshot_request_bytes {
                let req = InstallSnapshotRequest {
                    timestamp,
                    items: std::mem::take(&mut items),
                    is_last: false,
                };
                if !self.send_snapshot_chunk(follower, req).await {
                    return;
                }
                pending_bytes = 0;
            }
        }
        items.push(SnapshotItem::Meta(meta.clone()));
        let req = InstallSnapshotRequest {
            timestamp,
            items,
            is_last: true,
        };
        if !self.send_snapshot_chunk(follower, req).await {
            return;
        }
        drop(install);
        info!(peer = %follower, "snapshot sent");

        let mut state = self.state.lock().await;
        state
            .next_index
            .insert(follower.to_string(), meta.log_index + 1);
        state.match_index.insert(follower.to_string(), meta.log_index);
        let in_membership = state.members.iter().any(|m| m == follower);
        if !in_membership
            && meta.log_index + 1 + self.config.min_log_gap >= self.log.next_index()
        {
            if state.membership_change.is_none() {
                warn!("not in a membership change, maybe timed out");
                return;
            }
            info!(peer = %follower, "new node caught up via snapshot, writing membership change entry");
            drop(state);
            self.write_membership_change_log(follower).await;
        }
    }

    async fn send_snapshot_chunk(&self, follower: &str, req: InstallSnapshotRequest) -> bool {
        let reply = time::timeout(
            self.config.rpc_timeout.max(Duration::from_secs(30)),
            self.transport.install_snapshot(follower, req),
        )
        .await;
        match reply {
            Ok(Ok(resp)) if resp.success => true,
            other => {
                warn!(peer = %follower, ?other, "send snapshot chunk failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Binlog GC
    // ------------------------------------------------------------------

    async fn gc_loop(self: Arc<Self>) {
        loop {
            time::sleep(self.config.gc_interval).await;
            if self.stopped() {
                return;
            }
            let (is_leader, members) = {
                let state = self.state.lock().await;
                (state.status == NodeStatus::Leader, state.members.clone())
            };
            if !is_leader {
                continue;
            }
            let mut min_applied = i64::MAX;
            let mut reached_all = true;
            for member in &members {
                let last_applied = if *member == self.config.server_id {
                    self.state.lock().await.last_applied
                } else {
                    match time::timeout(self.config.rpc_timeout, self.transport.show_status(member))
                        .await
                    {
                        Ok(Ok(status)) => status.last_applied,
                        _ => {
                            info!(peer = %member, "failed to fetch last applied for gc");
                            reached_all = false;
                            break;
                        }
                    }
                };
                min_applied = min_applied.min(last_applied);
            }
            if !reached_all {
                continue;
            }
            let safe_clean_index = min_applied - 1;
            let changed = {
                let mut state = self.state.lock().await;
                let old = state.last_safe_clean_index;
                state.last_safe_clean_index = safe_clean_index;
                old != safe_clean_index
            };
            if !changed || safe_clean_index <= 0 {
                continue;
            }
            info!(safe_clean_index, "broadcasting binlog gc");
            let req = CleanBinlogRequest {
                end_index: safe_clean_index,
            };
            for member in &members {
                if *member == self.config.server_id {
                    let _ = self.handle_clean_binlog(req.clone()).await;
                    continue;
                }
                if let Err(err) = time::timeout(
                    self.config.rpc_timeout,
                    self.transport.clean_binlog(member, req.clone()),
                )
                .await
                .map_err(anyhow::Error::from)
                .and_then(|r| r)
                {
                    info!(peer = %member, error = ?err, "clean binlog request failed");
                }
            }
        }
    }

    /// CleanBinlog RPC receiver: refuse to drop entries that have not been
    /// applied locally.
    pub async fn handle_clean_binlog(&self, req: CleanBinlogRequest) -> CleanBinlogResponse {
        {
            let state = self.state.lock().await;
            if state.last_applied < req.end_index {
                warn!(
                    end_index = req.end_index,
                    last_applied = state.last_applied,
                    "refusing unsafe binlog clean"
                );
                return CleanBinlogResponse { success: false };
            }
        }
        info!(end_index = req.end_index, "removing binlog prefix");
        if let Err(err) = self.log.remove_prefix_before(req.end_index) {
            warn!(error = ?err, "binlog gc failed");
            return CleanBinlogResponse { success: false };
        }
        CleanBinlogResponse { success: true }
    }
}
