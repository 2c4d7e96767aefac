//! beacon_store: the coordination service node.
//!
//! `NodeState` glues the Raft engine to the storage, session, watch, and
//! account managers, and implements the client-facing operations with their
//! leader checks and redirects. The wire server in `server` dispatches framed
//! requests into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tracing::{debug, info, warn};

use beacon_raft::raft::{Config, NodeStatus, OpKind, RaftNode, RoleSnapshot, RpcStatus};

pub mod kv;
pub mod server;
pub mod session;
pub mod state_machine;
pub mod stats;
pub mod transport;
pub mod user;
pub mod watch;
pub mod wire;

use kv::{encode_value, parse_value, StoreEngine, ValueTag, TAG_LAST_APPLIED_INDEX};
use session::{Session, SessionLocks, SessionTable};
use state_machine::CoordStateMachine;
use stats::{RpcStats, StatOp};
use transport::TcpTransport;
use user::UserManager;
use watch::{bind_key, WatchHub};
use wire::{
    AddNodeRequest, AddNodeResponse, DelRequest, DelResponse, GetRequest, GetResponse,
    KeepAliveRequest, KeepAliveResponse, LockRequest, LockResponse, LoginRequest, LoginResponse,
    LogoutRequest, LogoutResponse, PutRequest, PutResponse, RegisterRequest, RegisterResponse,
    Request, Response, RpcStatRequest, RpcStatResponse, ScanItem, ScanRequest, ScanResponse,
    StatInfo, UnlockRequest, UnlockResponse, WatchRequest, WatchResponse,
};

/// Scan responses are capped near the transport's comfortable payload size.
const MAX_SCAN_BYTES: usize = 26 << 20;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(i64::MAX as u128) as i64
}

pub struct NodeState {
    raft: Arc<RaftNode>,
    store: Arc<StoreEngine>,
    sessions: Arc<SessionTable>,
    session_locks: Arc<SessionLocks>,
    watches: Arc<WatchHub>,
    users: Arc<UserManager>,
    transport: Arc<TcpTransport>,
    stats: Arc<RpcStats>,
    session_ttl_us: i64,
    started_at_us: i64,
    stop: AtomicBool,
}

impl NodeState {
    /// Build and start a node. `config.data_dir` is the shared base; each
    /// node keeps its state under a sub-directory derived from its id.
    pub async fn start(mut config: Config) -> anyhow::Result<Arc<Self>> {
        let sub_dir = config.server_id.replace(':', "_");
        config.data_dir = config.data_dir.join(sub_dir);
        std::fs::create_dir_all(&config.data_dir).context("create node data dir")?;

        let keyspace = fjall::Config::new(config.data_dir.join("db"))
            .open()
            .context("open node keyspace")?;
        let store = Arc::new(StoreEngine::open(keyspace.clone())?);
        let users = Arc::new(UserManager::open(keyspace.clone())?);
        let sessions = Arc::new(SessionTable::new());
        let session_locks = Arc::new(SessionLocks::new());
        let watches = Arc::new(WatchHub::new());
        let transport = Arc::new(TcpTransport::new());

        let machine = Arc::new(CoordStateMachine::new(
            store.clone(),
            session_locks.clone(),
            watches.clone(),
            users.clone(),
        ));
        let session_ttl_us = config.session_expire_timeout_us;
        let raft = RaftNode::start(config, keyspace, machine, transport.clone()).await?;

        let node = Arc::new(Self {
            raft,
            store,
            sessions,
            session_locks,
            watches,
            users,
            transport,
            stats: Arc::new(RpcStats::new()),
            session_ttl_us,
            started_at_us: now_us(),
            stop: AtomicBool::new(false),
        });
        {
            let node = node.clone();
            tokio::spawn(async move { node.session_sweeper().await });
        }
        {
            let node = node.clone();
            tokio::spawn(async move { node.stats_ticker().await });
        }
        Ok(node)
    }

    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.raft.stop().await;
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// The consensus engine; exposed for admin tooling and tests.
    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Redirect hint for non-leaders: the last known leader for followers, an
    /// empty id mid-election.
    fn leader_redirect(role: &RoleSnapshot) -> Option<String> {
        match role.status {
            NodeStatus::Leader => None,
            NodeStatus::Follower => Some(role.current_leader.clone()),
            NodeStatus::Candidate => Some(String::new()),
        }
    }

    fn uuid_is_current(&self, uuid: &str) -> bool {
        uuid.is_empty() || self.users.is_logged_in(uuid)
    }

    /// Post-election lockout: locks and scans wait out one session TTL after
    /// a leader transition so existing keep-alives can re-register.
    fn in_lock_lockout(&self, role: &RoleSnapshot) -> bool {
        role.status == NodeStatus::Leader
            && role.leader_since_us > 0
            && now_us() - role.leader_since_us < self.session_ttl_us
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn session_sweeper(self: Arc<Self>) {
        loop {
            tokio::time::sleep(SESSION_SWEEP_INTERVAL).await;
            if self.stopped() {
                return;
            }
            let expired = self.sessions.remove_expired(now_us());
            if expired.is_empty() {
                continue;
            }
            info!(count = expired.len(), "removing expired sessions");
            for session in &expired {
                debug!(session = %session.session_id, "session expired");
                self.watches.remove_session(&session.session_id);
            }

            let mut unlock_keys = Vec::new();
            for session in &expired {
                for key in self.session_locks.take(&session.session_id) {
                    unlock_keys.push((key, session.clone()));
                }
            }

            let role = self.raft.role().await;
            if role.status != NodeStatus::Leader {
                continue;
            }
            // Expiry effects replicate through the log so replicas converge.
            for (key, session) in unlock_keys {
                let user = self.users.username_from_uuid(&session.uuid);
                if let Err(err) = self
                    .raft
                    .propose_background(OpKind::Unlock, user, key, session.session_id.clone())
                    .await
                {
                    warn!(error = ?err, "append expiry unlock failed");
                }
            }
            for session in expired {
                if session.uuid.is_empty() {
                    continue;
                }
                if let Err(err) = self
                    .raft
                    .propose_background(OpKind::Logout, session.uuid, String::new(), String::new())
                    .await
                {
                    warn!(error = ?err, "append expiry logout failed");
                }
            }
        }
    }

    async fn stats_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if self.stopped() {
                return;
            }
            self.stats.tick();
        }
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    pub async fn put(&self, req: PutRequest) -> PutResponse {
        self.stats.record(StatOp::Put);
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return PutResponse {
                leader_id,
                ..Default::default()
            };
        }
        if !self.uuid_is_current(&req.uuid) {
            return PutResponse {
                uuid_expired: true,
                ..Default::default()
            };
        }
        let user = self.users.username_from_uuid(&req.uuid);
        self.write_op(OpKind::Put, user, req.key, req.value).await
    }

    pub async fn del(&self, req: DelRequest) -> DelResponse {
        self.stats.record(StatOp::Delete);
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return DelResponse {
                leader_id,
                ..Default::default()
            };
        }
        if !self.uuid_is_current(&req.uuid) {
            return DelResponse {
                uuid_expired: true,
                ..Default::default()
            };
        }
        let user = self.users.username_from_uuid(&req.uuid);
        let put = self.write_op(OpKind::Del, user, req.key, String::new()).await;
        DelResponse {
            success: put.success,
            leader_id: put.leader_id,
            uuid_expired: false,
        }
    }

    async fn write_op(&self, op: OpKind, user: String, key: String, value: String) -> PutResponse {
        match self.raft.propose(op, user, key, value).await {
            Ok(rx) => match rx.await {
                Ok(ack) if ack.success => PutResponse {
                    success: true,
                    ..Default::default()
                },
                _ => PutResponse::default(),
            },
            Err(err) => {
                debug!(error = ?err, "write rejected");
                PutResponse::default()
            }
        }
    }

    pub async fn get(&self, req: GetRequest) -> GetResponse {
        self.stats.record(StatOp::Get);
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return GetResponse {
                leader_id,
                ..Default::default()
            };
        }
        if role.in_safe_mode {
            info!("leader is still in safe mode");
            return GetResponse::default();
        }
        if !self.uuid_is_current(&req.uuid) {
            return GetResponse {
                uuid_expired: true,
                ..Default::default()
            };
        }
        // Confirm leadership before reading; stale leaders must not answer.
        if let Err(err) = self.raft.read_barrier().await {
            debug!(error = ?err, "read barrier failed");
            return GetResponse::default();
        }
        let user = self.users.username_from_uuid(&req.uuid);
        match self.store.get(&user, &req.key) {
            Ok(Some(raw)) => match parse_value(&raw) {
                Some((ValueTag::Lock, holder)) => {
                    let holder = String::from_utf8_lossy(holder).into_owned();
                    if self.sessions.contains(&holder) {
                        GetResponse {
                            success: true,
                            hit: true,
                            value: holder,
                            ..Default::default()
                        }
                    } else {
                        // A lock held by a dead session reads as absent.
                        GetResponse {
                            success: true,
                            ..Default::default()
                        }
                    }
                }
                Some((ValueTag::Put, payload)) => GetResponse {
                    success: true,
                    hit: true,
                    value: String::from_utf8_lossy(payload).into_owned(),
                    ..Default::default()
                },
                None => GetResponse {
                    success: true,
                    ..Default::default()
                },
            },
            Ok(None) => GetResponse {
                success: true,
                ..Default::default()
            },
            Err(err) => {
                warn!(error = ?err, "store read failed");
                GetResponse::default()
            }
        }
    }

    fn lock_is_available(&self, user: &str, key: &str, session_id: &str) -> bool {
        match self.store.get(user, key) {
            Ok(Some(raw)) => match parse_value(&raw) {
                Some((ValueTag::Lock, holder)) => {
                    let holder = String::from_utf8_lossy(holder);
                    if holder == session_id {
                        // Re-entry by the holding session.
                        true
                    } else {
                        !self.sessions.contains(&holder) && self.sessions.contains(session_id)
                    }
                }
                // A plain value occupies the key.
                _ => false,
            },
            Ok(None) => self.sessions.contains(session_id),
            Err(_) => false,
        }
    }

    pub async fn lock(&self, req: LockRequest) -> LockResponse {
        self.stats.record(StatOp::Lock);
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return LockResponse {
                leader_id,
                ..Default::default()
            };
        }
        if !self.uuid_is_current(&req.uuid) {
            return LockResponse {
                uuid_expired: true,
                ..Default::default()
            };
        }
        if role.in_safe_mode {
            info!("leader is still in safe mode");
            return LockResponse::default();
        }
        if self.in_lock_lockout(&role) {
            info!("leader is still in the post-election lock window");
            return LockResponse::default();
        }
        let user = self.users.username_from_uuid(&req.uuid);
        if !self.lock_is_available(&user, &req.key, &req.session_id) {
            debug!(key = %req.key, "lock is held by another session");
            return LockResponse::default();
        }
        info!(key = %req.key, session = %req.session_id, "granting lock");
        // Optimistic local grant; idempotent with the apply-time write.
        if let Err(err) = self.store.put_raw(
            &user,
            &req.key,
            &encode_value(ValueTag::Lock, req.session_id.as_bytes()),
        ) {
            warn!(error = ?err, "optimistic lock write failed");
            return LockResponse::default();
        }
        match self
            .raft
            .propose(OpKind::Lock, user, req.key, req.session_id)
            .await
        {
            Ok(rx) => match rx.await {
                Ok(ack) if ack.success => LockResponse {
                    success: true,
                    ..Default::default()
                },
                _ => LockResponse::default(),
            },
            Err(_) => LockResponse::default(),
        }
    }

    pub async fn unlock(&self, req: UnlockRequest) -> UnlockResponse {
        self.stats.record(StatOp::Unlock);
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return UnlockResponse {
                leader_id,
                ..Default::default()
            };
        }
        if !self.uuid_is_current(&req.uuid) {
            return UnlockResponse {
                uuid_expired: true,
                ..Default::default()
            };
        }
        let user = self.users.username_from_uuid(&req.uuid);
        match self
            .raft
            .propose(OpKind::Unlock, user, req.key, req.session_id)
            .await
        {
            Ok(rx) => match rx.await {
                Ok(ack) if ack.success => UnlockResponse {
                    success: true,
                    ..Default::default()
                },
                _ => UnlockResponse::default(),
            },
            Err(_) => UnlockResponse::default(),
        }
    }

    pub async fn scan(&self, req: ScanRequest) -> ScanResponse {
        self.stats.record(StatOp::Scan);
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return ScanResponse {
                leader_id,
                ..Default::default()
            };
        }
        if !self.uuid_is_current(&req.uuid) {
            return ScanResponse {
                uuid_expired: true,
                ..Default::default()
            };
        }
        if role.in_safe_mode {
            info!("leader is still in safe mode");
            return ScanResponse::default();
        }
        if self.in_lock_lockout(&role) {
            info!("leader is still in the post-election scan window");
            return ScanResponse::default();
        }
        let user = self.users.username_from_uuid(&req.uuid);
        let mut items = Vec::new();
        let mut has_more = false;
        let mut payload_bytes = 0usize;
        let result = self
            .store
            .scan_visit(&user, &req.start_key, &req.end_key, |key, raw| {
                if items.len() as i32 > req.size_limit || payload_bytes > MAX_SCAN_BYTES {
                    has_more = true;
                    return false;
                }
                if key == TAG_LAST_APPLIED_INDEX {
                    return true;
                }
                let Some((tag, payload)) = parse_value(raw) else {
                    return true;
                };
                let value = String::from_utf8_lossy(payload).into_owned();
                if tag == ValueTag::Lock && !self.sessions.contains(&value) {
                    // Expired lock holders are elided from scans.
                    return true;
                }
                payload_bytes += key.len() + value.len();
                items.push(ScanItem {
                    key: key.to_string(),
                    value,
                });
                true
            });
        match result {
            Ok(()) => ScanResponse {
                success: true,
                items,
                has_more,
                ..Default::default()
            },
            Err(err) => {
                warn!(error = ?err, "scan failed");
                ScanResponse::default()
            }
        }
    }

    pub async fn watch(&self, req: WatchRequest) -> WatchResponse {
        self.stats.record(StatOp::Watch);
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return WatchResponse {
                leader_id,
                ..Default::default()
            };
        }
        if !self.uuid_is_current(&req.uuid) {
            return WatchResponse {
                uuid_expired: true,
                ..Default::default()
            };
        }
        let user = self.users.username_from_uuid(&req.uuid);
        let bound = bind_key(&user, &req.key);
        let rx = self.watches.register(&bound, &req.session_id);

        // Re-check the key once keep-alives have had a chance to register, so
        // a stale caller view fires immediately instead of parking forever.
        if now_us() - self.started_at_us > self.session_ttl_us {
            if let Ok(current) = self.store.get(&user, &req.key) {
                let key_exist = current.is_some();
                let parsed = current.as_deref().and_then(parse_value);
                let real_value = parsed
                    .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
                    .unwrap_or_default();
                let is_lock = matches!(parsed, Some((ValueTag::Lock, _)));
                if real_value != req.old_value || key_exist != req.key_exist {
                    info!(key = %req.key, new = %real_value, old = %req.old_value, "watch is already stale");
                    self.watches.trigger_by_session_and_key(
                        &req.session_id,
                        &bound,
                        &real_value,
                        !key_exist,
                    );
                } else if is_lock && !self.sessions.contains(&real_value) {
                    info!(key = %req.key, "watched lock holder is expired");
                    self.watches
                        .trigger_by_session_and_key(&req.session_id, &bound, "", true);
                }
            }
        }

        match rx.await {
            Ok(fired) => WatchResponse {
                success: true,
                watch_key: fired.watch_key,
                key: fired.key,
                value: fired.value,
                deleted: fired.deleted,
                canceled: fired.canceled,
                ..Default::default()
            },
            Err(_) => WatchResponse::default(),
        }
    }

    pub async fn keep_alive(&self, req: KeepAliveRequest) -> KeepAliveResponse {
        self.stats.record(StatOp::KeepAlive);
        let role = self.raft.role().await;
        if !req.forward_from_leader {
            if let Some(leader_id) = Self::leader_redirect(&role) {
                return KeepAliveResponse {
                    success: false,
                    leader_id,
                };
            }
        }
        let ttl_us = req
            .timeout_milliseconds
            .map(|ms| ms.saturating_mul(1000))
            .unwrap_or(self.session_ttl_us);
        debug!(session = %req.session_id, "session keep-alive");
        self.sessions.upsert(Session {
            session_id: req.session_id.clone(),
            uuid: req.uuid.clone(),
            last_timeout_us: now_us() + ttl_us,
        });
        self.session_locks
            .replace(&req.session_id, req.locks.iter().cloned());

        // Leaders forward keep-alives best-effort so session state converges.
        if role.status == NodeStatus::Leader && !req.forward_from_leader {
            for member in role.members.iter().filter(|m| m.as_str() != self.raft.server_id()) {
                let transport = self.transport.clone();
                let member = member.clone();
                let mut forward = req.clone();
                forward.forward_from_leader = true;
                tokio::spawn(async move {
                    if let Err(err) = transport.forward_keep_alive(&member, forward).await {
                        debug!(peer = %member, error = ?err, "keep-alive forward failed");
                    }
                });
            }
        }
        KeepAliveResponse {
            success: true,
            leader_id: String::new(),
        }
    }

    pub async fn login(&self, req: LoginRequest) -> LoginResponse {
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return LoginResponse {
                status: RpcStatus::Error,
                uuid: String::new(),
                leader_id,
            };
        }
        if !self.users.is_valid_user(&req.username) {
            return LoginResponse {
                status: RpcStatus::UnknownUser,
                uuid: String::new(),
                leader_id: String::new(),
            };
        }
        let uuid = UserManager::calc_uuid(&req.username);
        match self
            .raft
            .propose(OpKind::Login, uuid, req.username, req.passwd)
            .await
        {
            Ok(rx) => match rx.await {
                Ok(ack) => LoginResponse {
                    status: ack.status,
                    uuid: ack.uuid,
                    leader_id: String::new(),
                },
                Err(_) => LoginResponse {
                    status: RpcStatus::Error,
                    uuid: String::new(),
                    leader_id: String::new(),
                },
            },
            Err(_) => LoginResponse {
                status: RpcStatus::Error,
                uuid: String::new(),
                leader_id: String::new(),
            },
        }
    }

    pub async fn logout(&self, req: LogoutRequest) -> LogoutResponse {
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return LogoutResponse {
                status: RpcStatus::Error,
                leader_id,
            };
        }
        if !req.uuid.is_empty() && !self.users.is_logged_in(&req.uuid) {
            return LogoutResponse {
                status: RpcStatus::UnknownUser,
                leader_id: String::new(),
            };
        }
        match self
            .raft
            .propose(OpKind::Logout, req.uuid, String::new(), String::new())
            .await
        {
            Ok(rx) => match rx.await {
                Ok(ack) => LogoutResponse {
                    status: ack.status,
                    leader_id: String::new(),
                },
                Err(_) => LogoutResponse {
                    status: RpcStatus::Error,
                    leader_id: String::new(),
                },
            },
            Err(_) => LogoutResponse {
                status: RpcStatus::Error,
                leader_id: String::new(),
            },
        }
    }

    pub async fn register(&self, req: RegisterRequest) -> RegisterResponse {
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return RegisterResponse {
                status: RpcStatus::Error,
                leader_id,
            };
        }
        match self
            .raft
            .propose(OpKind::Register, String::new(), req.username, req.passwd)
            .await
        {
            Ok(rx) => match rx.await {
                Ok(ack) => RegisterResponse {
                    status: ack.status,
                    leader_id: String::new(),
                },
                Err(_) => RegisterResponse {
                    status: RpcStatus::Error,
                    leader_id: String::new(),
                },
            },
            Err(_) => RegisterResponse {
                status: RpcStatus::Error,
                leader_id: String::new(),
            },
        }
    }

    pub async fn add_node(&self, req: AddNodeRequest) -> AddNodeResponse {
        let role = self.raft.role().await;
        if let Some(leader_id) = Self::leader_redirect(&role) {
            return AddNodeResponse {
                success: false,
                leader_id,
            };
        }
        let rx = self.raft.add_node(req.node_addr).await;
        match rx.await {
            Ok(ack) => AddNodeResponse {
                success: ack.success,
                leader_id: String::new(),
            },
            Err(_) => AddNodeResponse::default(),
        }
    }

    pub async fn rpc_stat(&self, req: RpcStatRequest) -> RpcStatResponse {
        let role = self.raft.role().await;
        let ops: Vec<StatOp> = if req.ops.is_empty() {
            StatOp::ALL.to_vec()
        } else {
            req.ops.iter().filter_map(|c| StatOp::from_code(*c)).collect()
        };
        let stats = ops
            .into_iter()
            .map(|op| StatInfo {
                current_stat: self.stats.current(op),
                average_stat: self.stats.average(op),
            })
            .collect();
        RpcStatResponse {
            status: role.status,
            stats,
        }
    }

    /// Route one wire request to its handler.
    pub async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::AppendEntries(req) => {
                Response::AppendEntries(self.raft.handle_append_entries(req).await)
            }
            Request::Vote(req) => Response::Vote(self.raft.handle_vote(req).await),
            Request::InstallSnapshot(req) => {
                Response::InstallSnapshot(self.raft.handle_install_snapshot(req).await)
            }
            Request::CleanBinlog(req) => {
                Response::CleanBinlog(self.raft.handle_clean_binlog(req).await)
            }
            Request::ShowStatus => Response::ShowStatus(self.raft.status().await),
            Request::Put(req) => Response::Put(self.put(req).await),
            Request::Get(req) => Response::Get(self.get(req).await),
            Request::Del(req) => Response::Del(self.del(req).await),
            Request::Lock(req) => Response::Lock(self.lock(req).await),
            Request::Unlock(req) => Response::Unlock(self.unlock(req).await),
            Request::Scan(req) => Response::Scan(self.scan(req).await),
            Request::Watch(req) => Response::Watch(self.watch(req).await),
            Request::KeepAlive(req) => Response::KeepAlive(self.keep_alive(req).await),
            Request::Login(req) => Response::Login(self.login(req).await),
            Request::Logout(req) => Response::Logout(self.logout(req).await),
            Request::Register(req) => Response::Register(self.register(req).await),
            Request::AddNode(req) => Response::AddNode(self.add_node(req).await),
            Request::RpcStat(req) => Response::RpcStat(self.rpc_stat(req).await),
        }
    }
}
