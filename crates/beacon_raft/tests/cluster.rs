//! In-process cluster tests for the Raft engine, wired over an in-memory
//! transport so elections and replication run without sockets.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time;

use beacon_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyOutcome, CleanBinlogRequest,
    CleanBinlogResponse, Config, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry,
    NodeStatus, OpKind, RaftNode, RawRecord, StateMachine, StatusReport, Transport, VoteRequest,
    VoteResponse,
};

/// State machine capturing applied entries in memory.
#[derive(Default)]
struct MemMachine {
    cursor: AtomicI64,
    applied: Mutex<Vec<(i64, LogEntry)>>,
    data: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemMachine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cursor: AtomicI64::new(-1),
            ..Self::default()
        })
    }

    fn applied_entries(&self) -> Vec<(i64, LogEntry)> {
        self.applied.lock().unwrap().clone()
    }

    fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.data
            .lock()
            .unwrap()
            .get(&(String::new(), key.to_string()))
            .cloned()
    }
}

impl StateMachine for MemMachine {
    fn apply(&self, index: i64, entry: &LogEntry) -> anyhow::Result<ApplyOutcome> {
        match entry.op {
            OpKind::Put => {
                self.data.lock().unwrap().insert(
                    (entry.user.clone(), entry.key.clone()),
                    entry.value.clone().into_bytes(),
                );
            }
            OpKind::Del => {
                self.data
                    .lock()
                    .unwrap()
                    .remove(&(entry.user.clone(), entry.key.clone()));
            }
            _ => {}
        }
        self.applied.lock().unwrap().push((index, entry.clone()));
        self.cursor.store(index, Ordering::SeqCst);
        Ok(ApplyOutcome::default())
    }

    fn last_applied(&self) -> anyhow::Result<i64> {
        Ok(self.cursor.load(Ordering::SeqCst))
    }

    fn raw_records(&self) -> anyhow::Result<Vec<RawRecord>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .iter()
            .map(|((user, key), value)| RawRecord {
                user: user.clone(),
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    fn reset(&self) -> anyhow::Result<()> {
        self.data.lock().unwrap().clear();
        Ok(())
    }

    fn restore(&self, record: RawRecord) -> anyhow::Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert((record.user, record.key), record.value);
        Ok(())
    }
}

/// In-memory transport routing RPCs straight into peer nodes.
#[derive(Default)]
struct LoopbackTransport {
    nodes: Mutex<HashMap<String, Arc<RaftNode>>>,
    down: Mutex<HashSet<String>>,
}

impl LoopbackTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, addr: &str, node: Arc<RaftNode>) {
        self.nodes.lock().unwrap().insert(addr.to_string(), node);
    }

    fn take_down(&self, addr: &str) {
        self.down.lock().unwrap().insert(addr.to_string());
    }

    fn lookup(&self, addr: &str) -> anyhow::Result<Arc<RaftNode>> {
        if self.down.lock().unwrap().contains(addr) {
            anyhow::bail!("peer {addr} is down");
        }
        self.nodes
            .lock()
            .unwrap()
            .get(addr)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown peer {addr}"))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn append_entries(
        &self,
        target: &str,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        Ok(self.lookup(target)?.handle_append_entries(req).await)
    }

    async fn request_vote(&self, target: &str, req: VoteRequest) -> anyhow::Result<VoteResponse> {
        Ok(self.lookup(target)?.handle_vote(req).await)
    }

    async fn install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        Ok(self.lookup(target)?.handle_install_snapshot(req).await)
    }

    async fn clean_binlog(
        &self,
        target: &str,
        req: CleanBinlogRequest,
    ) -> anyhow::Result<CleanBinlogResponse> {
        Ok(self.lookup(target)?.handle_clean_binlog(req).await)
    }

    async fn show_status(&self, target: &str) -> anyhow::Result<StatusReport> {
        Ok(self.lookup(target)?.status().await)
    }
}

struct TestNode {
    node: Arc<RaftNode>,
    machine: Arc<MemMachine>,
    _dir: tempfile::TempDir,
}

fn test_config(server_id: &str, members: Vec<String>, dir: &std::path::Path) -> Config {
    let mut config = Config::new(server_id.to_string(), members, dir.to_path_buf());
    config.elect_timeout_min = Duration::from_millis(150);
    config.elect_timeout_max = Duration::from_millis(300);
    config.heartbeat_interval = Duration::from_millis(40);
    config.rpc_timeout = Duration::from_millis(500);
    config.replication_retry_timespan = Duration::from_millis(100);
    config
}

async fn start_node(
    server_id: &str,
    members: Vec<String>,
    transport: &Arc<LoopbackTransport>,
) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(server_id, members, dir.path());
    let keyspace = fjall::Config::new(dir.path().join("db")).open().unwrap();
    let machine = MemMachine::new();
    let node = RaftNode::start(config, keyspace, machine.clone(), transport.clone())
        .await
        .unwrap();
    transport.register(server_id, node.clone());
    TestNode {
        node,
        machine,
        _dir: dir,
    }
}

async fn wait_for_leader(nodes: &[&TestNode], deadline: Duration) -> usize {
    let start = time::Instant::now();
    loop {
        for (i, test_node) in nodes.iter().enumerate() {
            let status = test_node.node.status().await;
            if status.status == NodeStatus::Leader {
                return i;
            }
        }
        assert!(start.elapsed() < deadline, "no leader elected in time");
        time::sleep(Duration::from_millis(50)).await;
    }
}

async fn propose_ok(node: &Arc<RaftNode>, key: &str, value: &str) {
    let rx = node
        .propose(
            OpKind::Put,
            String::new(),
            key.to_string(),
            value.to_string(),
        )
        .await
        .expect("propose");
    let ack = time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("ack timed out")
        .expect("ack dropped");
    assert!(ack.success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_applies_writes() {
    let transport = LoopbackTransport::new();
    let a = start_node("a", vec!["a".to_string()], &transport).await;

    // Single-node clusters take leadership on the first timer tick.
    wait_for_leader(&[&a], Duration::from_secs(5)).await;
    propose_ok(&a.node, "x", "1").await;

    let status = a.node.status().await;
    assert_eq!(status.last_applied, 0);
    assert_eq!(status.commit_index, 0);
    assert_eq!(a.machine.value("x").unwrap(), b"1");
    a.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vote_is_stable_within_a_term() {
    let transport = LoopbackTransport::new();
    // Quiet mode keeps the node out of elections so terms stay predictable.
    let a = start_node_quiet("a", vec!["b".to_string(), "x".to_string()], &transport).await;

    let granted = a
        .node
        .handle_vote(VoteRequest {
            term: 5,
            candidate_id: "b".to_string(),
            last_log_index: 10,
            last_log_term: 5,
        })
        .await;
    assert!(granted.vote_granted);

    // Same term, different candidate: the earlier grant holds.
    let denied = a
        .node
        .handle_vote(VoteRequest {
            term: 5,
            candidate_id: "x".to_string(),
            last_log_index: 20,
            last_log_term: 5,
        })
        .await;
    assert!(!denied.vote_granted);
    assert_eq!(denied.term, 5);

    // A fresh term with an up-to-date (empty-vs-empty) log is granted again.
    let next_term = a
        .node
        .handle_vote(VoteRequest {
            term: 6,
            candidate_id: "b".to_string(),
            last_log_index: -1,
            last_log_term: -1,
        })
        .await;
    assert!(next_term.vote_granted);
    a.node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_elect_and_replicate() {
    let transport = LoopbackTransport::new();
    let members: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    let a = start_node("a", members.clone(), &transport).await;
    let b = start_node("b", members.clone(), &transport).await;
    let c = start_node("c", members.clone(), &transport).await;
    let nodes = [&a, &b, &c];

    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(10)).await;
    let leader = &nodes[leader_idx].node;

    propose_ok(leader, "k", "v").await;

    // Every node applies the same entries in the same order.
    let deadline = time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut behind = false;
        for test_node in &nodes {
            if test_node.machine.value("k").is_none() {
                behind = true;
            }
        }
        if !behind {
            break;
        }
        assert!(time::Instant::now() < deadline, "replication stalled");
        time::sleep(Duration::from_millis(50)).await;
    }
    let reference = nodes[leader_idx].machine.applied_entries();
    for test_node in &nodes {
        let applied = test_node.machine.applied_entries();
        assert_eq!(applied.len(), reference.len());
        for ((left_index, left), (right_index, right)) in applied.iter().zip(reference.iter()) {
            assert_eq!(left_index, right_index);
            assert_eq!(left.term, right.term);
            assert_eq!(left.key, right.key);
            assert_eq!(left.value, right.value);
        }
    }

    // At most one leader per term.
    let mut leaders_by_term: HashMap<i64, usize> = HashMap::new();
    for test_node in &nodes {
        let status = test_node.node.status().await;
        if status.status == NodeStatus::Leader {
            *leaders_by_term.entry(status.term).or_insert(0) += 1;
        }
    }
    for (term, count) in leaders_by_term {
        assert!(count <= 1, "term {term} has {count} leaders");
    }

    for test_node in &nodes {
        test_node.node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reelection_after_leader_failure() {
    let transport = LoopbackTransport::new();
    let members: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    let a = start_node("a", members.clone(), &transport).await;
    let b = start_node("b", members.clone(), &transport).await;
    let c = start_node("c", members.clone(), &transport).await;
    let nodes = [&a, &b, &c];

    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(10)).await;
    propose_ok(&nodes[leader_idx].node, "before", "1").await;

    // Kill the leader.
    let leader_id = nodes[leader_idx].node.server_id().to_string();
    nodes[leader_idx].node.stop().await;
    transport.take_down(&leader_id);

    let survivors: Vec<&TestNode> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader_idx)
        .map(|(_, n)| *n)
        .collect();
    let new_leader_idx = wait_for_leader(&survivors, Duration::from_secs(15)).await;
    let new_leader = &survivors[new_leader_idx].node;
    assert_ne!(new_leader.server_id(), leader_id);

    // The new leader still serves writes with a quorum of two.
    propose_ok(new_leader, "after", "2").await;
    for survivor in &survivors {
        let deadline = time::Instant::now() + Duration::from_secs(10);
        while survivor.machine.value("after").is_none() {
            assert!(time::Instant::now() < deadline, "survivor missed the write");
            time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(survivor.machine.value("before").unwrap(), b"1");
    }

    for survivor in survivors {
        survivor.node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_install_restores_state_and_log_position() {
    let transport = LoopbackTransport::new();
    let a = start_node("a", vec!["a".to_string()], &transport).await;
    wait_for_leader(&[&a], Duration::from_secs(5)).await;

    for i in 0..10 {
        propose_ok(&a.node, &format!("k{i}"), &format!("v{i}")).await;
    }
    assert!(a.node.produce_snapshot().await.unwrap());

    // Reclaim the whole prefix so a newcomer must take the snapshot path.
    let status = a.node.status().await;
    let clean = a
        .node
        .handle_clean_binlog(CleanBinlogRequest {
            end_index: status.last_applied,
        })
        .await;
    assert!(clean.success);

    // A quiet newcomer joins; catch-up must go through InstallSnapshot.
    let d = start_node_quiet("d", vec!["a".to_string()], &transport).await;
    let rx = a.node.add_node("d".to_string()).await;
    let ack = time::timeout(Duration::from_secs(30), rx)
        .await
        .expect("add node timed out")
        .expect("add node dropped");
    assert!(ack.success);

    let deadline = time::Instant::now() + Duration::from_secs(15);
    loop {
        let leader_status = a.node.status().await;
        let joiner_status = d.node.status().await;
        if joiner_status.last_applied == leader_status.last_applied
            && joiner_status.members.len() == 2
        {
            break;
        }
        assert!(time::Instant::now() < deadline, "joiner never caught up");
        time::sleep(Duration::from_millis(100)).await;
    }
    for i in 0..10 {
        assert_eq!(
            d.machine.value(&format!("k{i}")).unwrap(),
            format!("v{i}").into_bytes()
        );
    }

    // Follow-up writes replicate normally to the joined node.
    propose_ok(&a.node, "post", "snap").await;
    let deadline = time::Instant::now() + Duration::from_secs(10);
    while d.machine.value("post").is_none() {
        assert!(time::Instant::now() < deadline, "post-join write missed");
        time::sleep(Duration::from_millis(50)).await;
    }

    a.node.stop().await;
    d.node.stop().await;
}

async fn start_node_quiet(
    server_id: &str,
    members: Vec<String>,
    transport: &Arc<LoopbackTransport>,
) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(server_id, members, dir.path());
    config.quiet_mode = true;
    let keyspace = fjall::Config::new(dir.path().join("db")).open().unwrap();
    let machine = MemMachine::new();
    let node = RaftNode::start(config, keyspace, machine.clone(), transport.clone())
        .await
        .unwrap();
    transport.register(server_id, node.clone());
    TestNode {
        node,
        machine,
        _dir: dir,
    }
}
