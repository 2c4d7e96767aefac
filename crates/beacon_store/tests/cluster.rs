//! End-to-end tests: in-process nodes serving the wire protocol on loopback
//! ports, driven through the same framed client the cluster itself uses.

use std::net::TcpListener as StdTcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time;

use beacon_raft::raft::{CleanBinlogRequest, Config, NodeStatus};
use beacon_store::transport::call_once;
use beacon_store::wire::{
    AddNodeRequest, GetRequest, KeepAliveRequest, LockRequest, PutRequest, Request, Response,
    WatchRequest,
};
use beacon_store::{server, NodeState};

fn free_addr() -> String {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("127.0.0.1:{}", addr.port())
}

struct TestNode {
    addr: String,
    state: Arc<NodeState>,
    serve_task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestNode {
    async fn kill(self) {
        self.state.stop().await;
        self.serve_task.abort();
    }
}

fn test_config(server_id: &str, members: Vec<String>, base_dir: &Path) -> Config {
    let mut config = Config::new(server_id.to_string(), members, base_dir.to_path_buf());
    config.elect_timeout_min = Duration::from_millis(300);
    config.elect_timeout_max = Duration::from_millis(600);
    config.heartbeat_interval = Duration::from_millis(50);
    config.rpc_timeout = Duration::from_millis(1_000);
    config.replication_retry_timespan = Duration::from_millis(200);
    // Short sessions keep lock-lockout windows and expiry sweeps testable.
    config.session_expire_timeout_us = 1_000_000;
    config
}

async fn start_node(config: Config) -> TestNode {
    let addr = config.server_id.clone();
    let state = NodeState::start(config).await.expect("start node");
    let listener = TcpListener::bind(&addr).await.expect("bind");
    let serve_task = tokio::spawn(server::serve(listener, state.clone()));
    TestNode {
        addr,
        state,
        serve_task,
    }
}

async fn put(addr: &str, key: &str, value: &str) -> bool {
    let req = Request::Put(PutRequest {
        uuid: String::new(),
        key: key.to_string(),
        value: value.to_string(),
    });
    matches!(call_once(addr, &req).await, Ok(Response::Put(resp)) if resp.success)
}

async fn get(addr: &str, key: &str) -> Option<(bool, String)> {
    let req = Request::Get(GetRequest {
        uuid: String::new(),
        key: key.to_string(),
    });
    match call_once(addr, &req).await {
        Ok(Response::Get(resp)) if resp.success => Some((resp.hit, resp.value)),
        _ => None,
    }
}

async fn keep_alive(addr: &str, session_id: &str) -> bool {
    let req = Request::KeepAlive(KeepAliveRequest {
        session_id: session_id.to_string(),
        uuid: String::new(),
        timeout_milliseconds: None,
        locks: Vec::new(),
        forward_from_leader: false,
    });
    matches!(call_once(addr, &req).await, Ok(Response::KeepAlive(resp)) if resp.success)
}

async fn lock(addr: &str, key: &str, session_id: &str) -> bool {
    let req = Request::Lock(LockRequest {
        uuid: String::new(),
        key: key.to_string(),
        session_id: session_id.to_string(),
    });
    matches!(call_once(addr, &req).await, Ok(Response::Lock(resp)) if resp.success)
}

/// Poll until the predicate holds or panic at the deadline.
async fn wait_until<F, Fut>(what: &str, deadline: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = time::Instant::now();
    loop {
        if predicate().await {
            return;
        }
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        time::sleep(Duration::from_millis(100)).await;
    }
}

async fn status_of(addr: &str) -> Option<beacon_raft::raft::StatusReport> {
    match call_once(addr, &Request::ShowStatus).await {
        Ok(Response::ShowStatus(status)) => Some(status),
        _ => None,
    }
}

async fn find_leader(addrs: &[String]) -> Option<String> {
    for addr in addrs {
        if let Some(status) = status_of(addr).await {
            if status.status == NodeStatus::Leader {
                return Some(addr.clone());
            }
        }
    }
    None
}

async fn wait_for_wire_leader(addrs: &[String], deadline: Duration) -> String {
    let start = time::Instant::now();
    loop {
        if let Some(leader) = find_leader(addrs).await {
            return leader;
        }
        assert!(start.elapsed() < deadline, "no leader elected in time");
        time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_put_then_get() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_addr();
    let node = start_node(test_config(&addr, vec![addr.clone()], dir.path())).await;

    wait_until("first write to succeed", Duration::from_secs(15), || {
        put(&node.addr, "x", "1")
    })
    .await;

    let (hit, value) = get(&node.addr, "x").await.expect("get failed");
    assert!(hit);
    assert_eq!(value, "1");

    let (hit, _) = get(&node.addr, "missing").await.expect("get failed");
    assert!(!hit);

    node.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_passes_to_a_new_session_after_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_addr();
    let node = start_node(test_config(&addr, vec![addr.clone()], dir.path())).await;

    wait_until("leadership", Duration::from_secs(15), || {
        put(&node.addr, "warmup", "1")
    })
    .await;

    assert!(keep_alive(&node.addr, "s1").await);
    // Covers the post-election lock window as well.
    wait_until("s1 to take the lock", Duration::from_secs(15), || {
        lock(&node.addr, "/locks/job", "s1")
    })
    .await;

    // Re-entry by the holder is allowed.
    assert!(lock(&node.addr, "/locks/job", "s1").await);

    // A different live session cannot steal it.
    assert!(keep_alive(&node.addr, "s2").await);
    assert!(!lock(&node.addr, "/locks/job", "s2").await);

    // s1 stops sending keep-alives; after TTL + sweep the lock is released.
    wait_until("the lock to expire", Duration::from_secs(20), || async {
        matches!(get(&node.addr, "/locks/job").await, Some((false, _)))
    })
    .await;

    // Keep s2 alive and take over the lock.
    assert!(keep_alive(&node.addr, "s2").await);
    wait_until("s2 to take the lock", Duration::from_secs(15), || {
        lock(&node.addr, "/locks/job", "s2")
    })
    .await;

    node.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watch_fires_on_put() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_addr();
    let node = start_node(test_config(&addr, vec![addr.clone()], dir.path())).await;

    wait_until("leadership", Duration::from_secs(15), || {
        put(&node.addr, "warmup", "1")
    })
    .await;
    assert!(keep_alive(&node.addr, "s1").await);

    let watch_addr = node.addr.clone();
    let watcher = tokio::spawn(async move {
        call_once(
            &watch_addr,
            &Request::Watch(WatchRequest {
                uuid: String::new(),
                session_id: "s1".to_string(),
                key: "/a/b".to_string(),
                old_value: String::new(),
                key_exist: false,
            }),
        )
        .await
    });

    // Give the registration a moment to land, then change the key.
    time::sleep(Duration::from_millis(300)).await;
    assert!(put(&node.addr, "/a/b", "v").await);

    let response = time::timeout(Duration::from_secs(10), watcher)
        .await
        .expect("watch timed out")
        .expect("watch task failed")
        .expect("watch call failed");
    match response {
        Response::Watch(resp) => {
            assert!(resp.success);
            assert!(!resp.canceled);
            assert_eq!(resp.watch_key, "/a/b");
            assert_eq!(resp.key, "/a/b");
            assert_eq!(resp.value, "v");
            assert!(!resp.deleted);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    node.kill().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_survives_leader_failure() {
    let dir = tempfile::tempdir().unwrap();
    let addrs: Vec<String> = (0..3).map(|_| free_addr()).collect();
    let mut nodes = Vec::new();
    for addr in &addrs {
        nodes.push(start_node(test_config(addr, addrs.clone(), dir.path())).await);
    }

    let leader = wait_for_wire_leader(&addrs, Duration::from_secs(20)).await;

    wait_until("replicated write", Duration::from_secs(15), || {
        put(&leader, "k", "v")
    })
    .await;

    // Followers redirect to the leader.
    for addr in addrs.iter().filter(|a| **a != leader) {
        let req = Request::Get(GetRequest {
            uuid: String::new(),
            key: "k".to_string(),
        });
        if let Ok(Response::Get(resp)) = call_once(addr, &req).await {
            assert!(!resp.success);
            assert_eq!(resp.leader_id, leader);
        }
    }

    // The write is applied everywhere.
    let leader_status = status_of(&leader).await.unwrap();
    for addr in &addrs {
        let target = addr.clone();
        let want = leader_status.last_applied;
        wait_until("apply to converge", Duration::from_secs(15), || {
            let target = target.clone();
            async move {
                status_of(&target)
                    .await
                    .map(|s| s.last_applied >= want)
                    .unwrap_or(false)
            }
        })
        .await;
    }

    // Kill the leader; the survivors elect a replacement and keep serving.
    let leader_addr = leader.clone();
    let position = nodes.iter().position(|n| n.addr == leader_addr).unwrap();
    nodes.remove(position).kill().await;
    let survivors: Vec<String> = addrs.iter().filter(|a| **a != leader_addr).cloned().collect();

    let new_leader = wait_for_wire_leader(&survivors, Duration::from_secs(30)).await;
    assert_ne!(new_leader, leader_addr);

    wait_until("write after failover", Duration::from_secs(15), || {
        put(&new_leader, "k2", "v2")
    })
    .await;
    wait_until("read after failover", Duration::from_secs(15), || async {
        matches!(get(&new_leader, "k").await, Some((true, ref v)) if v == "v")
    })
    .await;

    for node in nodes {
        node.kill().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_add_reaches_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let addrs: Vec<String> = (0..3).map(|_| free_addr()).collect();
    let mut nodes = Vec::new();
    for addr in &addrs {
        nodes.push(start_node(test_config(addr, addrs.clone(), dir.path())).await);
    }

    let leader = wait_for_wire_leader(&addrs, Duration::from_secs(20)).await;
    wait_until("steady state", Duration::from_secs(15), || {
        put(&leader, "seed", "1")
    })
    .await;

    // Boot the newcomer quietly: not in membership, no election timer.
    let new_addr = free_addr();
    let mut joiner_config = test_config(&new_addr, addrs.clone(), dir.path());
    joiner_config.quiet_mode = true;
    nodes.push(start_node(joiner_config).await);

    let response = time::timeout(
        Duration::from_secs(60),
        call_once(
            &leader,
            &Request::AddNode(AddNodeRequest {
                node_addr: new_addr.clone(),
            }),
        ),
    )
    .await
    .expect("add node timed out")
    .expect("add node call failed");
    match response {
        Response::AddNode(resp) => assert!(resp.success),
        other => panic!("unexpected response: {other:?}"),
    }

    // Every node eventually reports four members.
    let mut all_addrs = addrs.clone();
    all_addrs.push(new_addr);
    for addr in &all_addrs {
        let target = addr.clone();
        wait_until("membership to converge", Duration::from_secs(30), || {
            let target = target.clone();
            async move {
                status_of(&target)
                    .await
                    .map(|s| s.members.len() == 4)
                    .unwrap_or(false)
            }
        })
        .await;
    }

    // A quorum of 3/4 still commits writes.
    wait_until("write with the larger quorum", Duration::from_secs(15), || {
        put(&leader, "post-join", "ok")
    })
    .await;

    for node in nodes {
        node.kill().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_carries_a_new_node_past_gced_log() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_addr();
    let node = start_node(test_config(&addr, vec![addr.clone()], dir.path())).await;

    wait_until("leadership", Duration::from_secs(15), || {
        put(&node.addr, "k0", "v0")
    })
    .await;
    for i in 1..20 {
        assert!(put(&node.addr, &format!("k{i}"), &format!("v{i}")).await);
    }

    // Capture the state, then reclaim the log prefix beyond recovery.
    assert!(node.state.raft().produce_snapshot().await.unwrap());
    let status = status_of(&node.addr).await.unwrap();
    let cleaned = node
        .state
        .raft()
        .handle_clean_binlog(CleanBinlogRequest {
            end_index: status.last_applied,
        })
        .await;
    assert!(cleaned.success);

    // A quiet newcomer can only catch up through InstallSnapshot.
    let new_addr = free_addr();
    let mut joiner_config = test_config(&new_addr, vec![addr.clone()], dir.path());
    joiner_config.quiet_mode = true;
    let joiner = start_node(joiner_config).await;

    let response = time::timeout(
        Duration::from_secs(60),
        call_once(
            &node.addr,
            &Request::AddNode(AddNodeRequest {
                node_addr: new_addr.clone(),
            }),
        ),
    )
    .await
    .expect("add node timed out")
    .expect("add node call failed");
    match response {
        Response::AddNode(resp) => assert!(resp.success),
        other => panic!("unexpected response: {other:?}"),
    }

    // The joiner converges to the leader's apply position.
    wait_until("joiner to catch up", Duration::from_secs(30), || async {
        let leader_status = status_of(&node.addr).await;
        let joiner_status = status_of(&new_addr).await;
        match (leader_status, joiner_status) {
            (Some(leader), Some(joiner)) => {
                joiner.members.len() == 2 && joiner.last_applied >= leader.last_applied - 1
            }
            _ => false,
        }
    })
    .await;

    // Follow-up writes replicate normally.
    wait_until("post-snapshot write", Duration::from_secs(15), || {
        put(&node.addr, "after", "snapshot")
    })
    .await;
    wait_until("joiner applies new writes", Duration::from_secs(15), || async {
        let leader_status = status_of(&node.addr).await;
        let joiner_status = status_of(&new_addr).await;
        match (leader_status, joiner_status) {
            (Some(leader), Some(joiner)) => joiner.last_applied == leader.last_applied,
            _ => false,
        }
    })
    .await;

    node.kill().await;
    joiner.kill().await;
}
