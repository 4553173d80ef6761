//! Test harness for multi-node cluster integration tests.
//!
//! Provides utilities for spawning, managing, and testing in-process
//! clusters that communicate over real loopback gRPC.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ledger_lite::config::{NodeConfig, PeerConfig};
use ledger_lite::grpc::GrpcServer;
use ledger_lite::proto::ledger_service_client::LedgerServiceClient;
use ledger_lite::proto::Entry;
use ledger_lite::raft::{RaftConsensus, Role};
use ledger_lite::state_machine::{apply_loop, StateMachine};

/// Test node configuration with shorter timeouts for faster tests.
pub fn test_node_config(node_id: u64, port: u16, peers: Vec<(u64, u16)>) -> NodeConfig {
    let peer_configs: Vec<PeerConfig> = peers
        .into_iter()
        .map(|(id, p)| PeerConfig {
            node_id: id,
            addr: format!("127.0.0.1:{}", p),
        })
        .collect();

    NodeConfig {
        node_id,
        listen_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
        advertise_addr: format!("127.0.0.1:{}", port),
        peers: peer_configs,
        storage_dir: None,
        bootstrap: true,
        // Shorter timeouts for faster tests
        follower_timeout_ms: 150,
        candidate_timeout_ms: 50,
        heartbeat_period_ms: 30,
        rpc_failure_backoff_ms: 50,
        rpc_timeout_ms: 100,
        soft_rpc_size_limit: 1024 * 1024,
        max_catch_up_rounds: 5,
    }
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: u64,
    pub port: u16,
    pub consensus: Arc<RaftConsensus>,
    pub state_machine: Arc<RwLock<StateMachine>>,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    applier_handle: JoinHandle<()>,
    grpc_handle: JoinHandle<()>,
}

impl TestNode {
    pub async fn is_leader(&self) -> bool {
        self.consensus.status().await.role == Role::Leader
    }

    pub async fn current_term(&self) -> u64 {
        self.consensus.status().await.current_term
    }

    pub async fn committed_id(&self) -> u64 {
        self.consensus.status().await.committed_id
    }

    pub async fn last_log_id(&self) -> u64 {
        self.consensus.status().await.last_log_id
    }

    pub async fn log_entries(&self) -> Vec<Entry> {
        self.consensus.log_entries().await
    }

    /// Stop the node as if it crashed: the gRPC server stops answering and
    /// every consensus worker is drained.
    pub async fn kill(self) {
        self.shutdown.cancel();
        self.consensus.exit().await;
        self.consensus.join_peer_tasks().await;
        for handle in &self.worker_handles {
            handle.abort();
        }
        self.applier_handle.abort();
        self.grpc_handle.abort();
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        // Abort all tasks to ensure clean shutdown
        self.shutdown.cancel();
        for handle in &self.worker_handles {
            handle.abort();
        }
        self.applier_handle.abort();
        self.grpc_handle.abort();
    }
}

/// Test cluster managing multiple nodes
pub struct TestCluster {
    pub nodes: HashMap<u64, TestNode>,
    #[allow(dead_code)]
    base_port: u16,
}

impl TestCluster {
    /// Create and start a cluster with n nodes, ids 1..=n.
    pub async fn new(num_nodes: usize, base_port: u16) -> Self {
        let mut cluster = Self {
            nodes: HashMap::new(),
            base_port,
        };

        let all_peers: Vec<(u64, u16)> = (0..num_nodes)
            .map(|i| ((i + 1) as u64, base_port + i as u16))
            .collect();

        for i in 0..num_nodes {
            let node_id = (i + 1) as u64;
            let port = base_port + i as u16;
            let peers: Vec<(u64, u16)> = all_peers
                .iter()
                .filter(|(id, _)| *id != node_id)
                .copied()
                .collect();

            let config = test_node_config(node_id, port, peers);
            let test_node = start_node(config).await;
            cluster.nodes.insert(node_id, test_node);
        }

        // Give the gRPC servers a moment to bind before elections start.
        tokio::time::sleep(Duration::from_millis(50)).await;

        cluster
    }

    /// Wait for leader election with timeout
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<u64> {
        let result = wait_for(
            || async {
                for node in self.nodes.values() {
                    if node.is_leader().await {
                        return true;
                    }
                }
                false
            },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await;

        if result {
            self.get_leader_id().await
        } else {
            None
        }
    }

    pub async fn get_leader_id(&self) -> Option<u64> {
        for node in self.nodes.values() {
            if node.is_leader().await {
                return Some(node.node_id);
            }
        }
        None
    }

    pub fn get_node(&self, node_id: u64) -> Option<&TestNode> {
        self.nodes.get(&node_id)
    }

    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in self.nodes.values() {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }

    /// Stop a node, simulating a crash.
    pub async fn kill_node(&mut self, node_id: u64) -> bool {
        match self.nodes.remove(&node_id) {
            Some(node) => {
                node.kill().await;
                true
            }
            None => false,
        }
    }

    /// Wait for a new leader among remaining nodes (excluding a specific node)
    pub async fn wait_for_new_leader(
        &self,
        excluded_node: u64,
        timeout_duration: Duration,
    ) -> Option<u64> {
        let result = wait_for(
            || async {
                for (node_id, node) in self.nodes.iter() {
                    if *node_id != excluded_node && node.is_leader().await {
                        return true;
                    }
                }
                false
            },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await;

        if result {
            for (node_id, node) in self.nodes.iter() {
                if *node_id != excluded_node && node.is_leader().await {
                    return Some(*node_id);
                }
            }
        }
        None
    }

    /// Wait until every node's commit index reaches `min_committed`.
    pub async fn wait_for_commit_on_all(
        &self,
        min_committed: u64,
        timeout_duration: Duration,
    ) -> bool {
        wait_for(
            || async {
                for node in self.nodes.values() {
                    if node.committed_id().await < min_committed {
                        return false;
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(20),
        )
        .await
    }

    /// Verify that all nodes agree on the overlapping prefix of their logs
    /// and that every committed entry is identical everywhere.
    pub async fn verify_log_consistency(&self) -> bool {
        let mut logs = Vec::new();
        for node in self.nodes.values() {
            logs.push(node.log_entries().await);
        }
        let Some(first) = logs.first() else {
            return true;
        };
        for other in &logs[1..] {
            let overlap = first.len().min(other.len());
            for i in 0..overlap {
                if first[i].term == other[i].term && first[i] != other[i] {
                    return false;
                }
            }
        }
        true
    }

    /// A gRPC client for the given node's client API.
    pub async fn client(
        &self,
        node_id: u64,
    ) -> LedgerServiceClient<tonic::transport::Channel> {
        let port = self.get_node(node_id).expect("node exists").port;
        LedgerServiceClient::connect(format!("http://127.0.0.1:{}", port))
            .await
            .expect("client connects")
    }
}

/// Start a single node's full stack: consensus workers, applier, gRPC.
pub async fn start_node(config: NodeConfig) -> TestNode {
    let node_id = config.node_id;
    let port = config.listen_addr.port();
    let listen_addr = config.listen_addr;

    let consensus = RaftConsensus::new(config).expect("consensus opens");
    let state_machine = Arc::new(RwLock::new(StateMachine::new()));
    let shutdown = CancellationToken::new();

    let worker_handles = consensus.init().await;

    let applier_handle = tokio::spawn(apply_loop(consensus.clone(), state_machine.clone()));

    let grpc_server = GrpcServer::new(listen_addr, consensus.clone(), state_machine.clone());
    let grpc_shutdown = shutdown.clone();
    let grpc_handle = tokio::spawn(async move {
        if let Err(e) = grpc_server.run(grpc_shutdown).await {
            tracing::error!("gRPC server error: {}", e);
        }
    });

    TestNode {
        node_id,
        port,
        consensus,
        state_machine,
        shutdown,
        worker_handles,
        applier_handle,
        grpc_handle,
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
