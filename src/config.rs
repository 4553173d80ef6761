use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    /// The address peers should use to reach this node. Written into the
    /// bootstrap configuration entry.
    pub advertise_addr: String,
    pub peers: Vec<PeerConfig>,
    /// Directory for log entries and metadata. None keeps everything in
    /// memory (tests).
    pub storage_dir: Option<PathBuf>,
    /// Write the initial configuration entry on an empty log at startup.
    pub bootstrap: bool,

    /// A follower waits for roughly this much inactivity (with jitter)
    /// before starting an election.
    pub follower_timeout_ms: u64,
    /// Expected time to broadcast to the cluster; scales the candidate
    /// retry delay.
    pub candidate_timeout_ms: u64,
    /// A leader sends an AppendEntries to each follower at least this often.
    pub heartbeat_period_ms: u64,
    /// Delay before retrying an RPC to a peer after a transport failure.
    pub rpc_failure_backoff_ms: u64,
    /// Deadline for a single outbound RPC.
    pub rpc_timeout_ms: u64,
    /// Prefer to keep AppendEntries requests under this many payload bytes.
    pub soft_rpc_size_limit: u64,
    /// A staging server that has not caught up after this many full
    /// replication iterations fails the configuration change.
    pub max_catch_up_rounds: u64,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: "127.0.0.1:50051".parse().unwrap(),
            advertise_addr: "127.0.0.1:50051".to_string(),
            peers: Vec::new(),
            storage_dir: None,
            bootstrap: false,
            follower_timeout_ms: 500,
            candidate_timeout_ms: 150,
            heartbeat_period_ms: 75,
            rpc_failure_backoff_ms: 100,
            rpc_timeout_ms: 500,
            soft_rpc_size_limit: 1024 * 1024,
            max_catch_up_rounds: 10,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            advertise_addr: listen_addr.to_string(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }
}
