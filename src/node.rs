use std::io;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::raft::RaftConsensus;
use crate::state_machine::{apply_loop, StateMachine};

/// Main node that wires the consensus core, the state-machine applier, and
/// the gRPC server together.
pub struct Node {
    pub config: NodeConfig,
    pub consensus: Arc<RaftConsensus>,
    pub state_machine: Arc<RwLock<StateMachine>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> io::Result<Self> {
        let consensus = RaftConsensus::new(config.clone())?;
        Ok(Self {
            config,
            consensus,
            state_machine: Arc::new(RwLock::new(StateMachine::new())),
        })
    }

    /// Run the node until `shutdown` fires.
    ///
    /// Starts the consensus workers (election timer, lease monitor, one
    /// replicator per peer), the applier that feeds committed entries to the
    /// state machine, and the gRPC server, then blocks on the server. On
    /// shutdown all workers are drained before returning.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let worker_handles = self.consensus.init().await;

        let applier = tokio::spawn(apply_loop(
            self.consensus.clone(),
            self.state_machine.clone(),
        ));

        let server = GrpcServer::new(
            self.config.listen_addr,
            self.consensus.clone(),
            self.state_machine.clone(),
        );
        let result = server.run(shutdown).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "gRPC server failed");
        }

        tracing::info!(node_id = self.config.node_id, "Draining workers");
        self.consensus.exit().await;
        self.consensus.join_peer_tasks().await;
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = applier.await;

        result.map_err(Into::into)
    }
}
