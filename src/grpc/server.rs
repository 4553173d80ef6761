use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::client_service::ClientService;
use crate::grpc::cluster_service::ClusterService;
use crate::proto::ledger_service_server::LedgerServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::RaftConsensus;
use crate::state_machine::StateMachine;

pub struct GrpcServer {
    addr: SocketAddr,
    consensus: Arc<RaftConsensus>,
    state_machine: Arc<RwLock<StateMachine>>,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        consensus: Arc<RaftConsensus>,
        state_machine: Arc<RwLock<StateMachine>>,
    ) -> Self {
        Self {
            addr,
            consensus,
            state_machine,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let cluster_service = ClusterService::new(self.consensus.clone());
        let client_service =
            ClientService::new(self.consensus.clone(), self.state_machine.clone());

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(RaftServiceServer::new(cluster_service))
            .add_service(LedgerServiceServer::new(client_service))
            .serve_with_shutdown(self.addr, shutdown.cancelled())
            .await
    }
}
