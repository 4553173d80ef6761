use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tonic::{Request, Response, Status};

use crate::proto::raft_service_server::RaftService;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, GetSupportedRpcVersionsRequest,
    GetSupportedRpcVersionsResponse, VoteRequest, VoteResponse,
};
use crate::raft::RaftConsensus;

const MIN_RPC_VERSION: u32 = 1;
const MAX_RPC_VERSION: u32 = 1;

/// gRPC service for server-to-server Raft communication
pub struct ClusterService {
    consensus: Arc<RaftConsensus>,
}

impl ClusterService {
    pub fn new(consensus: Arc<RaftConsensus>) -> Self {
        Self { consensus }
    }
}

#[tonic::async_trait]
impl RaftService for ClusterService {
    async fn get_supported_rpc_versions(
        &self,
        _request: Request<GetSupportedRpcVersionsRequest>,
    ) -> Result<Response<GetSupportedRpcVersionsResponse>, Status> {
        Ok(Response::new(GetSupportedRpcVersionsResponse {
            min_version: MIN_RPC_VERSION,
            max_version: MAX_RPC_VERSION,
        }))
    }

    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            candidate = req.server_id,
            term = req.term,
            "Received RequestVote"
        );

        let consensus = self.consensus.clone();
        let result = AssertUnwindSafe(async { consensus.handle_request_vote(req).await })
            .catch_unwind()
            .await;

        match result {
            Ok(response) => Ok(Response::new(response)),
            Err(_) => {
                tracing::error!("Panic in RequestVote handler");
                Err(Status::internal("Internal error in RequestVote handler"))
            }
        }
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let is_heartbeat = req.entries.is_empty();
        tracing::trace!(
            leader = req.server_id,
            term = req.term,
            entries = req.entries.len(),
            is_heartbeat,
            "Received AppendEntries"
        );

        let consensus = self.consensus.clone();
        let result = AssertUnwindSafe(async { consensus.handle_append_entries(req).await })
            .catch_unwind()
            .await;

        match result {
            Ok(response) => Ok(Response::new(response)),
            Err(_) => {
                tracing::error!("Panic in AppendEntries handler");
                Err(Status::internal("Internal error in AppendEntries handler"))
            }
        }
    }
}
