use std::sync::Arc;

use tokio::sync::RwLock;
use tonic::{Request, Response, Status};

use crate::error::LedgerError;
use crate::proto::command::Op;
use crate::proto::ledger_service_server::LedgerService;
use crate::proto::set_configuration_response::Status as ConfigStatus;
use crate::proto::{
    AppendCommand, AppendRequest, AppendResponse, DeleteLogCommand, DeleteLogRequest,
    DeleteLogResponse, GetConfigurationRequest, GetConfigurationResponse, GetLastIdRequest,
    GetLastIdResponse, ListLogsRequest, ListLogsResponse, OpenLogCommand, OpenLogRequest,
    OpenLogResponse, ReadRequest, ReadResponse, SetConfigurationRequest, SetConfigurationResponse,
};
use crate::raft::{RaftConsensus, SetConfigurationOutcome};
use crate::state_machine::{encode_command, CommandOutcome, StateMachine};

/// gRPC service for the client-facing API. Writes go through the replicated
/// log; reads are served from the state machine after the leader confirms
/// its lease with a quorum.
pub struct ClientService {
    consensus: Arc<RaftConsensus>,
    state_machine: Arc<RwLock<StateMachine>>,
}

impl ClientService {
    pub fn new(consensus: Arc<RaftConsensus>, state_machine: Arc<RwLock<StateMachine>>) -> Self {
        Self {
            consensus,
            state_machine,
        }
    }

    /// Replicate a command, wait for it to apply, and hand back its outcome.
    async fn submit(&self, op: Op) -> Result<CommandOutcome, Status> {
        let entry_id = self
            .consensus
            .replicate(encode_command(op))
            .await
            .map_err(status_from_error)?;
        self.wait_applied(entry_id).await;
        self.state_machine
            .write()
            .await
            .take_result(entry_id)
            .ok_or_else(|| Status::internal("applied command left no result"))
    }

    async fn wait_applied(&self, entry_id: u64) {
        let mut applied = self.state_machine.read().await.subscribe_applied();
        while *applied.borrow_and_update() < entry_id {
            if applied.changed().await.is_err() {
                return;
            }
        }
    }

    /// Confirm leadership, then wait until the state machine has caught up
    /// to everything committed at that instant. Serves non-stale reads.
    async fn sync_for_read(&self) -> Result<(), Status> {
        let committed_id = self
            .consensus
            .get_last_committed_id()
            .await
            .map_err(status_from_error)?;
        self.wait_applied(committed_id).await;
        Ok(())
    }
}

#[tonic::async_trait]
impl LedgerService for ClientService {
    async fn open_log(
        &self,
        request: Request<OpenLogRequest>,
    ) -> Result<Response<OpenLogResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("Log name cannot be empty"));
        }
        match self.submit(Op::OpenLog(OpenLogCommand { name: req.name })).await? {
            CommandOutcome::OpenLog { log_id } => {
                tracing::info!(log_id, "Log opened");
                Ok(Response::new(OpenLogResponse { log_id }))
            }
            other => Err(Status::internal(format!(
                "unexpected outcome for OpenLog: {other:?}"
            ))),
        }
    }

    async fn delete_log(
        &self,
        request: Request<DeleteLogRequest>,
    ) -> Result<Response<DeleteLogResponse>, Status> {
        let req = request.into_inner();
        self.submit(Op::DeleteLog(DeleteLogCommand { name: req.name }))
            .await?;
        Ok(Response::new(DeleteLogResponse {}))
    }

    async fn list_logs(
        &self,
        _request: Request<ListLogsRequest>,
    ) -> Result<Response<ListLogsResponse>, Status> {
        self.sync_for_read().await?;
        let names = self.state_machine.read().await.list_logs();
        Ok(Response::new(ListLogsResponse { names }))
    }

    async fn append(
        &self,
        request: Request<AppendRequest>,
    ) -> Result<Response<AppendResponse>, Status> {
        let req = request.into_inner();
        match self
            .submit(Op::Append(AppendCommand {
                log_id: req.log_id,
                data: req.data,
            }))
            .await?
        {
            CommandOutcome::Append {
                entry_id: Some(entry_id),
            } => Ok(Response::new(AppendResponse { entry_id })),
            CommandOutcome::Append { entry_id: None } => {
                Err(Status::not_found(format!("Log {} not found", req.log_id)))
            }
            other => Err(Status::internal(format!(
                "unexpected outcome for Append: {other:?}"
            ))),
        }
    }

    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<ReadResponse>, Status> {
        let req = request.into_inner();
        self.sync_for_read().await?;
        let state_machine = self.state_machine.read().await;
        match state_machine.read(req.log_id, req.from) {
            Some(entries) => Ok(Response::new(ReadResponse { entries })),
            None => Err(Status::not_found(format!("Log {} not found", req.log_id))),
        }
    }

    async fn get_last_id(
        &self,
        request: Request<GetLastIdRequest>,
    ) -> Result<Response<GetLastIdResponse>, Status> {
        let req = request.into_inner();
        self.sync_for_read().await?;
        let state_machine = self.state_machine.read().await;
        match state_machine.get_last_id(req.log_id) {
            Some(last_id) => Ok(Response::new(GetLastIdResponse { last_id })),
            None => Err(Status::not_found(format!("Log {} not found", req.log_id))),
        }
    }

    async fn get_configuration(
        &self,
        _request: Request<GetConfigurationRequest>,
    ) -> Result<Response<GetConfigurationResponse>, Status> {
        let (id, servers) = self
            .consensus
            .get_configuration()
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(GetConfigurationResponse { id, servers }))
    }

    async fn set_configuration(
        &self,
        request: Request<SetConfigurationRequest>,
    ) -> Result<Response<SetConfigurationResponse>, Status> {
        let req = request.into_inner();
        if req.new_servers.is_empty() {
            return Err(Status::invalid_argument("New configuration cannot be empty"));
        }
        let outcome = self
            .consensus
            .set_configuration(req.old_id, req.new_servers)
            .await
            .map_err(status_from_error)?;
        let response = match outcome {
            SetConfigurationOutcome::Ok => SetConfigurationResponse {
                status: ConfigStatus::Ok as i32,
                bad_servers: vec![],
            },
            SetConfigurationOutcome::Changed => SetConfigurationResponse {
                status: ConfigStatus::Changed as i32,
                bad_servers: vec![],
            },
            SetConfigurationOutcome::Bad(bad_servers) => SetConfigurationResponse {
                status: ConfigStatus::Bad as i32,
                bad_servers,
            },
        };
        Ok(Response::new(response))
    }
}

fn status_from_error(err: LedgerError) -> Status {
    match err {
        LedgerError::NotLeader(Some(hint)) => {
            Status::failed_precondition(format!("Not the leader. Redirect to {hint}"))
        }
        LedgerError::NotLeader(None) => {
            Status::failed_precondition("Not the leader. Leader unknown, retry later")
        }
        LedgerError::Retry(reason) => Status::unavailable(reason),
        other => Status::internal(other.to_string()),
    }
}
