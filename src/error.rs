use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Not the leader, current leader hint: {0:?}")]
    NotLeader(Option<String>),

    #[error("Transient condition, retry: {0}")]
    Retry(String),

    #[error("Log not found: {0}")]
    LogNotFound(u64),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
