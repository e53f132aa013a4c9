use std::io;
use std::sync::Arc;

use thiserror::Error;
use tonic::{Code, Status};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("invalid catalog endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid user metadata: {0}")]
    InvalidUser(String),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    // Status is large; keep the Result small on the happy path.
    #[error("catalog rpc failed: {0}")]
    Rpc(#[from] Box<Status>),

    #[error("volume {0} has no resource spec")]
    MissingVolumeSpec(String),

    #[error("list records stream already consumed")]
    StreamConsumed,
}

impl From<Status> for CatalogError {
    fn from(status: Status) -> Self {
        CatalogError::Rpc(Box::new(status))
    }
}

#[derive(Error, Debug)]
pub enum LocationDbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("file size {0} does not fit the database")]
    SizeOverflow(u64),
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("volume {0} is on the staging")]
    Busy(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("list records streaming error: {0}")]
    Stream(CatalogError),

    #[error("volume {0} not found in cache")]
    VolumeNotCached(String),

    #[error("location db error: {0}")]
    LocationDb(#[from] LocationDbError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} channel closed before the pipeline finished")]
    ChannelClosed(&'static str),

    #[error("staging canceled")]
    Canceled,

    #[error("staging task aborted: {0}")]
    Aborted(String),

    /// Outcome of a build shared by every caller coalesced onto it.
    #[error(transparent)]
    Shared(Arc<StageError>),
}

#[derive(Error, Debug)]
pub enum MountError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {output}")]
    Failed {
        program: &'static str,
        status: std::process::ExitStatus,
        output: String,
    },
}

/// Errors surfaced by the node service, one per gRPC status class.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}

impl NodeError {
    pub fn code(&self) -> Code {
        match self {
            NodeError::InvalidArgument(_) => Code::InvalidArgument,
            NodeError::Unavailable(_) => Code::Unavailable,
            NodeError::Internal(_) => Code::Internal,
            NodeError::Unimplemented(_) => Code::Unimplemented,
        }
    }
}

impl From<StageError> for NodeError {
    fn from(e: StageError) -> Self {
        match e {
            StageError::InvalidArgument(msg) => NodeError::InvalidArgument(msg),
            busy @ StageError::Busy(_) => NodeError::Unavailable(busy.to_string()),
            other => NodeError::Internal(other.to_string()),
        }
    }
}

impl From<MountError> for NodeError {
    fn from(e: MountError) -> Self {
        NodeError::Internal(e.to_string())
    }
}

impl From<io::Error> for NodeError {
    fn from(e: io::Error) -> Self {
        NodeError::Internal(e.to_string())
    }
}
