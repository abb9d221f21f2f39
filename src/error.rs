use thiserror::Error;

/// Failures at the transport and configuration boundaries.
///
/// Everything past the privileged-call boundary is reported as an
/// [`OperationResult`](crate::protocol::OperationResult); this type only
/// describes what can go wrong while getting there.
#[derive(Debug, Error)]
pub enum Error {
    #[error("privileged helper not found, please install lindy_helper")]
    HelperNotFound,
    #[error("failed to start elevation mechanism: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("helper exited with {status:?}: {stderr}")]
    HelperFailed {
        status: Option<i32>,
        stderr: String,
        stdout: String,
    },
    #[error("helper returned an unreadable response: {0}")]
    InvalidResponse(String),
    #[error("{program} failed: {stderr}")]
    CommandFailed { program: String, stderr: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid block id: {0:?}")]
    InvalidBlockId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
