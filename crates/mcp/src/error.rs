//! MCP error types.

use std::time::Duration;

use crate::protocol::{JsonRpcError, RequestId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn server: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("server not initialized")]
    NotInitialized,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("request cancelled: channel closed")]
    Cancelled,

    #[error("timeout after {0:?} waiting for response")]
    Timeout(Duration),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request id {0} is already in flight")]
    DuplicateRequestId(RequestId),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

pub type Result<T> = std::result::Result<T, Error>;
