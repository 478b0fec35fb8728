use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("protocol state error: {0}")]
    ProtocolState(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error(transparent)]
    Validation(#[from] registry::ValidationError),

    #[error("tool {tool} rejected arguments: {message}")]
    Rejected { tool: String, message: String },

    #[error("decision error: {0}")]
    Decision(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("tool {tool} failed: {message}")]
    Execution { tool: String, message: String },

    #[error("session closed")]
    SessionClosed,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),
}

impl Error {
    /// True when the session can no longer serve requests.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionClosed | Self::ConnectionLost(_))
    }
}

impl From<mcp::Error> for Error {
    fn from(e: mcp::Error) -> Self {
        match e {
            mcp::Error::Timeout(limit) => Self::Timeout(limit),
            mcp::Error::Cancelled => Self::Cancelled,
            mcp::Error::ConnectionLost(reason) => Self::ConnectionLost(reason),
            mcp::Error::NotInitialized => Self::ProtocolState(e.to_string()),
            mcp::Error::DuplicateRequestId(_) => Self::ProtocolState(e.to_string()),
            mcp::Error::Spawn(_) | mcp::Error::Io(_) => Self::Connection(e.to_string()),
            mcp::Error::Serialize(_)
            | mcp::Error::InvalidResponse(_)
            | mcp::Error::InvalidFrame(_)
            | mcp::Error::FrameTooLarge { .. }
            | mcp::Error::JsonRpc(_) => {
                Self::InvalidResponse(e.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
