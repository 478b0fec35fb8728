//! Server error types.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] mcp::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
