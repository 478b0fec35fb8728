//! Registry error types.

use thiserror::Error;

use crate::schema::ValidationError;

/// Registry errors.
///
/// Handler faults are not errors at this level: they are reported as
/// [`ToolOutcome::Error`](crate::ToolOutcome::Error).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A tool with this name is already registered.
    #[error("tool already registered: {0}")]
    DuplicateName(String),

    /// No tool with this name is registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The arguments do not satisfy the tool's parameter schema.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub type Result<T> = std::result::Result<T, Error>;
