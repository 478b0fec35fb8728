//! Tool registry: descriptors, parameter schemas, and handler execution.
//!
//! Core principle: **handler faults never escape as protocol faults.**
//! `execute` reports them as [`ToolOutcome::Error`].

mod command;
mod descriptor;
mod error;
mod handler;
mod outcome;
mod registry;
pub mod schema;

pub use command::{CommandHandler, DEFAULT_COMMAND_TIMEOUT, MAX_OUTPUT_SIZE};
pub use descriptor::ToolDescriptor;
pub use error::{Error, Result};
pub use handler::{Arguments, FnHandler, HandlerError, Payload, ToolHandler, handler_fn};
pub use outcome::{ErrorKind, ToolOutcome};
pub use registry::Registry;
pub use schema::{Issue, ParameterSchema, PropertySchema, ValidationError, ValueType};
