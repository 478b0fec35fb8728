//! Tool host: serves a [`registry::Registry`] over HTTP or stdio JSON-RPC.
//!
//! Tools are declared in `toolhost.toml` and executed by external commands.

pub mod config;
mod error;
pub mod http;
pub mod stdio;

pub use config::{Config, ConfigError};
pub use error::{Error, Result};
