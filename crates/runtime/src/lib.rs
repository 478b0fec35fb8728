//! Tool invocation runtime: transports, decision providers, and sessions.
//!
//! This crate provides the client side of remote tool invocation: a session
//! that discovers tools over a transport, asks a decision provider which tool
//! to call, dispatches the call, and merges the result into a final answer.
//!
//! # Overview
//!
//! - **Session**: owns one [`Transport`] and one [`DecisionProvider`] and
//!   drives the `connect → discover → handle* → close` lifecycle.
//! - **Transport**: [`HttpTransport`] (one request per call) or
//!   [`StdioTransport`] (JSON-RPC channel with a handshake and concurrent
//!   calls matched by correlation id).
//! - **DecisionProvider**: picks a tool or answers directly. [`GeminiBackend`]
//!   is the bundled implementation.
//!
//! # Example
//!
//! ```ignore
//! use runtime::{GeminiBackend, HttpTransport, Session};
//!
//! # async fn example() -> runtime::Result<()> {
//! let backend = GeminiBackend::builder("AIza...", "gemini-2.5-flash").build()?;
//! let transport = HttpTransport::new("http://127.0.0.1:8000");
//!
//! let mut session = Session::new(transport, backend);
//! session.connect().await?;
//! let turn = session.handle("Translate 'good morning'").await?;
//! println!("{}", turn.text);
//! session.close().await;
//! # Ok(())
//! # }
//! ```

mod call;
mod decision;
mod error;
pub mod providers;
mod session;
pub mod transport;

pub use call::{CorrelationId, ToolCall, ToolResult};
pub use decision::{
    Decision, DecisionProvider, DirectOnly, FunctionDeclaration, function_declarations,
    parse_decision_text, parse_function_call,
};
pub use error::{Error, Result};
pub use providers::{DecisionMode, GeminiBackend};
pub use session::{ArgumentHook, Exchange, Session, SessionState, Turn};
pub use transport::{HttpTransport, PendingCall, StdioTransport, Transport};
