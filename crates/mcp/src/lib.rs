//! MCP (Model Context Protocol) wire layer.
//!
//! JSON-RPC 2.0 message types, newline-delimited framing, and a client that
//! multiplexes concurrent requests over one stdio channel. The tool host uses
//! the same protocol types and framing on its side of the channel.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{Client, DEFAULT_TIMEOUT, ServerConfig};
//! use std::collections::HashMap;
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig {
//!     name: "toolhost".to_string(),
//!     command: "toolhost".to_string(),
//!     args: vec!["serve-stdio".to_string()],
//!     env: HashMap::new(),
//! };
//!
//! let client = Client::spawn(config)?;
//! client.initialize(DEFAULT_TIMEOUT).await?;
//!
//! for tool in client.list_tools(DEFAULT_TIMEOUT).await? {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let mut args = serde_json::Map::new();
//! args.insert("text".into(), "bonjour".into());
//! let pending = client.call_tool("call-1".into(), "translate", args).await?;
//! let response = pending.wait(DEFAULT_TIMEOUT).await?;
//! println!("{:?}", response.into_result());
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
pub mod framing;
pub mod protocol;

pub use client::{Client, DEFAULT_TIMEOUT, PendingResponse, ServerConfig};
pub use error::{Error, Result};
pub use framing::{FrameReader, MAX_FRAME_SIZE, write_frame};
pub use protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, MessageKind,
    RequestId, ServerCapabilities, ServerInfo, Tool, ToolContent, ToolsCapability, classify,
};
