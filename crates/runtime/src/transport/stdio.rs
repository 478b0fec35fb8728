//! Persistent JSON-RPC binding over a child process's stdio (or any stream pair).
//!
//! Requires the `initialize` handshake before discovery or calls. Calls are
//! issued under their correlation id, so results route correctly regardless
//! of arrival order. A timed-out call tears the channel down.

use std::sync::Arc;
use std::time::Duration;

use mcp::{CallToolResult, Client, JsonRpcResponse, RequestId, ServerConfig, Tool, ToolContent};
use registry::{ErrorKind, Payload, ToolDescriptor};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use super::{DEFAULT_CALL_TIMEOUT, DEFAULT_DISCOVERY_TIMEOUT, PendingCall, Transport};
use crate::call::{CorrelationId, ToolCall, ToolResult};
use crate::{Error, Result};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

enum Endpoint {
    Process(ServerConfig),
    Streams(Option<(Reader, Writer)>),
}

/// Stdio transport backed by an MCP client connection.
pub struct StdioTransport {
    endpoint: Endpoint,
    client: Option<Arc<Client>>,
    call_timeout: Duration,
    discovery_timeout: Duration,
    handshake_timeout: Duration,
}

impl StdioTransport {
    /// Launch `config` as a child process on `connect`.
    pub fn spawn(config: ServerConfig) -> Self {
        Self::with_endpoint(Endpoint::Process(config))
    }

    /// Use an already-open stream pair. It can be connected once.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_endpoint(Endpoint::Streams(Some((Box::new(reader), Box::new(writer)))))
    }

    fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            client: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            handshake_timeout: mcp::DEFAULT_TIMEOUT,
        }
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn ready(&self) -> Result<Arc<Client>> {
        match &self.client {
            Some(client) if client.is_initialized() => Ok(Arc::clone(client)),
            _ => Err(Error::ProtocolState(
                "initialize has not completed".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.endpoint {
            Endpoint::Process(config) => write!(f, "stdio({})", config.name),
            Endpoint::Streams(_) => f.write_str("stdio(streams)"),
        }
    }
}

impl Transport for StdioTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.client.as_ref().is_some_and(|c| c.is_open()) {
            return Ok(());
        }

        let client = match &mut self.endpoint {
            Endpoint::Process(config) => {
                Client::spawn(config.clone()).map_err(|e| Error::Connection(e.to_string()))?
            }
            Endpoint::Streams(streams) => {
                let (reader, writer) = streams.take().ok_or_else(|| {
                    Error::Connection("channel streams were already consumed".to_string())
                })?;
                Client::connect("stdio", reader, writer)
            }
        };

        match client.initialize(self.handshake_timeout).await {
            Ok(result) => {
                info!(
                    server = %result.server_info.name,
                    protocol = %result.protocol_version,
                    "connected over stdio"
                );
                self.client = Some(Arc::new(client));
                Ok(())
            }
            Err(e) => {
                client.terminate("handshake failed");
                Err(Error::Connection(format!("handshake failed: {e}")))
            }
        }
    }

    async fn discover(&mut self) -> Result<Vec<ToolDescriptor>> {
        let client = self.ready()?;

        let tools = match client.list_tools(self.discovery_timeout).await {
            Ok(tools) => tools,
            Err(mcp::Error::Timeout(limit)) => {
                client.terminate("tools/list timed out");
                return Err(Error::Timeout(limit));
            }
            Err(e) => return Err(e.into()),
        };

        let tools = tools
            .into_iter()
            .map(descriptor_from_tool)
            .collect::<Result<Vec<_>>>()?;
        info!(count = tools.len(), "discovered tools");
        Ok(tools)
    }

    async fn send(&mut self, call: ToolCall) -> Result<PendingCall> {
        let client = self.ready()?;
        let ToolCall {
            tool_name,
            arguments,
            correlation_id,
        } = call;

        let pending = client
            .call_tool(
                RequestId::String(correlation_id.to_string()),
                &tool_name,
                arguments,
            )
            .await?;

        let limit = self.call_timeout;
        let id = correlation_id.clone();
        Ok(PendingCall::new(correlation_id, async move {
            match pending.wait(limit).await {
                Ok(response) => result_from_response(id, &tool_name, response),
                Err(mcp::Error::Timeout(limit)) => {
                    warn!(tool = %tool_name, correlation_id = %id, "call timed out, closing channel");
                    client.terminate(format!("call {id} timed out"));
                    Err(Error::Timeout(limit))
                }
                Err(e) => Err(e.into()),
            }
        }))
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.client
            .as_ref()
            .is_some_and(|c| c.is_initialized() && c.is_open())
    }
}

fn descriptor_from_tool(tool: Tool) -> Result<ToolDescriptor> {
    let schema = serde_json::from_value(tool.input_schema).map_err(|e| {
        Error::InvalidResponse(format!("tool {} has an unreadable schema: {e}", tool.name))
    })?;

    Ok(ToolDescriptor {
        name: tool.name,
        description: tool.description.unwrap_or_default(),
        parameter_schema: schema,
    })
}

fn result_from_response(
    id: CorrelationId,
    tool: &str,
    response: JsonRpcResponse,
) -> Result<ToolResult> {
    let value = match response.into_result() {
        Ok(value) => value,
        Err(error) => {
            let kind = match error.kind().and_then(ErrorKind::parse) {
                Some(kind) => kind,
                None if error.code == mcp::protocol::INVALID_PARAMS => ErrorKind::Validation,
                None => ErrorKind::Execution,
            };
            return Ok(ToolResult::error(id, kind, error.message));
        }
    };

    let result: CallToolResult = serde_json::from_value(value)
        .map_err(|e| Error::InvalidResponse(format!("tools/call result for {tool}: {e}")))?;

    if result.is_error {
        return Ok(ToolResult::error(id, ErrorKind::Execution, result.text()));
    }

    Ok(ToolResult::ok(id, payload_from(result)))
}

/// `structuredContent` wins; otherwise the first text block, parsed as a JSON
/// object when possible.
fn payload_from(result: CallToolResult) -> Payload {
    if let Some(Value::Object(payload)) = result.structured_content {
        return payload;
    }

    let Some(text) = result.content.iter().find_map(ToolContent::as_text) else {
        return Payload::new();
    };

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(payload)) => payload,
        _ => {
            let mut payload = Payload::new();
            payload.insert("text".to_string(), Value::String(text.to_string()));
            payload
        }
    }
}
