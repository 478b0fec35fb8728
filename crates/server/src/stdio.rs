//! Stdio binding: JSON-RPC 2.0, one message per line.
//!
//! Requests are read sequentially; each `tools/call` runs on its own task,
//! so responses may be written out of order. A single writer task owns the
//! output stream.

use std::sync::Arc;

use mcp::protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PROTOCOL_VERSION,
    SERVER_NOT_INITIALIZED,
};
use mcp::{
    CallToolParams, CallToolResult, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, MessageKind, RequestId, ServerCapabilities, ServerInfo,
    Tool, ToolContent, ToolsCapability, FrameReader, classify, write_frame,
};
use registry::{Registry, ToolDescriptor, ToolOutcome};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::Result;

/// Serve `registry` until `reader` reaches end of stream.
///
/// In-flight calls are allowed to finish before returning.
pub async fn serve<R, W>(registry: Arc<Registry>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(response) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &response).await {
                warn!(error = %e, "failed to write response");
                break;
            }
        }
    });

    info!(tools = registry.len(), "serving tools over stdio");

    let mut reader = FrameReader::new(reader);
    let mut calls = JoinSet::new();
    let mut initialized = false;

    loop {
        let line = match reader.next_frame().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e @ (mcp::Error::FrameTooLarge { .. } | mcp::Error::InvalidFrame(_))) => {
                warn!(error = %e, "discarding unreadable frame");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "input channel failed");
                break;
            }
        };

        // Reap finished calls.
        while calls.try_join_next().is_some() {}

        let frame: Value = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "discarding malformed frame");
                continue;
            }
        };

        match classify(&frame) {
            MessageKind::Request => {}
            MessageKind::Notification => {
                debug!(method = frame["method"].as_str().unwrap_or_default(), "notification");
                continue;
            }
            MessageKind::Response | MessageKind::Invalid => {
                warn!("discarding unexpected frame");
                continue;
            }
        }

        let request: JsonRpcRequest = match serde_json::from_value(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "discarding invalid request");
                continue;
            }
        };
        debug!(id = %request.id, method = %request.method, "request");

        let id = request.id.clone();
        let response = match request.method.as_str() {
            "initialize" => {
                initialized = true;
                JsonRpcResponse::success(id, initialize_result())
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            _ if !initialized => JsonRpcResponse::failure(
                id,
                JsonRpcError::new(SERVER_NOT_INITIALIZED, "server not initialized"),
            ),
            "tools/list" => JsonRpcResponse::success(id, list_tools(&registry)),
            "tools/call" => {
                let params = match parse_call(request.params) {
                    Ok(params) => params,
                    Err(error) => {
                        let _ = tx.send(JsonRpcResponse::failure(id, error));
                        continue;
                    }
                };
                let registry = Arc::clone(&registry);
                let tx = tx.clone();
                calls.spawn(async move {
                    let response = call_tool(&registry, id, params).await;
                    let _ = tx.send(response);
                });
                continue;
            }
            method => JsonRpcResponse::failure(
                id,
                JsonRpcError::new(METHOD_NOT_FOUND, format!("method not found: {method}")),
            ),
        };

        if tx.send(response).is_err() {
            break;
        }
    }

    while calls.join_next().await.is_some() {}
    drop(tx);
    let _ = writer_task.await;
    info!("input closed, stdio server stopping");
    Ok(())
}

fn initialize_result() -> InitializeResult {
    InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: false,
            }),
        },
        server_info: ServerInfo {
            name: "toolhost".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        },
    }
}

fn list_tools(registry: &Registry) -> ListToolsResult {
    ListToolsResult {
        tools: registry.descriptors().map(tool_entry).collect(),
    }
}

fn tool_entry(descriptor: &ToolDescriptor) -> Tool {
    Tool {
        name: descriptor.name.clone(),
        description: Some(descriptor.description.clone()),
        input_schema: serde_json::to_value(&descriptor.parameter_schema)
            .unwrap_or_else(|_| json!({"type": "object"})),
    }
}

fn parse_call(params: Option<Value>) -> std::result::Result<CallToolParams, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::new(INVALID_REQUEST, "missing params"))?;
    serde_json::from_value(params)
        .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("invalid params: {e}")))
}

async fn call_tool(registry: &Registry, id: RequestId, params: CallToolParams) -> JsonRpcResponse {
    let name = params.name;
    let arguments = params.arguments.unwrap_or_default();

    match registry.execute(&name, arguments).await {
        Ok(ToolOutcome::Ok { payload }) => {
            let text = serde_json::to_string(&payload).unwrap_or_default();
            JsonRpcResponse::success(
                id,
                CallToolResult {
                    content: vec![ToolContent::text(text)],
                    structured_content: Some(Value::Object(payload)),
                    is_error: false,
                },
            )
        }
        Ok(ToolOutcome::Error { kind, message }) => {
            debug!(tool = %name, %kind, "tool call failed");
            JsonRpcResponse::success(
                id,
                CallToolResult {
                    content: vec![ToolContent::text(message)],
                    structured_content: None,
                    is_error: true,
                },
            )
        }
        Err(e) => {
            let kind = match &e {
                registry::Error::UnknownTool(_) => "unknown_tool",
                registry::Error::Validation(_) => "validation",
                _ => {
                    return JsonRpcResponse::failure(
                        id,
                        JsonRpcError::new(INTERNAL_ERROR, e.to_string()),
                    );
                }
            };
            JsonRpcResponse::failure(
                id,
                JsonRpcError::new(INVALID_PARAMS, e.to_string()).with_data(json!({"kind": kind})),
            )
        }
    }
}
