//! Request/reply binding over HTTP.
//!
//! `GET {base}/tools` for discovery, `POST {base}/tools/{name}` per call.
//! Calls with binary arguments are sent as multipart bodies.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use registry::{Arguments, ErrorKind, Issue, ToolDescriptor, ValidationError};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DEFAULT_CALL_TIMEOUT, DEFAULT_DISCOVERY_TIMEOUT, PendingCall, Transport};
use crate::call::{CorrelationId, ToolCall, ToolResult};
use crate::{Error, Result};

struct Connected {
    client: reqwest::Client,
    base: Url,
    /// Tool name -> base64-carried fields, from the last discovery.
    binary_fields: HashMap<String, Vec<String>>,
    cancel: CancellationToken,
}

impl Connected {
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Connection(format!("`{}` cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// HTTP transport. Each call is an independent request.
pub struct HttpTransport {
    base_url: String,
    call_timeout: Duration,
    discovery_timeout: Duration,
    state: Option<Connected>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            state: None,
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

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn connected(&self) -> Result<&Connected> {
        self.state
            .as_ref()
            .ok_or_else(|| Error::ProtocolState("transport is not connected".into()))
    }
}

impl std::fmt::Display for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "http({})", self.base_url)
    }
}

impl Transport for HttpTransport {
    async fn connect(&mut self) -> Result<()> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| Error::Connection(format!("invalid base URL `{}`: {e}", self.base_url)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(self.discovery_timeout)
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;

        self.state = Some(Connected {
            client,
            base,
            binary_fields: HashMap::new(),
            cancel: CancellationToken::new(),
        });
        Ok(())
    }

    async fn discover(&mut self) -> Result<Vec<ToolDescriptor>> {
        let limit = self.discovery_timeout;
        let conn = self
            .state
            .as_mut()
            .ok_or_else(|| Error::ProtocolState("transport is not connected".into()))?;

        let url = conn.endpoint(&["tools"])?;
        let response = conn
            .client
            .get(url)
            .timeout(limit)
            .send()
            .await
            .map_err(|e| request_error(e, limit))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::InvalidResponse(format!("GET /tools returned {status}")));
        }

        let tools: Vec<ToolDescriptor> = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        conn.binary_fields = tools
            .iter()
            .map(|t| {
                let fields = t.parameter_schema.binary_fields().map(String::from).collect();
                (t.name.clone(), fields)
            })
            .collect();

        info!(count = tools.len(), base = %conn.base, "discovered tools");
        Ok(tools)
    }

    async fn send(&mut self, call: ToolCall) -> Result<PendingCall> {
        let limit = self.call_timeout;
        let conn = self.connected()?;

        let url = conn.endpoint(&["tools", &call.tool_name])?;
        let binary = conn
            .binary_fields
            .get(&call.tool_name)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let request = conn.client.post(url).timeout(limit);
        let request = if binary.iter().any(|f| call.arguments.contains_key(f)) {
            request.multipart(multipart_form(&call.arguments, binary)?)
        } else {
            request.json(&call.arguments)
        };

        debug!(
            tool = %call.tool_name,
            correlation_id = %call.correlation_id,
            "POST tool call"
        );

        let cancel = conn.cancel.clone();
        let id = call.correlation_id.clone();
        Ok(PendingCall::new(call.correlation_id, async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = exchange(request, id, call.tool_name, limit) => result,
            }
        }))
    }

    async fn close(&mut self) {
        if let Some(conn) = self.state.take() {
            conn.cancel.cancel();
        }
    }

    fn is_connected(&self) -> bool {
        self.state.is_some()
    }
}

async fn exchange(
    request: RequestBuilder,
    id: CorrelationId,
    tool: String,
    limit: Duration,
) -> Result<ToolResult> {
    let response = request.send().await.map_err(|e| request_error(e, limit))?;
    let status = response.status();

    if status.is_success() {
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        return match body {
            Value::Object(payload) => Ok(ToolResult::ok(id, payload)),
            other => Err(Error::InvalidResponse(format!(
                "tool {tool} returned a non-object body: {other}"
            ))),
        };
    }

    let body = response.text().await.unwrap_or_default();
    let (kind, detail) = error_body(status, &body);
    debug!(%tool, %status, %kind, "tool call failed");
    Ok(ToolResult::error(id, kind, detail))
}

/// Extract `{detail, kind}` from an error response, falling back to the status.
fn error_body(status: StatusCode, body: &str) -> (ErrorKind, String) {
    let parsed: Option<Value> = serde_json::from_str(body).ok();

    let detail = parsed
        .as_ref()
        .and_then(|v| v.get("detail"))
        .map(|d| match d {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| match body.trim() {
            "" => status.to_string(),
            text => text.to_string(),
        });

    let kind = parsed
        .as_ref()
        .and_then(|v| v.get("kind"))
        .and_then(Value::as_str)
        .and_then(ErrorKind::parse)
        .unwrap_or(match status {
            StatusCode::NOT_FOUND => ErrorKind::UnknownTool,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorKind::Validation,
            _ => ErrorKind::Execution,
        });

    (kind, detail)
}

/// Binary fields become file parts named after the field; the rest are text parts.
fn multipart_form(arguments: &Arguments, binary: &[String]) -> Result<Form> {
    let mut form = Form::new();
    for (name, value) in arguments {
        form = if binary.contains(name) {
            let bytes = value
                .as_str()
                .and_then(|encoded| STANDARD.decode(encoded).ok())
                .ok_or_else(|| ValidationError::new(name, Issue::InvalidEncoding))?;
            form.part(name.clone(), Part::bytes(bytes).file_name(name.clone()))
        } else {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form.text(name.clone(), text)
        };
    }
    Ok(form)
}

fn request_error(e: reqwest::Error, limit: Duration) -> Error {
    if e.is_timeout() {
        Error::Timeout(limit)
    } else {
        Error::Connection(e.to_string())
    }
}
