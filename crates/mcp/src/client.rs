//! MCP client connection (spawn, handshake, concurrent requests, lifecycle).
//!
//! A single background reader task owns the inbound half of the channel and
//! routes each response to the request that is waiting for it, keyed by
//! request id. Any number of requests may be in flight at once and their
//! responses may arrive in any order.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::framing::{FrameReader, write_frame};
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, MessageKind, RequestId, Tool, classify,
};

/// Default timeout for handshake and discovery requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for a tool host launched as a child process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

type Responder = oneshot::Sender<Result<JsonRpcResponse>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone)]
enum CloseReason {
    Shutdown,
    Lost(String),
}

impl CloseReason {
    fn to_error(&self) -> Error {
        match self {
            Self::Shutdown => Error::Cancelled,
            Self::Lost(reason) => Error::ConnectionLost(reason.clone()),
        }
    }
}

/// State shared between the client handle and its reader task.
#[derive(Default)]
struct Shared {
    pending: std::sync::Mutex<HashMap<RequestId, Responder>>,
    closed: std::sync::Mutex<Option<CloseReason>>,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn register(&self, id: RequestId) -> Result<oneshot::Receiver<Result<JsonRpcResponse>>> {
        let mut pending = lock(&self.pending);
        if let Some(reason) = lock(&self.closed).as_ref() {
            return Err(reason.to_error());
        }
        if pending.contains_key(&id) {
            return Err(Error::DuplicateRequestId(id));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok(rx)
    }

    fn forget(&self, id: &RequestId) {
        lock(&self.pending).remove(id);
    }

    fn closed(&self) -> Option<CloseReason> {
        lock(&self.closed).clone()
    }

    /// Mark the channel closed (first reason wins) and fail every waiter.
    fn close(&self, reason: CloseReason) {
        let reason = lock(&self.closed).get_or_insert(reason).clone();
        let waiters: Vec<Responder> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        if !waiters.is_empty() {
            debug!(count = waiters.len(), ?reason, "failing in-flight requests");
        }
        for tx in waiters {
            let _ = tx.send(Err(reason.to_error()));
        }
    }

    fn route(&self, frame: &str) {
        trace!(frame, "received");

        let value: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "discarding unparseable frame");
                return;
            }
        };

        match classify(&value) {
            MessageKind::Response => {
                let response: JsonRpcResponse = match serde_json::from_value(value) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "discarding malformed response");
                        return;
                    }
                };
                let sender = lock(&self.pending).remove(&response.id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => debug!(id = %response.id, "no pending request for response"),
                }
            }
            MessageKind::Request | MessageKind::Notification => {
                let method = value.get("method").and_then(Value::as_str).unwrap_or_default();
                debug!(method, "ignoring server-initiated message");
            }
            MessageKind::Invalid => warn!("discarding frame without id or method"),
        }
    }
}

async fn reader_loop<R>(reader: R, shared: Arc<Shared>, cancel: CancellationToken)
where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = FrameReader::new(reader);

    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break CloseReason::Shutdown,
            frame = reader.next_frame() => frame,
        };

        match frame {
            Ok(Some(line)) => shared.route(&line),
            Ok(None) => break CloseReason::Lost("tool host closed the channel".to_string()),
            // The line is gone; whatever call it answered runs into its timeout.
            Err(e @ (Error::FrameTooLarge { .. } | Error::InvalidFrame(_))) => {
                warn!(error = %e, "discarding unreadable frame");
            }
            Err(e) => {
                warn!(error = %e, "reader loop failed");
                break CloseReason::Lost(e.to_string());
            }
        }
    };

    debug!(?reason, "reader loop ended");
    shared.close(reason);
}

/// A request that has been written to the channel and awaits its response.
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Result<JsonRpcResponse>>,
    shared: Arc<Shared>,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait up to `limit` for the response.
    ///
    /// On timeout the request id is forgotten, so a late response is
    /// discarded by the reader task.
    pub async fn wait(self, limit: Duration) -> Result<JsonRpcResponse> {
        let Self { id, rx, shared } = self;
        match timeout(limit, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Err(shared.closed().map_or(Error::Cancelled, |r| r.to_error())),
            Err(_) => {
                shared.forget(&id);
                Err(Error::Timeout(limit))
            }
        }
    }
}

/// Handle to a connected MCP tool host.
pub struct Client {
    name: String,
    writer: Mutex<Writer>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    child: std::sync::Mutex<Option<Child>>,
    next_id: AtomicI64,
    initialized: AtomicBool,
    server_info: std::sync::Mutex<Option<InitializeResult>>,
}

impl Client {
    /// Spawn a tool host process and connect to its stdio.
    pub fn spawn(config: ServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut process = cmd.spawn().map_err(Error::Spawn)?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdin")))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;

        debug!(name = %config.name, command = %config.command, "spawned tool host");

        let client = Self::connect(config.name, stdout, stdin);
        *lock(&client.child) = Some(process);
        Ok(client)
    }

    /// Connect over an already-open pair of streams.
    pub fn connect<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();
        tokio::spawn(reader_loop(reader, Arc::clone(&shared), cancel.clone()));

        Self {
            name: name.into(),
            writer: Mutex::new(Box::new(writer)),
            shared,
            cancel,
            child: std::sync::Mutex::new(None),
            next_id: AtomicI64::new(1),
            initialized: AtomicBool::new(false),
            server_info: std::sync::Mutex::new(None),
        }
    }

    /// Get the tool host name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Perform the initialize handshake (must be called before other operations).
    pub async fn initialize(&self, limit: Duration) -> Result<InitializeResult> {
        let result: InitializeResult = self
            .request("initialize", Some(InitializeParams::default()), limit)
            .await?;

        self.notify("notifications/initialized", None::<()>).await?;

        debug!(
            name = %self.name,
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "handshake complete"
        );
        *lock(&self.server_info) = Some(result.clone());
        self.initialized.store(true, Ordering::SeqCst);
        Ok(result)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Server info (after initialization).
    pub fn server_info(&self) -> Option<InitializeResult> {
        lock(&self.server_info).clone()
    }

    /// True until the channel is shut down or lost.
    pub fn is_open(&self) -> bool {
        self.shared.closed().is_none()
    }

    /// Fetch the tool catalog.
    pub async fn list_tools(&self, limit: Duration) -> Result<Vec<Tool>> {
        self.ensure_initialized()?;
        let result: ListToolsResult = self.request("tools/list", None::<()>, limit).await?;
        Ok(result.tools)
    }

    /// Issue `tools/call` under a caller-chosen id without waiting for the result.
    pub async fn call_tool(
        &self,
        id: RequestId,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<PendingResponse> {
        self.ensure_initialized()?;
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        self.dispatch(JsonRpcRequest::new(id, "tools/call").with_params(params))
            .await
    }

    /// Send a request and wait for its typed result.
    pub async fn request<P, R>(&self, method: &str, params: Option<P>, limit: Duration) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let mut request = JsonRpcRequest::new(self.next_request_id(), method);
        if let Some(p) = params {
            request = request.with_params(p);
        }

        let response = self.dispatch(request).await?.wait(limit).await?;
        let result = response.into_result()?;
        Ok(serde_json::from_value(result)?)
    }

    /// Register `request` as pending and write it to the channel.
    pub async fn dispatch(&self, request: JsonRpcRequest) -> Result<PendingResponse> {
        let id = request.id.clone();
        let rx = self.shared.register(id.clone())?;

        if let Err(e) = self.send(&request).await {
            self.shared.forget(&id);
            return Err(e);
        }

        Ok(PendingResponse {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Send a notification (no response expected).
    pub async fn notify<P>(&self, method: &str, params: Option<P>) -> Result<()>
    where
        P: Serialize,
    {
        let mut notification = JsonRpcNotification::new(method);
        notification.params = params.map(serde_json::to_value).transpose()?;
        self.send(&notification).await
    }

    /// Close the channel. In-flight requests fail with [`Error::Cancelled`].
    pub async fn shutdown(&self) {
        self.shared.close(CloseReason::Shutdown);
        self.cancel.cancel();
        let _ = self.writer.lock().await.shutdown().await;
        self.kill();
    }

    /// Abandon the channel after a fault. In-flight requests fail with
    /// [`Error::ConnectionLost`].
    pub fn terminate(&self, reason: impl Into<String>) {
        self.shared.close(CloseReason::Lost(reason.into()));
        self.cancel.cancel();
        self.kill();
    }

    // --- Internal methods ---

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        if let Some(reason) = self.shared.closed() {
            return Err(reason.to_error());
        }

        let mut writer = self.writer.lock().await;
        match write_frame(&mut *writer, message).await {
            Err(Error::Io(e)) => {
                drop(writer);
                self.terminate(format!("write failed: {e}"));
                Err(Error::ConnectionLost(e.to_string()))
            }
            other => other,
        }
    }

    fn kill(&self) {
        if let Some(child) = lock(&self.child).as_mut() {
            let _ = child.start_kill();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    const LIMIT: Duration = Duration::from_secs(2);

    struct FakeHost {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeHost {
        async fn recv(&mut self) -> Value {
            let frame = self.reader.next_frame().await.unwrap().unwrap();
            serde_json::from_str(&frame).unwrap()
        }

        async fn send(&mut self, value: Value) {
            write_frame(&mut self.writer, &value).await.unwrap();
        }

        async fn reply(&mut self, id: &Value, result: Value) {
            self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
                .await;
        }

        async fn handshake(&mut self) {
            let init = self.recv().await;
            assert_eq!(init["method"], "initialize");
            self.reply(
                &init["id"],
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake"}
                }),
            )
            .await;
            let note = self.recv().await;
            assert_eq!(note["method"], "notifications/initialized");
        }
    }

    fn pair() -> (Client, FakeHost) {
        let (client_io, host_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (host_read, host_write) = tokio::io::split(host_io);
        let client = Client::connect("fake", client_read, client_write);
        let host = FakeHost {
            reader: FrameReader::new(host_read),
            writer: host_write,
        };
        (client, host)
    }

    async fn ready_pair() -> (Client, FakeHost) {
        let (client, mut host) = pair();
        let (result, ()) = tokio::join!(client.initialize(LIMIT), host.handshake());
        assert_eq!(result.unwrap().server_info.name, "fake");
        (client, host)
    }

    #[test]
    fn server_config_creation() {
        let config = ServerConfig {
            name: "test".to_string(),
            command: "toolhost".to_string(),
            args: vec!["serve-stdio".to_string()],
            env: HashMap::new(),
        };
        assert_eq!(config.name, "test");
    }

    #[tokio::test]
    async fn calls_before_handshake_are_refused() {
        let (client, _host) = pair();
        let err = client.list_tools(LIMIT).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
        let err = client
            .call_tool("a".into(), "echo", Map::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn lists_tools_after_handshake() {
        let (client, mut host) = ready_pair().await;
        let host_task = async {
            let req = host.recv().await;
            assert_eq!(req["method"], "tools/list");
            host.reply(
                &req["id"],
                json!({"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]}),
            )
            .await;
        };
        let (tools, ()) = tokio::join!(client.list_tools(LIMIT), host_task);
        let tools = tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn responses_route_by_id_in_any_order() {
        let (client, mut host) = ready_pair().await;

        let first = client.call_tool("first".into(), "echo", Map::new()).await.unwrap();
        let second = client.call_tool("second".into(), "echo", Map::new()).await.unwrap();

        let a = host.recv().await;
        let b = host.recv().await;
        assert_eq!(a["id"], "first");
        assert_eq!(b["id"], "second");

        host.reply(&b["id"], json!({"n": 2})).await;
        host.reply(&a["id"], json!({"n": 1})).await;

        let first = first.wait(LIMIT).await.unwrap();
        let second = second.wait(LIMIT).await.unwrap();
        assert_eq!(first.id, RequestId::from("first"));
        assert_eq!(first.result.unwrap()["n"], 1);
        assert_eq!(second.result.unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let (client, _host) = ready_pair().await;
        let _pending = client.call_tool("x".into(), "echo", Map::new()).await.unwrap();
        let err = client
            .call_tool("x".into(), "echo", Map::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::DuplicateRequestId(_)));
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_discarded() {
        let (client, mut host) = ready_pair().await;

        let pending = client.call_tool("slow".into(), "echo", Map::new()).await.unwrap();
        let err = pending.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let req = host.recv().await;
        host.reply(&req["id"], json!({"late": true})).await;

        let pending = client.call_tool("fresh".into(), "echo", Map::new()).await.unwrap();
        let req = host.recv().await;
        host.reply(&req["id"], json!({"late": false})).await;
        let response = pending.wait(LIMIT).await.unwrap();
        assert_eq!(response.result.unwrap()["late"], false);
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn error_frames_surface_as_json_rpc_errors() {
        let (client, mut host) = ready_pair().await;
        let pending = client.call_tool("e".into(), "nope", Map::new()).await.unwrap();
        let req = host.recv().await;
        host.send(json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "error": {"code": -32602, "message": "unknown tool", "data": {"kind": "unknown_tool"}}
        }))
        .await;

        let err = pending.wait(LIMIT).await.unwrap().into_result().unwrap_err();
        assert_eq!(err.kind(), Some("unknown_tool"));
    }

    #[tokio::test]
    async fn channel_loss_fails_in_flight_requests() {
        let (client, mut host) = ready_pair().await;
        let pending = client.call_tool("gone".into(), "echo", Map::new()).await.unwrap();
        let _ = host.recv().await;
        drop(host);

        let err = pending.wait(LIMIT).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
        assert!(!client.is_open());

        let err = client
            .call_tool("again".into(), "echo", Map::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_requests() {
        let (client, _host) = ready_pair().await;
        let pending = client.call_tool("c".into(), "echo", Map::new()).await.unwrap();

        client.shutdown().await;

        let err = pending.wait(LIMIT).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!client.is_open());
    }
}
