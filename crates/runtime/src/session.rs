//! Invocation session.
//!
//! A session owns one transport and one decision provider and drives
//! `connect → discover → (decide → dispatch → merge)* → close`.
//!
//! Unknown tool names and invalid arguments are rejected before the
//! transport is touched.

use std::collections::HashMap;
use std::fmt;

use registry::{Arguments, ErrorKind, ToolDescriptor, ToolOutcome};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::call::{CorrelationId, ToolCall, ToolResult};
use crate::decision::{Decision, DecisionProvider};
use crate::transport::Transport;
use crate::{Error, Result};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Discovering,
    Idle,
    AwaitingResult,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Discovering => "discovering",
            Self::Idle => "idle",
            Self::AwaitingResult => "awaiting_result",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Adjusts arguments before validation, e.g. to attach binary payloads.
pub trait ArgumentHook: Send + Sync {
    fn prepare(&self, tool: &ToolDescriptor, arguments: &mut Arguments) -> Result<()>;
}

/// A dispatched call and its successful result.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub call: ToolCall,
    pub result: ToolResult,
}

impl Exchange {
    pub fn payload(&self) -> Option<&registry::Payload> {
        self.result.payload()
    }
}

/// The answer to one user request.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub text: String,
    /// Present when a tool was invoked.
    pub exchange: Option<Exchange>,
}

/// A tool invocation session.
pub struct Session<T, D> {
    transport: T,
    provider: D,
    state: SessionState,
    tools: Vec<ToolDescriptor>,
    pending: HashMap<CorrelationId, ToolCall>,
    hook: Option<Box<dyn ArgumentHook>>,
}

impl<T: Transport, D: DecisionProvider> Session<T, D> {
    pub fn new(transport: T, provider: D) -> Self {
        Self {
            transport,
            provider,
            state: SessionState::Disconnected,
            tools: Vec::new(),
            pending: HashMap::new(),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: impl ArgumentHook + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Tools discovered on the current connection.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn provider(&self) -> &D {
        &self.provider
    }

    /// Connect and discover. On failure the session returns to
    /// `Disconnected` and `connect` may be called again.
    pub async fn connect(&mut self) -> Result<&[ToolDescriptor]> {
        match self.state {
            SessionState::Disconnected => {}
            SessionState::Closed => return Err(Error::SessionClosed),
            state => {
                return Err(Error::ProtocolState(format!(
                    "cannot connect while {state}"
                )));
            }
        }

        self.state = SessionState::Connecting;
        if let Err(e) = self.transport.connect().await {
            warn!(error = %e, "connect failed");
            self.state = SessionState::Disconnected;
            return Err(e);
        }

        self.state = SessionState::Discovering;
        match self.transport.discover().await {
            Ok(tools) => {
                info!(count = tools.len(), "session ready");
                self.tools = tools;
                self.state = SessionState::Idle;
                Ok(&self.tools)
            }
            Err(e) => {
                warn!(error = %e, "discovery failed");
                self.transport.close().await;
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Handle one user request: decide, dispatch if a tool was selected,
    /// then merge the result into final text.
    pub async fn handle(&mut self, input: &str) -> Result<Turn> {
        self.ready()?;

        let decision = self.provider.decide(input, &self.tools).await?;
        let (name, arguments) = match decision {
            Decision::NoToolSelected(text) => {
                return Ok(Turn {
                    text,
                    exchange: None,
                });
            }
            Decision::ToolSelected { name, arguments } => (name, arguments),
        };

        info!(tool = %name, "tool selected");
        let exchange = self.invoke(&name, arguments).await?;

        let call = self.merge_view(&exchange.call);
        let text = self
            .provider
            .synthesize(input, &call, &exchange.result)
            .await?;

        Ok(Turn {
            text,
            exchange: Some(exchange),
        })
    }

    /// Invoke a tool by name, bypassing the decision step.
    pub async fn invoke(&mut self, name: &str, mut arguments: Arguments) -> Result<Exchange> {
        self.ready()?;

        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;

        if let Some(hook) = &self.hook {
            hook.prepare(tool, &mut arguments)?;
        }
        tool.parameter_schema.validate(&arguments)?;

        let call = ToolCall::new(name, arguments);
        let id = call.correlation_id.clone();
        self.pending.insert(id.clone(), call.clone());
        self.state = SessionState::AwaitingResult;

        debug!(tool = %name, correlation_id = %id, "dispatching");
        let resolved = match self.transport.send(call).await {
            Ok(pending) => pending.resolve().await,
            Err(e) => Err(e),
        };

        let call = self.pending.remove(&id);
        self.settle().await;

        let result = resolved?;
        let call = call.ok_or_else(|| Error::ProtocolState(format!("no pending call {id}")))?;
        if result.correlation_id != id {
            return Err(Error::InvalidResponse(format!(
                "result {} does not match call {id}",
                result.correlation_id
            )));
        }

        match result.outcome {
            ToolOutcome::Ok { .. } => Ok(Exchange { call, result }),
            ToolOutcome::Error { kind, message } => {
                debug!(tool = %name, %kind, "tool returned an error");
                let tool = name.to_string();
                Err(match kind {
                    ErrorKind::Execution => Error::Execution { tool, message },
                    ErrorKind::UnknownTool => Error::UnknownTool(tool),
                    ErrorKind::Validation => Error::Rejected { tool, message },
                })
            }
        }
    }

    /// Close the session. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.fail_pending();
        self.transport.close().await;
        self.state = SessionState::Closed;
        info!("session closed");
    }

    fn ready(&mut self) -> Result<()> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::Closed => Err(Error::SessionClosed),
            // A previous invoke was dropped mid-flight.
            SessionState::AwaitingResult => {
                self.fail_pending();
                if self.transport.is_connected() {
                    self.state = SessionState::Idle;
                    Ok(())
                } else {
                    self.state = SessionState::Closed;
                    Err(Error::SessionClosed)
                }
            }
            state => Err(Error::ProtocolState(format!(
                "session is {state}, connect first"
            ))),
        }
    }

    /// Return to idle, or close if the channel did not survive the call.
    async fn settle(&mut self) {
        if self.transport.is_connected() {
            self.state = SessionState::Idle;
        } else {
            warn!("channel lost, closing session");
            self.fail_pending();
            self.transport.close().await;
            self.state = SessionState::Closed;
        }
    }

    fn fail_pending(&mut self) {
        for (id, call) in self.pending.drain() {
            debug!(tool = %call.tool_name, correlation_id = %id, "abandoning pending call");
        }
    }

    /// The call as shown to the provider when merging: binary arguments are elided.
    fn merge_view(&self, call: &ToolCall) -> ToolCall {
        let mut call = call.clone();
        if let Some(tool) = self.tool(&call.tool_name) {
            for field in tool.parameter_schema.binary_fields() {
                if let Some(value) = call.arguments.get_mut(field) {
                    let len = value.as_str().map_or(0, str::len);
                    *value = Value::String(format!("<{len} base64 characters>"));
                }
            }
        }
        call
    }
}

impl<T: fmt::Display, D> fmt::Display for Session<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session({}, {})", self.transport, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PendingCall;
    use registry::{ParameterSchema, Payload, PropertySchema};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Respond = fn(&ToolCall) -> Result<ToolResult>;

    struct FakeTransport {
        tools: Vec<ToolDescriptor>,
        connect_failures: usize,
        fail_discovery: bool,
        connected: bool,
        respond: Respond,
        sent: Vec<ToolCall>,
        closes: usize,
    }

    impl FakeTransport {
        fn new(respond: Respond) -> Self {
            Self {
                tools: vec![translate(), stt()],
                connect_failures: 0,
                fail_discovery: false,
                connected: false,
                respond,
                sent: Vec::new(),
                closes: 0,
            }
        }
    }

    impl Transport for FakeTransport {
        async fn connect(&mut self) -> Result<()> {
            if self.connect_failures > 0 {
                self.connect_failures -= 1;
                return Err(Error::Connection("refused".into()));
            }
            self.connected = true;
            Ok(())
        }

        async fn discover(&mut self) -> Result<Vec<ToolDescriptor>> {
            if self.fail_discovery {
                return Err(Error::InvalidResponse("garbage".into()));
            }
            Ok(self.tools.clone())
        }

        async fn send(&mut self, call: ToolCall) -> Result<PendingCall> {
            let result = (self.respond)(&call);
            if matches!(result, Err(Error::ConnectionLost(_) | Error::Timeout(_))) {
                self.connected = false;
            }
            let id = call.correlation_id.clone();
            self.sent.push(call);
            Ok(PendingCall::ready(id, result))
        }

        async fn close(&mut self) {
            self.connected = false;
            self.closes += 1;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        /// `None` stands for a malformed reply.
        decision: Option<Decision>,
        merged: Mutex<Vec<ToolCall>>,
        syntheses: AtomicUsize,
    }

    impl FakeProvider {
        fn deciding(decision: Decision) -> Self {
            Self {
                decision: Some(decision),
                ..Self::default()
            }
        }
    }

    impl DecisionProvider for FakeProvider {
        async fn decide(&self, _input: &str, _tools: &[ToolDescriptor]) -> Result<Decision> {
            self.decision
                .clone()
                .ok_or_else(|| Error::Decision("unparseable reply".into()))
        }

        async fn synthesize(&self, _input: &str, call: &ToolCall, result: &ToolResult) -> Result<String> {
            self.syntheses.fetch_add(1, Ordering::SeqCst);
            self.merged.lock().unwrap().push(call.clone());
            let payload = result.payload().cloned().unwrap_or_default();
            Ok(payload
                .values()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "))
        }
    }

    fn translate() -> ToolDescriptor {
        ToolDescriptor::new("translate", "Translates the given text to Thai language.").with_schema(
            ParameterSchema::object().required_property("text", PropertySchema::string()),
        )
    }

    fn stt() -> ToolDescriptor {
        ToolDescriptor::new("stt", "Transcribe audio").with_schema(
            ParameterSchema::object().required_property("audio", PropertySchema::binary()),
        )
    }

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn translated(call: &ToolCall) -> Result<ToolResult> {
        let text = call.arguments.get("text").and_then(Value::as_str).unwrap_or("");
        Ok(ToolResult::ok(
            call.correlation_id.clone(),
            payload(json!({"translated_text": format!("th:{text}")})),
        ))
    }

    fn transcribed(call: &ToolCall) -> Result<ToolResult> {
        Ok(ToolResult::ok(
            call.correlation_id.clone(),
            payload(json!({"transcribed_text": "hello world"})),
        ))
    }

    fn failing(call: &ToolCall) -> Result<ToolResult> {
        Ok(ToolResult::error(
            call.correlation_id.clone(),
            ErrorKind::Execution,
            "model not loaded",
        ))
    }

    fn lost(_call: &ToolCall) -> Result<ToolResult> {
        Err(Error::ConnectionLost("peer went away".into()))
    }

    fn mismatched(_call: &ToolCall) -> Result<ToolResult> {
        Ok(ToolResult::ok(CorrelationId::from("someone-else"), Payload::new()))
    }

    fn select(name: &str, arguments: Value) -> Decision {
        Decision::ToolSelected {
            name: name.into(),
            arguments: args(arguments),
        }
    }

    async fn connected(respond: Respond, provider: FakeProvider) -> Session<FakeTransport, FakeProvider> {
        let mut session = Session::new(FakeTransport::new(respond), provider);
        session.connect().await.unwrap();
        session
    }

    #[tokio::test]
    async fn connect_discovers_and_goes_idle() {
        let mut session = Session::new(FakeTransport::new(translated), FakeProvider::default());
        assert_eq!(session.state(), SessionState::Disconnected);

        let names: Vec<_> = session
            .connect()
            .await
            .unwrap()
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(names, ["translate", "stt"]);
        assert_eq!(session.state(), SessionState::Idle);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolState(_)));
    }

    #[tokio::test]
    async fn failed_connect_can_be_retried() {
        let mut transport = FakeTransport::new(translated);
        transport.connect_failures = 1;
        let mut session = Session::new(transport, FakeProvider::default());

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_discovery_releases_the_transport() {
        let mut transport = FakeTransport::new(translated);
        transport.fail_discovery = true;
        let mut session = Session::new(transport, FakeProvider::default());

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.transport().closes, 1);
        assert!(session.tools().is_empty());
    }

    #[tokio::test]
    async fn requests_before_connect_are_refused() {
        let mut session = Session::new(FakeTransport::new(translated), FakeProvider::default());
        let err = session.handle("hello").await.unwrap_err();
        assert!(matches!(err, Error::ProtocolState(_)));
    }

    #[tokio::test]
    async fn direct_answer_never_touches_the_transport() {
        let provider = FakeProvider::deciding(Decision::NoToolSelected("hi".into()));
        let mut session = connected(translated, provider).await;

        let turn = session.handle("hey").await.unwrap();
        assert_eq!(turn.text, "hi");
        assert!(turn.exchange.is_none());
        assert!(session.transport().sent.is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn unknown_tool_fails_locally() {
        let provider = FakeProvider::deciding(select("delete_everything", json!({})));
        let mut session = connected(translated, provider).await;

        let err = session.handle("wipe it").await.unwrap_err();
        assert!(matches!(err, Error::UnknownTool(ref name) if name == "delete_everything"));
        assert!(session.transport().sent.is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn invalid_arguments_are_never_sent() {
        let provider = FakeProvider::deciding(select("translate", json!({})));
        let mut session = connected(translated, provider).await;

        let err = session.handle("translate").await.unwrap_err();
        assert!(matches!(err, Error::Validation(ref e) if e.field == "text"));
        assert!(session.transport().sent.is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn selected_tool_is_dispatched_and_merged() {
        let provider = FakeProvider::deciding(select("translate", json!({"text": "hello"})));
        let mut session = connected(translated, provider).await;

        let turn = session.handle("translate hello").await.unwrap();
        assert_eq!(turn.text, "th:hello");

        let exchange = turn.exchange.unwrap();
        assert_eq!(exchange.call.correlation_id, exchange.result.correlation_id);
        assert_eq!(exchange.payload().unwrap()["translated_text"], "th:hello");

        assert_eq!(session.transport().sent.len(), 1);
        assert_eq!(session.pending_calls(), 0);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.provider().syntheses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn each_call_gets_a_fresh_correlation_id() {
        let mut session = connected(translated, FakeProvider::default()).await;
        let first = session.invoke("translate", args(json!({"text": "a"}))).await.unwrap();
        let second = session.invoke("translate", args(json!({"text": "b"}))).await.unwrap();
        assert_ne!(first.call.correlation_id, second.call.correlation_id);
    }

    #[tokio::test]
    async fn tool_errors_skip_the_merge_step() {
        let provider = FakeProvider::deciding(select("translate", json!({"text": "hello"})));
        let mut session = connected(failing, provider).await;

        let err = session.handle("translate hello").await.unwrap_err();
        assert!(
            matches!(err, Error::Execution { ref tool, ref message } if tool == "translate" && message == "model not loaded")
        );
        assert!(!err.is_fatal());
        assert_eq!(session.provider().syntheses.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn malformed_decisions_surface_as_errors() {
        let mut session = connected(translated, FakeProvider::default()).await;
        let err = session.handle("hello").await.unwrap_err();
        assert!(matches!(err, Error::Decision(_)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn mismatched_result_is_rejected() {
        let mut session = connected(mismatched, FakeProvider::default()).await;
        let err = session
            .invoke("translate", args(json!({"text": "hi"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
        assert_eq!(session.pending_calls(), 0);
    }

    #[tokio::test]
    async fn channel_loss_closes_the_session() {
        let provider = FakeProvider::deciding(select("translate", json!({"text": "hello"})));
        let mut session = connected(lost, provider).await;

        let err = session.handle("translate hello").await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.pending_calls(), 0);

        let err = session.handle("again").await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let mut session = connected(translated, FakeProvider::default()).await;
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.transport().closes, 1);

        assert!(matches!(session.handle("hi").await, Err(Error::SessionClosed)));
        assert!(matches!(
            session.invoke("translate", Arguments::new()).await,
            Err(Error::SessionClosed)
        ));
        assert!(matches!(session.connect().await, Err(Error::SessionClosed)));
    }

    struct Attach;

    impl ArgumentHook for Attach {
        fn prepare(&self, tool: &ToolDescriptor, arguments: &mut Arguments) -> Result<()> {
            for field in tool.parameter_schema.binary_fields() {
                arguments.insert(field.to_string(), json!("UklGRg=="));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn hook_fills_arguments_before_validation() {
        let provider = FakeProvider::deciding(select("stt", json!({})));
        let mut session = Session::new(FakeTransport::new(transcribed), provider).with_hook(Attach);
        session.connect().await.unwrap();

        let turn = session.handle("what did I say?").await.unwrap();
        assert_eq!(turn.text, "hello world");
        assert_eq!(session.transport().sent[0].arguments["audio"], "UklGRg==");

        let merged = session.provider().merged.lock().unwrap();
        assert_eq!(merged[0].arguments["audio"], "<8 base64 characters>");
    }
}
