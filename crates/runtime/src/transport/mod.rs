//! Transport abstraction.
//!
//! A transport carries discovery and invocation messages between a session
//! and a remote registry. Two bindings are provided:
//!
//! - [`HttpTransport`]: one request per call, no handshake.
//! - [`StdioTransport`]: a persistent JSON-RPC channel with an `initialize`
//!   handshake and concurrent in-flight calls matched by correlation id.

mod http;
mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use registry::ToolDescriptor;

use crate::Result;
use crate::call::{CorrelationId, ToolCall, ToolResult};

/// Default bound for a single tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound for discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a dispatched call. Resolves to the matching [`ToolResult`].
pub struct PendingCall {
    correlation_id: CorrelationId,
    result: BoxFuture<'static, Result<ToolResult>>,
}

impl PendingCall {
    pub fn new<F>(correlation_id: CorrelationId, result: F) -> Self
    where
        F: Future<Output = Result<ToolResult>> + Send + 'static,
    {
        Self {
            correlation_id,
            result: Box::pin(result),
        }
    }

    /// A handle that is already resolved.
    pub fn ready(correlation_id: CorrelationId, result: Result<ToolResult>) -> Self {
        Self::new(correlation_id, std::future::ready(result))
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Wait for the result.
    pub async fn resolve(self) -> Result<ToolResult> {
        self.result.await
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

/// Channel between a session and a remote tool registry.
///
/// Implementations are owned by exactly one session.
pub trait Transport: Send {
    /// Establish the channel. No internal retry.
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Fetch the published descriptors. Idempotent on the remote side.
    fn discover(&mut self) -> impl Future<Output = Result<Vec<ToolDescriptor>>> + Send;

    /// Dispatch a call without waiting for its result.
    fn send(&mut self, call: ToolCall) -> impl Future<Output = Result<PendingCall>> + Send;

    /// Release the channel. Pending calls fail with [`Error::Cancelled`](crate::Error::Cancelled).
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    /// False once the channel is closed or lost.
    fn is_connected(&self) -> bool;
}
