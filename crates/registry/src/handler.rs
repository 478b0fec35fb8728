//! Tool handler trait.

use std::future::Future;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Arguments of a tool call, keyed by field name.
pub type Arguments = Map<String, Value>;

/// Structured result fields of a successful call.
pub type Payload = Map<String, Value>;

/// A handler-specific fault. Carries a message only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Executable binding of a registered tool.
///
/// This is the boundary between the registry and side effects.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with already-validated arguments.
    async fn call(&self, arguments: Arguments) -> Result<Payload, HandlerError>;

    /// Whether concurrent calls are safe. Non-reentrant handlers are
    /// serialized by the registry.
    fn reentrant(&self) -> bool {
        true
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
    reentrant: bool,
}

impl<F> FnHandler<F> {
    /// Mark the handler as unsafe to run concurrently.
    pub fn non_reentrant(mut self) -> Self {
        self.reentrant = false;
        self
    }
}

/// Wrap an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send,
{
    FnHandler { f, reentrant: true }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send,
{
    async fn call(&self, arguments: Arguments) -> Result<Payload, HandlerError> {
        (self.f)(arguments).await
    }

    fn reentrant(&self) -> bool {
        self.reentrant
    }
}
