//! Tool registry.
//!
//! Holds descriptors and their handlers in registration order and routes
//! `execute` calls to the bound handler after validating arguments.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::descriptor::ToolDescriptor;
use crate::error::{Error, Result};
use crate::handler::{Arguments, ToolHandler};
use crate::outcome::{ErrorKind, ToolOutcome};

struct Entry {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
    /// Present for non-reentrant handlers.
    gate: Option<Arc<Mutex<()>>>,
}

/// Registered tools, in registration order.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tools", &self.descriptors().map(|d| &d.name).collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails if the name is taken.
    pub fn register<H>(&mut self, descriptor: ToolDescriptor, handler: H) -> Result<()>
    where
        H: ToolHandler + 'static,
    {
        self.register_arc(descriptor, Arc::new(handler))
    }

    /// Register a tool (Arc version).
    pub fn register_arc(
        &mut self,
        descriptor: ToolDescriptor,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<()> {
        if self.index.contains_key(&descriptor.name) {
            return Err(Error::DuplicateName(descriptor.name));
        }

        let gate = (!handler.reentrant()).then(|| Arc::new(Mutex::new(())));
        debug!(
            tool = %descriptor.name,
            reentrant = gate.is_none(),
            "registered tool"
        );

        self.index
            .insert(descriptor.name.clone(), self.entries.len());
        self.entries.push(Entry {
            descriptor,
            handler,
            gate,
        });
        Ok(())
    }

    /// Descriptors in registration order.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.descriptors().cloned().collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.entry(name).map(|e| &e.descriptor)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate `arguments` and run the tool's handler.
    ///
    /// Unknown names and schema mismatches are errors. Handler faults,
    /// including panics, come back as [`ToolOutcome::Error`].
    pub async fn execute(&self, name: &str, arguments: Arguments) -> Result<ToolOutcome> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::UnknownTool(name.to_string()))?;

        entry.descriptor.parameter_schema.validate(&arguments)?;

        let permit = match &entry.gate {
            Some(gate) => Some(Arc::clone(gate).lock_owned().await),
            None => None,
        };

        let handler = Arc::clone(&entry.handler);
        let task = tokio::spawn(async move {
            let _permit = permit;
            handler.call(arguments).await
        });

        let outcome = match task.await {
            Ok(Ok(payload)) => ToolOutcome::ok(payload),
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "tool handler failed");
                ToolOutcome::error(ErrorKind::Execution, e.to_string())
            }
            Err(e) if e.is_panic() => {
                warn!(tool = %name, "tool handler panicked");
                ToolOutcome::error(ErrorKind::Execution, "tool handler panicked")
            }
            Err(_) => ToolOutcome::error(ErrorKind::Execution, "tool handler was cancelled"),
        };

        Ok(outcome)
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, Payload, handler_fn};
    use crate::schema::{Issue, ParameterSchema, PropertySchema};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn args(value: serde_json::Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    fn translate_descriptor() -> ToolDescriptor {
        ToolDescriptor::new("translate", "Translate text to English").with_schema(
            ParameterSchema::object().required_property("text", PropertySchema::string()),
        )
    }

    fn counting_translate(calls: Arc<AtomicUsize>) -> impl ToolHandler {
        handler_fn(move |arguments: Arguments| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let text = arguments["text"].as_str().unwrap_or_default();
                let mut payload = Payload::new();
                payload.insert("translated_text".into(), json!(format!("EN: {text}")));
                Ok(payload)
            }
        })
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(translate_descriptor(), counting_translate(Arc::clone(&calls)))
            .unwrap();
        let err = registry
            .register(translate_descriptor(), counting_translate(calls))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(name) if name == "translate"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_preserves_registration_order() {
        let mut registry = Registry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry
                .register(
                    ToolDescriptor::new(name, ""),
                    handler_fn(|_| async { Ok(Payload::new()) }),
                )
                .unwrap();
        }

        let names: Vec<_> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
        assert_eq!(registry.list(), registry.list());
        assert_eq!(
            format!("{registry:?}"),
            r#"Registry { tools: ["zeta", "alpha", "mid"] }"#
        );
    }

    #[tokio::test]
    async fn executes_valid_calls() {
        let mut registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(translate_descriptor(), counting_translate(Arc::clone(&calls)))
            .unwrap();

        let outcome = registry
            .execute("translate", args(json!({"text": "hello"})))
            .await
            .unwrap();
        assert_eq!(
            outcome.payload().unwrap()["translated_text"],
            json!("EN: hello")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_handler() {
        let mut registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(translate_descriptor(), counting_translate(Arc::clone(&calls)))
            .unwrap();

        let err = registry.execute("translate", Arguments::new()).await.unwrap_err();
        match err {
            Error::Validation(e) => {
                assert_eq!(e.field, "text");
                assert_eq!(e.issue, Issue::Missing);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = Registry::new();
        let err = registry
            .execute("delete_everything", Arguments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTool(name) if name == "delete_everything"));
    }

    #[tokio::test]
    async fn handler_faults_become_error_outcomes() {
        let mut registry = Registry::new();
        registry
            .register(
                ToolDescriptor::new("broken", ""),
                handler_fn(|_| async { Err(HandlerError::new("model not loaded")) }),
            )
            .unwrap();
        registry
            .register(
                ToolDescriptor::new("panics", ""),
                handler_fn(|arguments: Arguments| async move {
                    if arguments.is_empty() {
                        panic!("boom");
                    }
                    Ok(Payload::new())
                }),
            )
            .unwrap();

        let outcome = registry.execute("broken", Arguments::new()).await.unwrap();
        assert_eq!(
            outcome,
            ToolOutcome::error(ErrorKind::Execution, "model not loaded")
        );

        let outcome = registry.execute("panics", Arguments::new()).await.unwrap();
        assert_eq!(
            outcome,
            ToolOutcome::error(ErrorKind::Execution, "tool handler panicked")
        );
    }

    #[tokio::test]
    async fn non_reentrant_handlers_are_serialized() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handler = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handler_fn(move |_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(Payload::new())
                }
            })
            .non_reentrant()
        };

        let mut registry = Registry::new();
        registry
            .register(ToolDescriptor::new("stt", ""), handler)
            .unwrap();
        let registry = Arc::new(registry);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.execute("stt", Arguments::new()).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap().is_ok());
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
