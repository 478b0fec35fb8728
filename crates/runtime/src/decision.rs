//! Decision provider contract.
//!
//! A decision provider (backed by a language model) either selects one tool
//! with arguments or answers directly, and later turns a tool result into
//! final text. Whatever shape the model replies in is normalized here into a
//! [`Decision`].

use std::future::Future;

use registry::{Arguments, ToolDescriptor};
use serde::Serialize;
use serde_json::Value;

use crate::call::{ToolCall, ToolResult};
use crate::{Error, Result};

/// Outcome of the decision step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Answer directly.
    NoToolSelected(String),
    /// Invoke one tool.
    ToolSelected { name: String, arguments: Arguments },
}

/// Trait for decision providers.
pub trait DecisionProvider: Send + Sync {
    /// Pick a tool for `input`, or answer directly.
    fn decide(
        &self,
        input: &str,
        tools: &[ToolDescriptor],
    ) -> impl Future<Output = Result<Decision>> + Send;

    /// Produce final text from an executed call. Must always yield text.
    fn synthesize(
        &self,
        input: &str,
        call: &ToolCall,
        result: &ToolResult,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// A tool in the shape function-calling models expect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolDescriptor> for FunctionDeclaration {
    fn from(tool: &ToolDescriptor) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: serde_json::to_value(&tool.parameter_schema).unwrap_or(Value::Null),
        }
    }
}

pub fn function_declarations(tools: &[ToolDescriptor]) -> Vec<FunctionDeclaration> {
    tools.iter().map(FunctionDeclaration::from).collect()
}

/// Normalize a native function-call object.
pub fn parse_function_call(name: Option<&str>, args: Option<Value>) -> Result<Decision> {
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::Decision("function call without a name".into()))?;

    Ok(Decision::ToolSelected {
        name: name.to_string(),
        arguments: arguments_from(args)?,
    })
}

/// Normalize a text reply.
///
/// A JSON object (bare, fenced, or embedded in prose) with a string `name`
/// selects that tool. `{"name": null, "text": ...}`, any non-JSON text, and
/// any JSON value that is not an object (`42`, `true`, `[1, 2]`) are direct
/// answers. An object with a malformed `name` or `arguments` is an
/// [`Error::Decision`].
pub fn parse_decision_text(text: &str) -> Result<Decision> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::Decision("empty reply".into()));
    }

    let Some(value) = extract_json(text) else {
        return Ok(Decision::NoToolSelected(text.to_string()));
    };

    let mut object = match value {
        Value::Object(object) => object,
        Value::String(answer) => return Ok(Decision::NoToolSelected(answer)),
        _ => return Ok(Decision::NoToolSelected(text.to_string())),
    };

    match object.remove("name") {
        Some(Value::String(name)) => parse_function_call(Some(&name), object.remove("arguments")),
        Some(Value::Null) | None => {
            let answer = ["text", "answer", "response"]
                .iter()
                .find_map(|key| object.get(*key).and_then(Value::as_str))
                .ok_or_else(|| Error::Decision("no tool selected and no answer given".into()))?;
            Ok(Decision::NoToolSelected(answer.to_string()))
        }
        Some(other) => Err(Error::Decision(format!("tool name is not a string: {other}"))),
    }
}

fn arguments_from(args: Option<Value>) -> Result<Arguments> {
    match args {
        None | Some(Value::Null) => Ok(Arguments::new()),
        Some(Value::Object(arguments)) => Ok(arguments),
        Some(other) => Err(Error::Decision(format!(
            "arguments must be an object, got: {other}"
        ))),
    }
}

/// Find a JSON document in a model reply.
fn extract_json(text: &str) -> Option<Value> {
    let unfenced = strip_fence(text);
    if let Ok(value) = serde_json::from_str(unfenced) {
        return Some(value);
    }

    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&unfenced[start..=end]).ok()
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Provider for sessions that only invoke tools directly.
///
/// Answers every request without selecting a tool, and synthesizes by
/// rendering the payload as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectOnly;

impl DecisionProvider for DirectOnly {
    async fn decide(&self, _input: &str, _tools: &[ToolDescriptor]) -> Result<Decision> {
        Ok(Decision::NoToolSelected(
            "no decision provider is configured; invoke a tool by name".into(),
        ))
    }

    async fn synthesize(&self, _input: &str, _call: &ToolCall, result: &ToolResult) -> Result<String> {
        let payload = result.payload().cloned().unwrap_or_default();
        serde_json::to_string_pretty(&payload).map_err(|e| Error::Decision(e.to_string()))
    }
}
