//! Correlated call and result types.

use std::fmt;

use registry::{Arguments, ErrorKind, Payload, ToolOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque token pairing a call with its result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A tool invocation, consumed once by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: Arguments,
    pub correlation_id: CorrelationId,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            correlation_id: CorrelationId::new(),
        }
    }
}

/// The outcome of a call, tagged with the call's correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub correlation_id: CorrelationId,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn ok(correlation_id: CorrelationId, payload: Payload) -> Self {
        Self {
            correlation_id,
            outcome: ToolOutcome::ok(payload),
        }
    }

    pub fn error(correlation_id: CorrelationId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            outcome: ToolOutcome::error(kind, message),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.outcome.payload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn correlation_ids_are_unique() {
        let a = ToolCall::new("translate", Arguments::new());
        let b = ToolCall::new("translate", Arguments::new());
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn result_serializes_flat() {
        let mut payload = Payload::new();
        payload.insert("transcribed_text".into(), json!("hi"));
        let result = ToolResult::ok("abc".into(), payload);

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({"correlationId": "abc", "status": "ok", "payload": {"transcribed_text": "hi"}})
        );

        let back: ToolResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }
}
