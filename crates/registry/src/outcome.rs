//! Execution outcomes.

use serde::{Deserialize, Serialize};

use crate::handler::Payload;

/// Category of a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The handler ran and failed.
    Execution,
    /// The arguments were rejected by the schema.
    Validation,
    /// No such tool.
    UnknownTool,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Validation => "validation",
            Self::UnknownTool => "unknown_tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execution" => Some(Self::Execution),
            "validation" => Some(Self::Validation),
            "unknown_tool" => Some(Self::UnknownTool),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of executing a tool: a payload or a structured error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome {
    Ok { payload: Payload },
    Error { kind: ErrorKind, message: String },
}

impl ToolOutcome {
    pub fn ok(payload: Payload) -> Self {
        Self::Ok { payload }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Ok { payload } => Some(payload),
            Self::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_by_status() {
        let mut payload = Payload::new();
        payload.insert("translated_text".into(), json!("hello"));

        let value = serde_json::to_value(ToolOutcome::ok(payload)).unwrap();
        assert_eq!(
            value,
            json!({"status": "ok", "payload": {"translated_text": "hello"}})
        );

        let value =
            serde_json::to_value(ToolOutcome::error(ErrorKind::UnknownTool, "nope")).unwrap();
        assert_eq!(
            value,
            json!({"status": "error", "kind": "unknown_tool", "message": "nope"})
        );
    }

    #[test]
    fn kind_parse_matches_serialized_names() {
        for kind in [ErrorKind::Execution, ErrorKind::Validation, ErrorKind::UnknownTool] {
            let serialized = serde_json::to_value(kind).unwrap();
            assert_eq!(serialized, kind.as_str());
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("other"), None);
    }
}
