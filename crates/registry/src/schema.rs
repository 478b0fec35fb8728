//! Structural parameter schemas.
//!
//! A JSON-Schema-like subset: an object with named, typed properties, a
//! required list, optional `enum` constraints, and `contentEncoding` for
//! base64-carried binary fields. Keywords outside this subset are kept
//! verbatim so a schema survives a round trip through discovery.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Encoding marker for binary fields carried as base64 strings.
pub const BASE64: &str = "base64";

/// Primitive JSON types a property may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl ValueType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Null => value.is_null(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `type` keyword: one type or a union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSet {
    One(ValueType),
    Many(Vec<ValueType>),
}

impl TypeSet {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::One(t) => t.matches(value),
            Self::Many(ts) => ts.iter().any(|t| t.matches(value)),
        }
    }
}

impl fmt::Display for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(t) => write!(f, "{t}"),
            Self::Many(ts) => {
                let names: Vec<_> = ts.iter().map(|t| t.as_str()).collect();
                write!(f, "{}", names.join(" | "))
            }
        }
    }
}

/// Schema for one named property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TypeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PropertySchema {
    pub fn new(kind: ValueType) -> Self {
        Self {
            kind: Some(TypeSet::One(kind)),
            ..Self::default()
        }
    }

    pub fn string() -> Self {
        Self::new(ValueType::String)
    }

    /// A string property carrying base64-encoded bytes.
    pub fn binary() -> Self {
        Self {
            content_encoding: Some(BASE64.to_string()),
            ..Self::string()
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn one_of(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.allowed = Some(values.into_iter().collect());
        self
    }

    pub fn is_binary(&self) -> bool {
        self.content_encoding.as_deref() == Some(BASE64)
    }

    fn check(&self, field: &str, value: &Value) -> Result<(), ValidationError> {
        if let Some(kind) = &self.kind
            && !kind.matches(value)
        {
            return Err(ValidationError::new(
                field,
                Issue::WrongType {
                    expected: kind.to_string(),
                    found: json_type_name(value),
                },
            ));
        }

        if let Some(allowed) = &self.allowed
            && !allowed.contains(value)
        {
            return Err(ValidationError::new(field, Issue::NotAllowed));
        }

        if self.is_binary()
            && let Some(encoded) = value.as_str()
            && STANDARD.decode(encoded).is_err()
        {
            return Err(ValidationError::new(field, Issue::InvalidEncoding));
        }

        Ok(())
    }
}

fn object_type() -> ValueType {
    ValueType::Object
}

/// Parameter schema of a tool: an object with named properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSchema {
    #[serde(rename = "type", default = "object_type")]
    pub kind: ValueType,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            kind: ValueType::Object,
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: None,
            extra: Map::new(),
        }
    }
}

impl ParameterSchema {
    /// An object schema with no properties.
    pub fn object() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn required_property(self, name: impl Into<String>, schema: PropertySchema) -> Self {
        let name = name.into();
        let mut this = self.property(name.clone(), schema);
        if !this.required.contains(&name) {
            this.required.push(name);
        }
        this
    }

    /// Reject arguments that are not declared in `properties`.
    pub fn closed(mut self) -> Self {
        self.additional_properties = Some(Value::Bool(false));
        self
    }

    /// Names of properties carried as base64 binary payloads.
    pub fn binary_fields(&self) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .filter(|(_, p)| p.is_binary())
            .map(|(name, _)| name.as_str())
    }

    pub fn is_binary(&self, field: &str) -> bool {
        self.properties.get(field).is_some_and(PropertySchema::is_binary)
    }

    /// Validate `arguments`, reporting the first failing field.
    ///
    /// Required fields are checked first, in declared order; then each
    /// supplied argument against its property schema.
    pub fn validate(&self, arguments: &Map<String, Value>) -> Result<(), ValidationError> {
        if let Some(field) = self.required.iter().find(|f| !arguments.contains_key(*f)) {
            return Err(ValidationError::new(field, Issue::Missing));
        }

        let closed = matches!(self.additional_properties, Some(Value::Bool(false)));

        for (field, value) in arguments {
            match self.properties.get(field) {
                Some(property) => property.check(field, value)?,
                None if closed => return Err(ValidationError::new(field, Issue::Unexpected)),
                None => {}
            }
        }

        Ok(())
    }
}

/// Why a field failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    Missing,
    WrongType {
        expected: String,
        found: &'static str,
    },
    NotAllowed,
    Unexpected,
    InvalidEncoding,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("missing required field"),
            Self::WrongType { expected, found } => write!(f, "expected {expected}, got {found}"),
            Self::NotAllowed => f.write_str("value is not one of the allowed values"),
            Self::Unexpected => f.write_str("field is not declared by the tool"),
            Self::InvalidEncoding => f.write_str("value is not valid base64"),
        }
    }
}

/// Schema mismatch on a named field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid argument `{field}`: {issue}")]
pub struct ValidationError {
    pub field: String,
    pub issue: Issue,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, issue: Issue) -> Self {
        Self {
            field: field.into(),
            issue,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
