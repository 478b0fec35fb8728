//! Tool descriptors.

use serde::{Deserialize, Serialize};

use crate::schema::ParameterSchema;

/// A named, schema-typed capability declaration.
///
/// Serialized with the schema under `parameters`; `parameterSchema`,
/// `inputSchema` and `input_schema` are accepted when reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(
        rename = "parameters",
        alias = "parameterSchema",
        alias = "inputSchema",
        alias = "input_schema",
        default
    )]
    pub parameter_schema: ParameterSchema,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema: ParameterSchema::default(),
        }
    }

    pub fn with_schema(mut self, schema: ParameterSchema) -> Self {
        self.parameter_schema = schema;
        self
    }
}
