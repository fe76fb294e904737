//! Declared input contract for elicitation.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Object schema: typed properties in declaration order plus required names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub properties: IndexMap<String, FieldSchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl InputSchema {
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.properties.insert(
            name.into(),
            FieldSchema {
                field_type,
                description: None,
            },
        );
        self
    }

    pub fn required_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.field(name, field_type)
    }

    /// Check `data` against the schema, collecting every failing field.
    pub fn validate(&self, data: &Map<String, Value>) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        for name in &self.required {
            if data.get(name).is_none_or(is_empty) {
                errors.push(FieldError {
                    field: name.clone(),
                    message: "is required".to_owned(),
                });
            }
        }

        for (name, schema) in &self.properties {
            let Some(value) = data.get(name).filter(|value| !value.is_null()) else {
                continue;
            };
            if !schema.field_type.accepts(value) {
                errors.push(FieldError {
                    field: name.clone(),
                    message: format!("expected {}", schema.field_type.as_str()),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> InputSchema {
        InputSchema::default()
            .required_field("sheet", FieldType::String)
            .required_field("rows", FieldType::Integer)
            .field("confirm", FieldType::Boolean)
            .field("columns", FieldType::Array)
    }

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn valid_input_passes() {
        let input = data(json!({ "sheet": "Q1", "rows": 3, "confirm": true }));
        assert!(schema().validate(&input).is_ok());
    }

    #[test]
    fn every_failing_field_is_reported() {
        let input = data(json!({ "sheet": "  ", "confirm": "yes", "columns": 4 }));
        let errors = schema().validate(&input).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["sheet", "rows", "confirm", "columns"]);
        assert_eq!(errors[2].to_string(), "confirm: expected boolean");
    }

    #[test]
    fn deserializes_json_schema_shape() {
        let schema: InputSchema = serde_json::from_value(json!({
            "properties": { "name": { "type": "string", "description": "Sheet name" } },
            "required": ["name"]
        }))
        .unwrap();
        assert_eq!(schema.properties["name"].field_type, FieldType::String);
        assert_eq!(schema.required, vec!["name".to_owned()]);
    }
}
