//! Tool types: capabilities, calls, and results.

use crate::ids::CallId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named, backend-owned operation with a declared input contract.
///
/// Names are namespaced as `domain/action` (e.g. `excel/write-value`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCapability {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolCapability {
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            description: String::new(),
            input_schema: empty_object_schema(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn namespace(&self) -> &str {
        namespace_of(&self.name)
    }

    pub fn action(&self) -> &str {
        action_of(&self.name)
    }
}

/// Namespace prefix of a capability name; the whole name when it has none.
pub fn namespace_of(name: &str) -> &str {
    name.split_once('/').map_or(name, |(namespace, _)| namespace)
}

/// Action suffix of a capability name; the whole name when it has no namespace.
pub fn action_of(name: &str) -> &str {
    name.split_once('/').map_or(name, |(_, action)| action)
}

/// A tool invocation request. Produced by a caller, consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: CallId,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            call_id: CallId::generate(),
            name: name.into(),
            arguments,
        }
    }

    /// Build a call from a JSON value; non-object values yield empty arguments.
    pub fn from_value(name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(name, arguments)
    }

    pub fn namespace(&self) -> &str {
        namespace_of(&self.name)
    }

    pub fn action(&self) -> &str {
        action_of(&self.name)
    }
}

/// One item of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text { text: String },
    Structured { data: Value },
    Error { message: String },
}

/// Output of exactly one backend invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::Text { text: text.into() }],
            ..Self::default()
        }
    }

    pub fn structured(data: Value) -> Self {
        Self {
            content: vec![ContentItem::Structured { data }],
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            content: vec![ContentItem::Error {
                message: message.clone(),
            }],
            is_error: true,
            error_message: Some(message),
        }
    }

    pub fn with_item(mut self, item: ContentItem) -> Self {
        self.content.push(item);
        self
    }

    /// First value stored under `key` in any structured content item.
    ///
    /// Backends report `before` / `after` snapshots this way.
    pub fn structured_field(&self, key: &str) -> Option<&Value> {
        self.content.iter().find_map(|item| match item {
            ContentItem::Structured { data } => data.get(key),
            ContentItem::Text { .. } | ContentItem::Error { .. } => None,
        })
    }

    /// Best-effort error text: the explicit message, else the first error item.
    pub fn error_text(&self) -> Option<String> {
        if let Some(message) = &self.error_message {
            return Some(message.clone());
        }
        self.content.iter().find_map(|item| match item {
            ContentItem::Error { message } => Some(message.clone()),
            ContentItem::Text { .. } | ContentItem::Structured { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capability_name_splits_into_namespace_and_action() {
        let cap = ToolCapability::new("excel/read-range", "Read range");
        assert_eq!(cap.namespace(), "excel");
        assert_eq!(cap.action(), "read-range");

        let bare = ToolCapability::new("ping", "Ping");
        assert_eq!(bare.namespace(), "ping");
        assert_eq!(bare.action(), "ping");
    }

    #[test]
    fn tool_call_from_non_object_has_no_arguments() {
        let call = ToolCall::from_value("excel/read-range", json!("A1"));
        assert!(call.arguments.is_empty());
        assert_eq!(call.namespace(), "excel");
    }

    #[test]
    fn structured_field_finds_snapshot() {
        let result = ToolResult::text("written")
            .with_item(ContentItem::Structured {
                data: json!({ "before": "", "after": 5 }),
            });
        assert_eq!(result.structured_field("before"), Some(&json!("")));
        assert_eq!(result.structured_field("after"), Some(&json!(5)));
        assert!(result.structured_field("missing").is_none());
    }

    #[test]
    fn error_result_sets_flag_and_message() {
        let result = ToolResult::error("range locked");
        assert!(result.is_error);
        assert_eq!(result.error_text().as_deref(), Some("range locked"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["content"][0]["type"], "error");
    }
}
