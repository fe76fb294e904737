//! Ledger types: operations, their inverses, and batches.

use crate::ids::{BatchId, OperationId};
use crate::tool::{ToolCall, action_of, namespace_of};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Kind of side effect an operation performed.
///
/// Derived from the capability action. Inverse synthesis matches on this
/// exhaustively, so adding a kind is a compile-time-checked change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    WriteValue,
    WriteFormula,
    ApplyFormat,
    ClearContents,
    InsertRows,
    DeleteRows,
    InsertColumns,
    DeleteColumns,
    AddSheet,
    RemoveSheet,
    Other(String),
}

impl OperationKind {
    /// Map a capability action (`write-value`, `clear-range`, ...) to a kind.
    pub fn from_action(action: &str) -> Self {
        match action {
            "write-value" | "write-values" | "write-range" | "set-value" => Self::WriteValue,
            "write-formula" | "set-formula" => Self::WriteFormula,
            "apply-format" | "format-range" | "set-format" => Self::ApplyFormat,
            "clear-range" | "clear-contents" | "delete-range" => Self::ClearContents,
            "insert-rows" => Self::InsertRows,
            "delete-rows" => Self::DeleteRows,
            "insert-columns" => Self::InsertColumns,
            "delete-columns" => Self::DeleteColumns,
            "add-sheet" | "create-sheet" => Self::AddSheet,
            "remove-sheet" | "delete-sheet" => Self::RemoveSheet,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Canonical capability action for this kind.
    pub fn action(&self) -> &str {
        match self {
            Self::WriteValue => "write-value",
            Self::WriteFormula => "write-formula",
            Self::ApplyFormat => "apply-format",
            Self::ClearContents => "clear-range",
            Self::InsertRows => "insert-rows",
            Self::DeleteRows => "delete-rows",
            Self::InsertColumns => "insert-columns",
            Self::DeleteColumns => "delete-columns",
            Self::AddSheet => "add-sheet",
            Self::RemoveSheet => "remove-sheet",
            Self::Other(action) => action,
        }
    }
}

impl From<String> for OperationKind {
    fn from(value: String) -> Self {
        Self::from_action(&value)
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        kind.action().to_owned()
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
    Undone,
    Redone,
}

impl OperationStatus {
    /// Whether the operation's effect is currently in place.
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Completed | Self::Redone)
    }
}

/// The call that reverses an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseCall {
    pub tool_name: String,
    pub kind: OperationKind,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl InverseCall {
    pub fn new(tool_name: impl Into<String>, kind: OperationKind, parameters: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            kind,
            parameters,
        }
    }

    /// Build the inverse of `kind` in the same namespace as `original_tool`.
    pub fn in_namespace_of(
        original_tool: &str,
        kind: OperationKind,
        parameters: Map<String, Value>,
    ) -> Self {
        let tool_name = format!("{}/{}", namespace_of(original_tool), kind.action());
        Self::new(tool_name, kind, parameters)
    }

    pub fn to_call(&self) -> ToolCall {
        ToolCall::new(self.tool_name.clone(), self.parameters.clone())
    }
}

/// What a caller hands to the ledger; the ledger assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    pub kind: OperationKind,
    pub tool_name: String,
    pub description: String,
    pub parameters: Map<String, Value>,
    pub status: OperationStatus,
    pub inverse: Option<InverseCall>,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub undoable: bool,
}

impl OperationDraft {
    pub fn new(tool_name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        let tool_name = tool_name.into();
        let kind = OperationKind::from_action(action_of(&tool_name));
        Self {
            description: tool_name.clone(),
            kind,
            tool_name,
            parameters,
            status: OperationStatus::Completed,
            inverse: None,
            before: None,
            after: None,
            undoable: true,
        }
    }

    pub fn from_call(call: &ToolCall) -> Self {
        Self::new(call.name.clone(), call.arguments.clone())
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_before(mut self, before: Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: Value) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_inverse(mut self, inverse: InverseCall) -> Self {
        self.inverse = Some(inverse);
        self
    }

    pub fn failed(mut self) -> Self {
        self.status = OperationStatus::Failed;
        self
    }

    /// Mark as explicitly non-undoable; undo scans skip past it.
    pub fn non_undoable(mut self) -> Self {
        self.undoable = false;
        self
    }
}

/// A ledger record of one side-effecting call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<InverseCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    pub undoable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
}

impl Operation {
    /// The original call exactly as first recorded.
    pub fn replay_call(&self) -> ToolCall {
        ToolCall::new(self.tool_name.clone(), self.parameters.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Open,
    Completed,
    Undone,
}

/// An atomic group of operations, undone in reverse order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub id: BatchId,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub operation_ids: Vec<OperationId>,
    pub status: BatchStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_is_derived_from_action() {
        let draft = OperationDraft::new("excel/write-value", Map::new());
        assert_eq!(draft.kind, OperationKind::WriteValue);
        assert_eq!(
            OperationKind::from_action("merge-cells"),
            OperationKind::Other("merge-cells".into())
        );
    }

    #[test]
    fn kind_serializes_as_action_string() {
        let json = serde_json::to_value(OperationKind::InsertRows).unwrap();
        assert_eq!(json, json!("insert-rows"));
        let back: OperationKind = serde_json::from_value(json!("clear-range")).unwrap();
        assert_eq!(back, OperationKind::ClearContents);
    }

    #[test]
    fn inverse_call_keeps_original_namespace() {
        let inverse = InverseCall::in_namespace_of(
            "excel/insert-rows",
            OperationKind::DeleteRows,
            Map::new(),
        );
        assert_eq!(inverse.tool_name, "excel/delete-rows");
    }

    #[test]
    fn only_completed_and_redone_are_applied() {
        assert!(OperationStatus::Completed.is_applied());
        assert!(OperationStatus::Redone.is_applied());
        assert!(!OperationStatus::Undone.is_applied());
        assert!(!OperationStatus::Failed.is_applied());
        assert!(!OperationStatus::Pending.is_applied());
    }
}
