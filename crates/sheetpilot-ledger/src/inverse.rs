//! Inverse synthesis.
//!
//! Built-in kinds are matched exhaustively; `OperationKind::Other` actions
//! consult the custom rule table. Kinds that restore prior state need a
//! captured before-snapshot and get no inverse without one.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use sheetpilot_protocol::{InverseCall, OperationDraft, OperationKind};

/// Argument keys that locate an operation's effect and carry over unchanged
/// into its inverse.
const LOCATION_KEYS: &[&str] = &["sheet", "target", "range", "index", "count", "name"];

pub trait InverseRule: Send + Sync {
    fn inverse(&self, draft: &OperationDraft) -> Option<InverseCall>;
}

impl<F> InverseRule for F
where
    F: Fn(&OperationDraft) -> Option<InverseCall> + Send + Sync,
{
    fn inverse(&self, draft: &OperationDraft) -> Option<InverseCall> {
        self(draft)
    }
}

#[derive(Clone, Default)]
pub struct InverseRules {
    custom: HashMap<String, Arc<dyn InverseRule>>,
}

impl std::fmt::Debug for InverseRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InverseRules")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InverseRules {
    /// Register a rule for a custom action (`OperationKind::Other`).
    pub fn register(&mut self, action: impl Into<String>, rule: impl InverseRule + 'static) {
        self.custom.insert(action.into(), Arc::new(rule));
    }

    pub fn synthesize(&self, draft: &OperationDraft) -> Option<InverseCall> {
        match &draft.kind {
            OperationKind::WriteValue | OperationKind::WriteFormula | OperationKind::ClearContents => {
                restore_values(draft)
            }
            OperationKind::ApplyFormat => {
                let before = draft.before.clone()?;
                let mut parameters = location(draft);
                parameters.insert("format".to_owned(), before);
                Some(inverse(draft, OperationKind::ApplyFormat, parameters))
            }
            OperationKind::InsertRows => Some(inverse(draft, OperationKind::DeleteRows, location(draft))),
            OperationKind::InsertColumns => {
                Some(inverse(draft, OperationKind::DeleteColumns, location(draft)))
            }
            OperationKind::DeleteRows => Some(reinsert(draft, OperationKind::InsertRows)),
            OperationKind::DeleteColumns => Some(reinsert(draft, OperationKind::InsertColumns)),
            OperationKind::AddSheet => Some(inverse(draft, OperationKind::RemoveSheet, location(draft))),
            OperationKind::RemoveSheet => Some(reinsert(draft, OperationKind::AddSheet)),
            OperationKind::Other(action) => self.custom.get(action)?.inverse(draft),
        }
    }
}

fn location(draft: &OperationDraft) -> Map<String, Value> {
    LOCATION_KEYS
        .iter()
        .filter_map(|key| {
            draft
                .parameters
                .get(*key)
                .map(|value| ((*key).to_owned(), value.clone()))
        })
        .collect()
}

fn inverse(draft: &OperationDraft, kind: OperationKind, parameters: Map<String, Value>) -> InverseCall {
    InverseCall::in_namespace_of(&draft.tool_name, kind, parameters)
}

/// Write the captured before-contents back to the same location.
fn restore_values(draft: &OperationDraft) -> Option<InverseCall> {
    let before = draft.before.clone()?;
    let mut parameters = location(draft);
    parameters.insert("value".to_owned(), before);
    Some(inverse(draft, OperationKind::WriteValue, parameters))
}

/// Re-create a deleted span or sheet, restoring its contents when captured.
fn reinsert(draft: &OperationDraft, kind: OperationKind) -> InverseCall {
    let mut parameters = location(draft);
    if let Some(before) = &draft.before {
        parameters.insert("contents".to_owned(), before.clone());
    }
    inverse(draft, kind, parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(tool: &str, params: Value) -> OperationDraft {
        let Value::Object(map) = params else {
            panic!("params must be an object");
        };
        OperationDraft::new(tool, map)
    }

    #[test]
    fn value_write_inverts_to_before_value() {
        let d = draft("excel/write-value", json!({ "target": "A1", "value": 5 })).with_before(json!(""));
        let inverse = InverseRules::default().synthesize(&d).unwrap();
        assert_eq!(inverse.tool_name, "excel/write-value");
        assert_eq!(inverse.parameters.get("target"), Some(&json!("A1")));
        assert_eq!(inverse.parameters.get("value"), Some(&json!("")));
    }

    #[test]
    fn value_write_without_snapshot_has_no_inverse() {
        let d = draft("excel/write-value", json!({ "target": "A1", "value": 5 }));
        assert!(InverseRules::default().synthesize(&d).is_none());
    }

    #[test]
    fn clear_inverts_to_write_of_prior_contents() {
        let d = draft("excel/clear-range", json!({ "sheet": "S1", "target": "A1:B2" }))
            .with_before(json!([[1, 2], [3, 4]]));
        let inverse = InverseRules::default().synthesize(&d).unwrap();
        assert_eq!(inverse.kind, OperationKind::WriteValue);
        assert_eq!(inverse.parameters.get("sheet"), Some(&json!("S1")));
        assert_eq!(inverse.parameters.get("value"), Some(&json!([[1, 2], [3, 4]])));
    }

    #[test]
    fn format_apply_restores_before_format() {
        let d = draft("excel/apply-format", json!({ "target": "A1", "format": { "bold": true } }))
            .with_before(json!({ "bold": false }));
        let inverse = InverseRules::default().synthesize(&d).unwrap();
        assert_eq!(inverse.kind, OperationKind::ApplyFormat);
        assert_eq!(inverse.parameters.get("format"), Some(&json!({ "bold": false })));
    }

    #[test]
    fn insert_rows_inverts_to_delete_of_same_span() {
        let d = draft("excel/insert-rows", json!({ "sheet": "S1", "index": 3, "count": 2 }));
        let inverse = InverseRules::default().synthesize(&d).unwrap();
        assert_eq!(inverse.tool_name, "excel/delete-rows");
        assert_eq!(inverse.parameters.get("index"), Some(&json!(3)));
        assert_eq!(inverse.parameters.get("count"), Some(&json!(2)));
    }

    #[test]
    fn delete_rows_reinserts_captured_contents() {
        let d = draft("excel/delete-rows", json!({ "index": 1, "count": 1 })).with_before(json!([["x"]]));
        let inverse = InverseRules::default().synthesize(&d).unwrap();
        assert_eq!(inverse.kind, OperationKind::InsertRows);
        assert_eq!(inverse.parameters.get("contents"), Some(&json!([["x"]])));
    }

    #[test]
    fn custom_kinds_use_registered_rules() {
        let d = draft("excel/merge-cells", json!({ "target": "A1:B1" }));
        let mut rules = InverseRules::default();
        assert!(rules.synthesize(&d).is_none());

        rules.register("merge-cells", |draft: &OperationDraft| {
            Some(InverseCall::in_namespace_of(
                &draft.tool_name,
                OperationKind::Other("unmerge-cells".into()),
                draft.parameters.clone(),
            ))
        });
        let inverse = rules.synthesize(&d).unwrap();
        assert_eq!(inverse.tool_name, "excel/unmerge-cells");
    }
}
