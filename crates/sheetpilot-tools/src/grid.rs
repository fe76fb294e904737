//! In-memory grid backend.
//!
//! A sparse map of cell values and formats per sheet. It reports `before` /
//! `after` snapshots in a structured result item so the ledger can build
//! inverses. Snapshots of a single cell are the bare value (`""` when empty);
//! snapshots of a range are an object keyed by cell label.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use sheetpilot_protocol::{
    BackendId, ContentItem, CoreError, CoreResult, ToolBackend, ToolCall, ToolCapability,
    ToolResult,
};
use tracing::{debug, instrument};

pub const DEFAULT_SHEET: &str = "Sheet1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cell {
    pub row: u32,
    pub col: u32,
}

impl Cell {
    /// Parse an `A1`-style label. Rows and columns are 1-based.
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        let split = label.find(|c: char| c.is_ascii_digit())?;
        let (letters, digits) = label.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        let col = letters.chars().try_fold(0_u32, |acc, c| {
            let digit = u32::from(c.to_ascii_uppercase()) - u32::from('A') + 1;
            acc.checked_mul(26)?.checked_add(digit)
        })?;
        let row: u32 = digits.parse().ok()?;
        (row > 0).then_some(Self { row, col })
    }

    fn shifted_rows(self, delta: i64) -> Option<Self> {
        let row = u32::try_from(i64::from(self.row) + delta).ok()?;
        (row > 0).then_some(Self { row, col: self.col })
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut letters = Vec::new();
        let mut n = self.col;
        while n > 0 {
            n -= 1;
            letters.push(char::from(b'A' + u8::try_from(n % 26).unwrap_or(0)));
            n /= 26;
        }
        let letters: String = letters.into_iter().rev().collect();
        write!(f, "{letters}{}", self.row)
    }
}

/// Largest range a single call may address (256 columns by 256 rows).
pub const MAX_RANGE_CELLS: u64 = 65_536;

/// Cells of an `A1` or `A1:C3` target, row-major. Ranges above
/// [`MAX_RANGE_CELLS`] are rejected before any cell is materialised.
pub fn parse_target(target: &str) -> CoreResult<Vec<Cell>> {
    let invalid = || CoreError::InvalidArguments(format!("invalid target `{target}`"));
    let (start, end) = match target.split_once(':') {
        Some((start, end)) => (
            Cell::parse(start).ok_or_else(invalid)?,
            Cell::parse(end).ok_or_else(invalid)?,
        ),
        None => {
            let cell = Cell::parse(target).ok_or_else(invalid)?;
            (cell, cell)
        }
    };
    let rows = start.row.min(end.row)..=start.row.max(end.row);
    let cols = start.col.min(end.col)..=start.col.max(end.col);

    let height = u64::from(rows.end() - rows.start()) + 1;
    let width = u64::from(cols.end() - cols.start()) + 1;
    match height.checked_mul(width) {
        Some(cells) if cells <= MAX_RANGE_CELLS => {}
        _ => {
            return Err(CoreError::InvalidArguments(format!(
                "target `{target}` spans more than {MAX_RANGE_CELLS} cells"
            )));
        }
    }

    Ok(rows
        .flat_map(|row| cols.clone().map(move |col| Cell { row, col }))
        .collect())
}

/// A value keyed by cell labels, as produced by range snapshots.
fn per_cell_map(value: &Value) -> Option<&Map<String, Value>> {
    value
        .as_object()
        .filter(|map| !map.is_empty() && map.keys().all(|key| Cell::parse(key).is_some()))
}

fn is_blank(value: &Value) -> bool {
    value.is_null() || value.as_str().is_some_and(str::is_empty)
}

#[derive(Debug, Default, Clone)]
struct Sheet {
    cells: BTreeMap<Cell, Value>,
    formats: BTreeMap<Cell, Value>,
}

impl Sheet {
    fn snapshot(map: &BTreeMap<Cell, Value>, cells: &[Cell], empty: &Value) -> Value {
        match cells {
            [cell] => map.get(cell).cloned().unwrap_or_else(|| empty.clone()),
            _ => Value::Object(
                cells
                    .iter()
                    .map(|cell| {
                        let value = map.get(cell).cloned().unwrap_or_else(|| empty.clone());
                        (cell.to_string(), value)
                    })
                    .collect(),
            ),
        }
    }

    /// Write `value` into `cells`; a per-cell map assigns by label.
    fn assign(map: &mut BTreeMap<Cell, Value>, cells: &[Cell], value: &Value) {
        let by_label = per_cell_map(value).filter(|_| cells.len() > 1);
        for cell in cells {
            let next = match by_label {
                Some(labels) => labels.get(&cell.to_string()).cloned().unwrap_or(Value::Null),
                None => value.clone(),
            };
            if is_blank(&next) || next.as_object().is_some_and(Map::is_empty) {
                map.remove(cell);
            } else {
                map.insert(*cell, next);
            }
        }
    }

    fn contents(&self) -> Value {
        Value::Object(
            self.cells
                .iter()
                .map(|(cell, value)| (cell.to_string(), value.clone()))
                .collect(),
        )
    }

    fn write_contents(&mut self, contents: &Value) {
        if let Some(map) = per_cell_map(contents) {
            for (label, value) in map {
                if let Some(cell) = Cell::parse(label) {
                    Self::assign(&mut self.cells, &[cell], value);
                }
            }
        }
    }

    fn shift_rows(&mut self, from_row: u32, delta: i64) {
        for map in [&mut self.cells, &mut self.formats] {
            let moved: BTreeMap<Cell, Value> = std::mem::take(map)
                .into_iter()
                .filter_map(|(cell, value)| {
                    if cell.row >= from_row {
                        cell.shifted_rows(delta).map(|cell| (cell, value))
                    } else {
                        Some((cell, value))
                    }
                })
                .collect();
            *map = moved;
        }
    }
}

#[derive(Debug)]
struct GridState {
    sheets: IndexMap<String, Sheet>,
    locked: HashSet<(String, Cell)>,
}

impl Default for GridState {
    fn default() -> Self {
        let mut sheets = IndexMap::new();
        sheets.insert(DEFAULT_SHEET.to_owned(), Sheet::default());
        Self {
            sheets,
            locked: HashSet::new(),
        }
    }
}

/// Reference backend owning `{namespace}/...` capabilities.
pub struct InMemoryGridBackend {
    backend_id: BackendId,
    namespace: String,
    state: Mutex<GridState>,
}

impl fmt::Debug for InMemoryGridBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryGridBackend")
            .field("backend_id", &self.backend_id)
            .field("namespace", &self.namespace)
            .finish()
    }
}

type Args = Map<String, Value>;

fn str_arg<'a>(args: &'a Args, key: &str) -> CoreResult<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::InvalidArguments(format!("missing string argument `{key}`")))
}

fn u32_arg(args: &Args, key: &str) -> CoreResult<u32> {
    args.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| CoreError::InvalidArguments(format!("`{key}` must be a positive integer")))
}

fn target_arg(args: &Args) -> CoreResult<Vec<Cell>> {
    parse_target(str_arg(args, "target")?)
}

fn sheet_arg(args: &Args) -> &str {
    args.get("sheet").and_then(Value::as_str).unwrap_or(DEFAULT_SHEET)
}

fn changed(summary: String, before: Value, after: Value) -> ToolResult {
    ToolResult::text(summary).with_item(ContentItem::Structured {
        data: json!({ "before": before, "after": after }),
    })
}

impl InMemoryGridBackend {
    pub fn new(backend_id: impl Into<BackendId>, namespace: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            namespace: namespace.into(),
            state: Mutex::new(GridState::default()),
        }
    }

    /// Writes touching a locked cell fail with an error result.
    pub fn lock_cell(&self, sheet: &str, label: &str) -> bool {
        match Cell::parse(label) {
            Some(cell) => self.state.lock().locked.insert((sheet.to_owned(), cell)),
            None => false,
        }
    }

    pub fn unlock_cell(&self, sheet: &str, label: &str) -> bool {
        match Cell::parse(label) {
            Some(cell) => self.state.lock().locked.remove(&(sheet.to_owned(), cell)),
            None => false,
        }
    }

    pub fn value(&self, sheet: &str, label: &str) -> Option<Value> {
        let cell = Cell::parse(label)?;
        self.state.lock().sheets.get(sheet)?.cells.get(&cell).cloned()
    }

    pub fn format(&self, sheet: &str, label: &str) -> Option<Value> {
        let cell = Cell::parse(label)?;
        self.state.lock().sheets.get(sheet)?.formats.get(&cell).cloned()
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.state.lock().sheets.keys().cloned().collect()
    }

    fn capability(&self, action: &str, title: &str, schema: Value) -> ToolCapability {
        ToolCapability::new(format!("{}/{action}", self.namespace), title).with_input_schema(schema)
    }

    fn execute_locked(&self, action: &str, args: &Args) -> CoreResult<ToolResult> {
        let mut state = self.state.lock();
        let sheet_name = sheet_arg(args).to_owned();

        match action {
            "list-sheets" => Ok(ToolResult::structured(json!({
                "sheets": state.sheets.keys().collect::<Vec<_>>()
            }))),
            "add-sheet" => {
                let name = str_arg(args, "name")?;
                if state.sheets.contains_key(name) {
                    return Ok(ToolResult::error(format!("sheet `{name}` already exists")));
                }
                let mut sheet = Sheet::default();
                if let Some(contents) = args.get("contents") {
                    sheet.write_contents(contents);
                }
                state.sheets.insert(name.to_owned(), sheet);
                Ok(ToolResult::text(format!("added sheet {name}")))
            }
            "remove-sheet" => {
                let name = str_arg(args, "name")?;
                match state.sheets.shift_remove(name) {
                    Some(sheet) => Ok(changed(
                        format!("removed sheet {name}"),
                        sheet.contents(),
                        Value::Null,
                    )),
                    None => Ok(ToolResult::error(format!("unknown sheet `{name}`"))),
                }
            }
            _ => {
                let locked: Vec<Cell> = state
                    .locked
                    .iter()
                    .filter(|(sheet, _)| *sheet == sheet_name)
                    .map(|(_, cell)| *cell)
                    .collect();
                let Some(sheet) = state.sheets.get_mut(&sheet_name) else {
                    return Ok(ToolResult::error(format!("unknown sheet `{sheet_name}`")));
                };
                Self::execute_on_sheet(sheet, &locked, action, args)
            }
        }
    }

    fn execute_on_sheet(
        sheet: &mut Sheet,
        locked: &[Cell],
        action: &str,
        args: &Args,
    ) -> CoreResult<ToolResult> {
        let blank = Value::String(String::new());
        let no_format = Value::Object(Map::new());

        let writes_cells = matches!(
            action,
            "write-value" | "write-formula" | "clear-range" | "apply-format"
        );
        if writes_cells {
            let cells = target_arg(args)?;
            if let Some(cell) = cells.iter().find(|cell| locked.contains(cell)) {
                return Ok(ToolResult::error(format!("cell {cell} is locked")));
            }
        }

        match action {
            "read-range" => {
                let cells = target_arg(args)?;
                Ok(ToolResult::structured(json!({
                    "values": Sheet::snapshot(&sheet.cells, &cells, &blank)
                })))
            }
            "write-value" | "write-formula" => {
                let cells = target_arg(args)?;
                let key = if action == "write-formula" { "formula" } else { "value" };
                let value = args
                    .get(key)
                    .ok_or_else(|| CoreError::InvalidArguments(format!("missing argument `{key}`")))?;
                let before = Sheet::snapshot(&sheet.cells, &cells, &blank);
                Sheet::assign(&mut sheet.cells, &cells, value);
                let after = Sheet::snapshot(&sheet.cells, &cells, &blank);
                Ok(changed(format!("wrote {} cell(s)", cells.len()), before, after))
            }
            "clear-range" => {
                let cells = target_arg(args)?;
                let before = Sheet::snapshot(&sheet.cells, &cells, &blank);
                Sheet::assign(&mut sheet.cells, &cells, &Value::Null);
                let after = Sheet::snapshot(&sheet.cells, &cells, &blank);
                Ok(changed(format!("cleared {} cell(s)", cells.len()), before, after))
            }
            "apply-format" => {
                let cells = target_arg(args)?;
                let format = args
                    .get("format")
                    .ok_or_else(|| CoreError::InvalidArguments("missing argument `format`".into()))?;
                let before = Sheet::snapshot(&sheet.formats, &cells, &no_format);
                Sheet::assign(&mut sheet.formats, &cells, format);
                let after = Sheet::snapshot(&sheet.formats, &cells, &no_format);
                Ok(changed(format!("formatted {} cell(s)", cells.len()), before, after))
            }
            "insert-rows" => {
                let index = u32_arg(args, "index")?;
                let count = u32_arg(args, "count")?;
                sheet.shift_rows(index, i64::from(count));
                if let Some(contents) = args.get("contents") {
                    sheet.write_contents(contents);
                }
                Ok(ToolResult::text(format!("inserted {count} row(s) at {index}")))
            }
            "delete-rows" => {
                let index = u32_arg(args, "index")?;
                let count = u32_arg(args, "count")?;
                let end = index.saturating_add(count);
                let removed: Map<String, Value> = sheet
                    .cells
                    .iter()
                    .filter(|(cell, _)| (index..end).contains(&cell.row))
                    .map(|(cell, value)| (cell.to_string(), value.clone()))
                    .collect();
                sheet.cells.retain(|cell, _| !(index..end).contains(&cell.row));
                sheet.formats.retain(|cell, _| !(index..end).contains(&cell.row));
                sheet.shift_rows(end, -i64::from(count));
                let before = if removed.is_empty() {
                    Value::Null
                } else {
                    Value::Object(removed)
                };
                Ok(changed(
                    format!("deleted {count} row(s) at {index}"),
                    before,
                    Value::Null,
                ))
            }
            other => Err(CoreError::CapabilityNotFound(other.to_owned())),
        }
    }
}

#[async_trait]
impl ToolBackend for InMemoryGridBackend {
    fn backend_id(&self) -> BackendId {
        self.backend_id.clone()
    }

    async fn capabilities(&self) -> CoreResult<Vec<ToolCapability>> {
        let target = json!({ "type": "string", "description": "A1 or A1:C3" });
        let sheet = json!({ "type": "string" });
        Ok(vec![
            self.capability("list-sheets", "List sheets", json!({ "type": "object" })),
            self.capability(
                "read-range",
                "Read range",
                json!({ "type": "object", "properties": { "sheet": sheet, "target": target }, "required": ["target"] }),
            ),
            self.capability(
                "write-value",
                "Write value",
                json!({ "type": "object", "properties": { "sheet": sheet, "target": target, "value": {} }, "required": ["target", "value"] }),
            ),
            self.capability(
                "write-formula",
                "Write formula",
                json!({ "type": "object", "properties": { "sheet": sheet, "target": target, "formula": { "type": "string" } }, "required": ["target", "formula"] }),
            ),
            self.capability(
                "apply-format",
                "Apply format",
                json!({ "type": "object", "properties": { "sheet": sheet, "target": target, "format": { "type": "object" } }, "required": ["target", "format"] }),
            ),
            self.capability(
                "clear-range",
                "Clear range",
                json!({ "type": "object", "properties": { "sheet": sheet, "target": target }, "required": ["target"] }),
            ),
            self.capability(
                "insert-rows",
                "Insert rows",
                json!({ "type": "object", "properties": { "sheet": sheet, "index": { "type": "integer" }, "count": { "type": "integer" } }, "required": ["index", "count"] }),
            ),
            self.capability(
                "delete-rows",
                "Delete rows",
                json!({ "type": "object", "properties": { "sheet": sheet, "index": { "type": "integer" }, "count": { "type": "integer" } }, "required": ["index", "count"] }),
            ),
            self.capability(
                "add-sheet",
                "Add sheet",
                json!({ "type": "object", "properties": { "name": { "type": "string" } }, "required": ["name"] }),
            ),
            self.capability(
                "remove-sheet",
                "Remove sheet",
                json!({ "type": "object", "properties": { "name": { "type": "string" } }, "required": ["name"] }),
            ),
        ])
    }

    #[instrument(skip(self, call), fields(backend = %self.backend_id, tool = %call.name))]
    async fn execute(&self, call: &ToolCall) -> CoreResult<ToolResult> {
        if call.namespace() != self.namespace {
            return Err(CoreError::CapabilityNotFound(call.name.clone()));
        }
        let result = self.execute_locked(call.action(), &call.arguments)?;
        debug!(is_error = result.is_error, "grid call finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall::from_value(name, args)
    }

    #[test]
    fn cell_labels_round_trip() {
        for label in ["A1", "Z9", "AA10", "AZ3", "BA1"] {
            let cell = Cell::parse(label).unwrap();
            assert_eq!(cell.to_string(), label);
        }
        assert_eq!(Cell::parse("a1"), Some(Cell { row: 1, col: 1 }));
        assert!(Cell::parse("A0").is_none());
        assert!(Cell::parse("1A").is_none());
        assert_eq!(parse_target("A1:B2").map(|cells| cells.len()).ok(), Some(4));
        assert!(matches!(parse_target("A1:"), Err(CoreError::InvalidArguments(_))));
    }

    #[test]
    fn range_size_is_capped() {
        let at_limit = parse_target("A1:IV256").map(|cells| cells.len()).ok();
        assert_eq!(at_limit, Some(65_536));
        assert!(matches!(parse_target("A1:IV257"), Err(CoreError::InvalidArguments(_))));
        assert!(matches!(
            parse_target("A1:ZZZZ9999999"),
            Err(CoreError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn oversized_read_is_rejected() {
        let grid = InMemoryGridBackend::new("excel", "excel");
        let read = grid
            .execute(&call("excel/read-range", json!({ "target": "A1:ZZZZ9999999" })))
            .await;
        assert!(matches!(read, Err(CoreError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn write_reports_before_and_after() -> anyhow::Result<()> {
        let grid = InMemoryGridBackend::new("excel", "excel");
        let result = grid
            .execute(&call("excel/write-value", json!({ "target": "A1", "value": 5 })))
            .await?;
        assert!(!result.is_error);
        assert_eq!(result.structured_field("before"), Some(&json!("")));
        assert_eq!(result.structured_field("after"), Some(&json!(5)));
        assert_eq!(grid.value(DEFAULT_SHEET, "A1"), Some(json!(5)));

        // Writing the before-snapshot back empties the cell.
        grid.execute(&call("excel/write-value", json!({ "target": "A1", "value": "" })))
            .await?;
        assert_eq!(grid.value(DEFAULT_SHEET, "A1"), None);
        Ok(())
    }

    #[tokio::test]
    async fn range_snapshots_restore_per_cell() -> anyhow::Result<()> {
        let grid = InMemoryGridBackend::new("excel", "excel");
        grid.execute(&call("excel/write-value", json!({ "target": "A1", "value": 1 })))
            .await?;
        let cleared = grid
            .execute(&call("excel/clear-range", json!({ "target": "A1:B1" })))
            .await?;
        let before = cleared.structured_field("before").cloned().unwrap();
        assert_eq!(before, json!({ "A1": 1, "B1": "" }));

        grid.execute(&call("excel/write-value", json!({ "target": "A1:B1", "value": before })))
            .await?;
        assert_eq!(grid.value(DEFAULT_SHEET, "A1"), Some(json!(1)));
        assert_eq!(grid.value(DEFAULT_SHEET, "B1"), None);
        Ok(())
    }

    #[tokio::test]
    async fn delete_rows_shifts_and_insert_restores() -> anyhow::Result<()> {
        let grid = InMemoryGridBackend::new("excel", "excel");
        for (target, value) in [("A1", "a"), ("A2", "b"), ("A3", "c")] {
            grid.execute(&call("excel/write-value", json!({ "target": target, "value": value })))
                .await?;
        }
        let deleted = grid
            .execute(&call("excel/delete-rows", json!({ "index": 2, "count": 1 })))
            .await?;
        assert_eq!(grid.value(DEFAULT_SHEET, "A2"), Some(json!("c")));
        let contents = deleted.structured_field("before").cloned().unwrap();

        grid.execute(&call(
            "excel/insert-rows",
            json!({ "index": 2, "count": 1, "contents": contents }),
        ))
        .await?;
        assert_eq!(grid.value(DEFAULT_SHEET, "A2"), Some(json!("b")));
        assert_eq!(grid.value(DEFAULT_SHEET, "A3"), Some(json!("c")));
        Ok(())
    }

    #[tokio::test]
    async fn locked_cells_fail_as_error_results() -> anyhow::Result<()> {
        let grid = InMemoryGridBackend::new("excel", "excel");
        assert!(grid.lock_cell(DEFAULT_SHEET, "B2"));
        let result = grid
            .execute(&call("excel/write-value", json!({ "target": "A1:C3", "value": 1 })))
            .await?;
        assert!(result.is_error);
        assert_eq!(grid.value(DEFAULT_SHEET, "A1"), None);
        Ok(())
    }

    #[tokio::test]
    async fn sheets_can_be_removed_and_restored() -> anyhow::Result<()> {
        let grid = InMemoryGridBackend::new("excel", "excel");
        grid.execute(&call("excel/add-sheet", json!({ "name": "Q1" }))).await?;
        grid.execute(&call(
            "excel/write-value",
            json!({ "sheet": "Q1", "target": "B2", "value": 7 }),
        ))
        .await?;
        let removed = grid
            .execute(&call("excel/remove-sheet", json!({ "name": "Q1" })))
            .await?;
        assert_eq!(grid.sheet_names(), vec![DEFAULT_SHEET.to_owned()]);

        let contents = removed.structured_field("before").cloned().unwrap();
        grid.execute(&call(
            "excel/add-sheet",
            json!({ "name": "Q1", "contents": contents }),
        ))
        .await?;
        assert_eq!(grid.value("Q1", "B2"), Some(json!(7)));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_actions_are_not_found() {
        let grid = InMemoryGridBackend::new("excel", "excel");
        let err = grid
            .execute(&call("excel/explode", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CapabilityNotFound(_)));
    }
}
