use std::collections::VecDeque;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sheetpilot_protocol::{
    BatchId, BatchStatus, Operation, OperationBatch, OperationDraft, OperationExecutor,
    OperationId, OperationStatus, ToolCall,
};
use tracing::{debug, info, instrument, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::inverse::InverseRules;

pub const DEFAULT_LEDGER_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Maximum retained operations; the oldest is evicted first.
    pub capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }
}

/// One entry of the redo stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RedoEntry {
    Operation(OperationId),
    Batch(BatchId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedOperation {
    pub operation_id: OperationId,
    pub reason: String,
}

/// Result of a batch undo. `undone` is in execution (reverse) order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUndoReport {
    pub batch_id: BatchId,
    pub undone: Vec<OperationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<BlockedOperation>,
}

impl BatchUndoReport {
    pub fn is_complete(&self) -> bool {
        self.blocked.is_none()
    }
}

/// What a successful `undo_last` reverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undone {
    Operation(OperationId),
    /// Only members still in effect are listed; earlier single undos are not.
    Batch(BatchUndoReport),
}

/// What a successful `redo_last` re-applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redone {
    Operation(OperationId),
    Batch {
        batch_id: BatchId,
        operations: Vec<OperationId>,
    },
}

/// Serializable copy of the whole ledger state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub operations: Vec<Operation>,
    pub batches: Vec<OperationBatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_batch: Option<BatchId>,
    #[serde(default)]
    pub redo: Vec<RedoEntry>,
}

#[derive(Debug, Default)]
struct LedgerState {
    operations: VecDeque<Operation>,
    batches: IndexMap<BatchId, OperationBatch>,
    open_batch: Option<BatchId>,
    redo: Vec<RedoEntry>,
}

enum UndoTarget {
    Operation(Operation),
    Batch(BatchId),
}

impl LedgerState {
    fn find(&self, id: &OperationId) -> Option<&Operation> {
        self.operations.iter().rev().find(|op| op.id == *id)
    }

    fn find_mut(&mut self, id: &OperationId) -> Option<&mut Operation> {
        self.operations.iter_mut().rev().find(|op| op.id == *id)
    }

    fn set_status(&mut self, id: &OperationId, status: OperationStatus) {
        if let Some(op) = self.find_mut(id) {
            op.status = status;
        }
    }

    fn undo_target(&self) -> Option<UndoTarget> {
        let op = self
            .operations
            .iter()
            .rev()
            .find(|op| op.status.is_applied() && op.undoable)?;
        let closed_batch = op.batch_id.as_ref().filter(|batch_id| {
            self.batches
                .get(*batch_id)
                .is_some_and(|batch| batch.status == BatchStatus::Completed)
        });
        Some(match closed_batch {
            Some(batch_id) => UndoTarget::Batch(batch_id.clone()),
            None => UndoTarget::Operation(op.clone()),
        })
    }

    /// Members still in effect, most recent first.
    fn undoable_members(&self, batch: &OperationBatch) -> Vec<Operation> {
        batch
            .operation_ids
            .iter()
            .rev()
            .filter_map(|id| self.find(id))
            .filter(|op| op.status.is_applied() && op.undoable)
            .cloned()
            .collect()
    }

    fn pop_redo_if_top(&mut self, entry: &RedoEntry) {
        if self.redo.last() == Some(entry) {
            self.redo.pop();
        }
    }

    fn evict(&mut self, capacity: usize) {
        while self.operations.len() > capacity {
            let Some(evicted) = self.operations.pop_front() else {
                break;
            };
            self.redo
                .retain(|entry| *entry != RedoEntry::Operation(evicted.id.clone()));
            if let Some(batch_id) = evicted.batch_id {
                self.drop_batch(&batch_id);
            }
            debug!(operation_id = %evicted.id, "operation evicted from ledger");
        }
    }

    /// Forget a batch whose membership is no longer whole; members become
    /// individual operations.
    fn drop_batch(&mut self, batch_id: &BatchId) {
        if self.batches.shift_remove(batch_id).is_none() {
            return;
        }
        self.redo
            .retain(|entry| *entry != RedoEntry::Batch(batch_id.clone()));
        for op in &mut self.operations {
            if op.batch_id.as_ref() == Some(batch_id) {
                op.batch_id = None;
            }
        }
        if self.open_batch.as_ref() == Some(batch_id) {
            warn!(%batch_id, "open batch dropped after member eviction");
            self.open_batch = None;
        }
    }
}

/// Linear undo/redo history of side-effecting calls.
///
/// State sits behind a synchronous lock that is never held across an await;
/// undo and redo are additionally serialised so replays never interleave.
pub struct OperationLedger {
    config: LedgerConfig,
    rules: InverseRules,
    state: Mutex<LedgerState>,
    replay: tokio::sync::Mutex<()>,
}

impl Default for OperationLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl std::fmt::Debug for OperationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OperationLedger")
            .field("capacity", &self.config.capacity)
            .field("operations", &state.operations.len())
            .field("batches", &state.batches.len())
            .field("redo", &state.redo.len())
            .finish()
    }
}

impl OperationLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_rules(config, InverseRules::default())
    }

    pub fn with_rules(config: LedgerConfig, rules: InverseRules) -> Self {
        Self {
            config,
            rules,
            state: Mutex::new(LedgerState::default()),
            replay: tokio::sync::Mutex::new(()),
        }
    }

    /// Rebuild a ledger from a snapshot, re-applying the capacity bound.
    pub fn from_snapshot(config: LedgerConfig, rules: InverseRules, snapshot: LedgerSnapshot) -> Self {
        let mut state = LedgerState {
            operations: snapshot.operations.into(),
            batches: snapshot
                .batches
                .into_iter()
                .map(|batch| (batch.id.clone(), batch))
                .collect(),
            open_batch: snapshot.open_batch,
            redo: snapshot.redo,
        };
        state.evict(config.capacity);
        Self {
            config,
            rules,
            state: Mutex::new(state),
            replay: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> LedgerConfig {
        self.config
    }

    /// Record a finished call. An explicit inverse on the draft wins; otherwise
    /// one is synthesized for completed, undoable drafts. Clears the redo stack.
    ///
    /// Does not take the replay lock: callers must not record while an undo or
    /// redo of the same ledger is in progress. `SessionContext` guarantees this
    /// by running calls and replays one at a time per session.
    pub fn record(&self, draft: OperationDraft) -> Operation {
        let inverse = match draft.inverse.clone() {
            Some(inverse) => Some(inverse),
            None if draft.status == OperationStatus::Completed && draft.undoable => {
                self.rules.synthesize(&draft)
            }
            None => None,
        };

        let mut state = self.state.lock();
        let operation = Operation {
            id: OperationId::generate(),
            kind: draft.kind,
            tool_name: draft.tool_name,
            timestamp: Utc::now(),
            description: draft.description,
            parameters: draft.parameters,
            status: draft.status,
            inverse,
            before: draft.before,
            after: draft.after,
            undoable: draft.undoable,
            batch_id: state.open_batch.clone(),
        };
        if let Some(batch_id) = &operation.batch_id
            && let Some(batch) = state.batches.get_mut(batch_id)
        {
            batch.operation_ids.push(operation.id.clone());
        }
        state.redo.clear();
        state.operations.push_back(operation.clone());
        state.evict(self.config.capacity);

        debug!(
            operation_id = %operation.id,
            kind = %operation.kind,
            status = ?operation.status,
            has_inverse = operation.inverse.is_some(),
            "operation recorded"
        );
        operation
    }

    /// Open a batch; every operation recorded until `end_batch` joins it.
    pub fn start_batch(&self, description: impl Into<String>) -> LedgerResult<BatchId> {
        let mut state = self.state.lock();
        if let Some(open) = &state.open_batch {
            return Err(LedgerError::BatchAlreadyOpen(open.clone()));
        }
        let batch = OperationBatch {
            id: BatchId::generate(),
            timestamp: Utc::now(),
            description: description.into(),
            operation_ids: Vec::new(),
            status: BatchStatus::Open,
        };
        let batch_id = batch.id.clone();
        state.batches.insert(batch_id.clone(), batch);
        state.open_batch = Some(batch_id.clone());
        debug!(%batch_id, "batch started");
        Ok(batch_id)
    }

    /// Close the open batch. Returns `None` when no batch is open or the
    /// batch recorded nothing (empty batches are discarded).
    pub fn end_batch(&self) -> Option<BatchId> {
        let mut state = self.state.lock();
        let batch_id = state.open_batch.take()?;
        let empty = state
            .batches
            .get(&batch_id)
            .is_none_or(|batch| batch.operation_ids.is_empty());
        if empty {
            state.batches.shift_remove(&batch_id);
            debug!(%batch_id, "empty batch discarded");
            return None;
        }
        if let Some(batch) = state.batches.get_mut(&batch_id) {
            batch.status = BatchStatus::Completed;
            debug!(%batch_id, operations = batch.operation_ids.len(), "batch completed");
        }
        Some(batch_id)
    }

    pub fn can_undo(&self) -> bool {
        self.state.lock().undo_target().is_some()
    }

    pub fn can_redo(&self) -> bool {
        !self.state.lock().redo.is_empty()
    }

    /// Top of the redo stack: the most recently undone entry.
    pub fn peek_redo(&self) -> Option<RedoEntry> {
        self.state.lock().redo.last().cloned()
    }

    /// Undo the most recent operation still in effect.
    ///
    /// Returns `Ok(None)` when there is nothing to undo. An operation without
    /// an inverse fails with `NoInverseDefined` and leaves the ledger as is.
    /// A member of a closed batch undoes the whole batch.
    #[instrument(skip(self, executor))]
    pub async fn undo_last(&self, executor: &dyn OperationExecutor) -> LedgerResult<Option<Undone>> {
        let _replay = self.replay.lock().await;
        let target = self.state.lock().undo_target();
        match target {
            None => Ok(None),
            Some(UndoTarget::Operation(op)) => {
                let inverse = op.inverse.as_ref().ok_or_else(|| LedgerError::NoInverseDefined {
                    operation_id: op.id.clone(),
                    kind: op.kind.clone(),
                })?;
                run_replay(executor, inverse.to_call())
                    .await
                    .map_err(|message| LedgerError::InverseFailed {
                        operation_id: op.id.clone(),
                        message,
                    })?;
                let mut state = self.state.lock();
                state.set_status(&op.id, OperationStatus::Undone);
                state.redo.push(RedoEntry::Operation(op.id.clone()));
                info!(operation_id = %op.id, "operation undone");
                Ok(Some(Undone::Operation(op.id)))
            }
            Some(UndoTarget::Batch(batch_id)) => {
                let first = {
                    let state = self.state.lock();
                    state
                        .batches
                        .get(&batch_id)
                        .and_then(|batch| state.undoable_members(batch).into_iter().next())
                };
                if let Some(op) = first
                    && op.inverse.is_none()
                {
                    return Err(LedgerError::NoInverseDefined {
                        operation_id: op.id,
                        kind: op.kind,
                    });
                }
                let mut report = self.undo_batch_locked(&batch_id, executor).await?;
                match report.blocked.take() {
                    None => Ok(Some(Undone::Batch(report))),
                    Some(blocked) => Err(LedgerError::BatchIncomplete {
                        batch_id,
                        operation_id: blocked.operation_id,
                        reason: blocked.reason,
                    }),
                }
            }
        }
    }

    /// Undo every member of a closed batch in strict reverse order.
    ///
    /// The first failing or missing inverse stops the walk: members already
    /// undone stay undone and the rest are untouched. The report names the
    /// blocking member.
    #[instrument(skip(self, executor))]
    pub async fn undo_batch(
        &self,
        batch_id: &BatchId,
        executor: &dyn OperationExecutor,
    ) -> LedgerResult<BatchUndoReport> {
        let _replay = self.replay.lock().await;
        self.undo_batch_locked(batch_id, executor).await
    }

    async fn undo_batch_locked(
        &self,
        batch_id: &BatchId,
        executor: &dyn OperationExecutor,
    ) -> LedgerResult<BatchUndoReport> {
        let members = {
            let state = self.state.lock();
            let batch = state
                .batches
                .get(batch_id)
                .ok_or_else(|| LedgerError::BatchNotFound(batch_id.clone()))?;
            match batch.status {
                BatchStatus::Open => return Err(LedgerError::BatchStillOpen(batch_id.clone())),
                BatchStatus::Undone => {
                    return Err(LedgerError::BatchAlreadyUndone(batch_id.clone()));
                }
                BatchStatus::Completed => state.undoable_members(batch),
            }
        };

        let mut undone = Vec::with_capacity(members.len());
        let mut blocked = None;
        for op in members {
            let Some(inverse) = &op.inverse else {
                blocked = Some(BlockedOperation {
                    reason: LedgerError::NoInverseDefined {
                        operation_id: op.id.clone(),
                        kind: op.kind.clone(),
                    }
                    .to_string(),
                    operation_id: op.id,
                });
                break;
            };
            match run_replay(executor, inverse.to_call()).await {
                Ok(()) => {
                    self.state.lock().set_status(&op.id, OperationStatus::Undone);
                    undone.push(op.id);
                }
                Err(reason) => {
                    warn!(operation_id = %op.id, %reason, "batch undo blocked");
                    blocked = Some(BlockedOperation {
                        operation_id: op.id,
                        reason,
                    });
                    break;
                }
            }
        }

        let mut state = self.state.lock();
        if blocked.is_none() {
            if let Some(batch) = state.batches.get_mut(batch_id) {
                batch.status = BatchStatus::Undone;
            }
            state.redo.push(RedoEntry::Batch(batch_id.clone()));
            info!(undone = undone.len(), "batch undone");
        } else {
            state
                .redo
                .extend(undone.iter().cloned().map(RedoEntry::Operation));
        }
        Ok(BatchUndoReport {
            batch_id: batch_id.clone(),
            undone,
            blocked,
        })
    }

    /// Re-execute the most recently undone entry's original call(s).
    ///
    /// Returns `Ok(None)` when the redo stack is empty. Stale entries whose
    /// operations were evicted or re-applied are skipped. On failure the entry
    /// stays on the stack.
    #[instrument(skip(self, executor))]
    pub async fn redo_last(&self, executor: &dyn OperationExecutor) -> LedgerResult<Option<Redone>> {
        let _replay = self.replay.lock().await;
        loop {
            let Some(entry) = self.state.lock().redo.last().cloned() else {
                return Ok(None);
            };
            match &entry {
                RedoEntry::Operation(id) => {
                    let op = {
                        let mut state = self.state.lock();
                        let op = state
                            .find(id)
                            .filter(|op| op.status == OperationStatus::Undone)
                            .cloned();
                        if op.is_none() {
                            state.pop_redo_if_top(&entry);
                        }
                        op
                    };
                    let Some(op) = op else {
                        continue;
                    };
                    self.redo_operation(executor, &op).await?;
                    self.state.lock().pop_redo_if_top(&entry);
                    info!(operation_id = %op.id, "operation redone");
                    return Ok(Some(Redone::Operation(op.id)));
                }
                RedoEntry::Batch(batch_id) => {
                    let members = {
                        let mut state = self.state.lock();
                        let members = state
                            .batches
                            .get(batch_id)
                            .filter(|batch| batch.status == BatchStatus::Undone)
                            .map(|batch| {
                                batch
                                    .operation_ids
                                    .iter()
                                    .filter_map(|id| state.find(id))
                                    .filter(|op| op.status == OperationStatus::Undone)
                                    .cloned()
                                    .collect::<Vec<_>>()
                            });
                        if members.is_none() {
                            state.pop_redo_if_top(&entry);
                        }
                        members
                    };
                    let Some(members) = members else {
                        continue;
                    };
                    for op in &members {
                        self.redo_operation(executor, op).await?;
                    }
                    let mut state = self.state.lock();
                    if let Some(batch) = state.batches.get_mut(batch_id) {
                        batch.status = BatchStatus::Completed;
                    }
                    state.pop_redo_if_top(&entry);
                    info!(%batch_id, redone = members.len(), "batch redone");
                    return Ok(Some(Redone::Batch {
                        batch_id: batch_id.clone(),
                        operations: members.into_iter().map(|op| op.id).collect(),
                    }));
                }
            }
        }
    }

    async fn redo_operation(&self, executor: &dyn OperationExecutor, op: &Operation) -> LedgerResult<()> {
        run_replay(executor, op.replay_call())
            .await
            .map_err(|message| LedgerError::RedoFailed {
                operation_id: op.id.clone(),
                message,
            })?;
        self.state.lock().set_status(&op.id, OperationStatus::Redone);
        Ok(())
    }

    /// Most recent operations first.
    pub fn history(&self, limit: usize) -> Vec<Operation> {
        self.state
            .lock()
            .operations
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn operation(&self, id: &OperationId) -> LedgerResult<Operation> {
        self.state
            .lock()
            .find(id)
            .cloned()
            .ok_or_else(|| LedgerError::OperationNotFound(id.clone()))
    }

    pub fn batch(&self, id: &BatchId) -> LedgerResult<OperationBatch> {
        self.state
            .lock()
            .batches
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::BatchNotFound(id.clone()))
    }

    pub fn batches(&self) -> Vec<OperationBatch> {
        self.state.lock().batches.values().cloned().collect()
    }

    pub fn open_batch(&self) -> Option<BatchId> {
        self.state.lock().open_batch.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().operations.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        *state = LedgerState::default();
        debug!("ledger cleared");
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            operations: state.operations.iter().cloned().collect(),
            batches: state.batches.values().cloned().collect(),
            open_batch: state.open_batch.clone(),
            redo: state.redo.clone(),
        }
    }
}

async fn run_replay(executor: &dyn OperationExecutor, call: ToolCall) -> Result<(), String> {
    let tool = call.name.clone();
    match executor.execute(call).await {
        Ok(result) if !result.is_error => Ok(()),
        Ok(result) => Err(result
            .error_text()
            .unwrap_or_else(|| format!("{tool} returned an error result"))),
        Err(error) => Err(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Map, Value, json};
    use sheetpilot_protocol::{CoreResult, OperationKind, ToolResult};

    /// Records every replayed call; fails calls whose `value` is listed.
    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<ToolCall>>,
        fail_values: Vec<Value>,
    }

    impl RecordingExecutor {
        fn failing_on(value: Value) -> Self {
            Self {
                fail_values: vec![value],
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, Option<Value>)> {
            self.calls
                .lock()
                .iter()
                .map(|call| (call.name.clone(), call.arguments.get("value").cloned()))
                .collect()
        }
    }

    #[async_trait]
    impl OperationExecutor for RecordingExecutor {
        async fn execute(&self, call: ToolCall) -> CoreResult<ToolResult> {
            let fail = call
                .arguments
                .get("value")
                .is_some_and(|value| self.fail_values.contains(value));
            self.calls.lock().push(call);
            if fail {
                Ok(ToolResult::error("range locked"))
            } else {
                Ok(ToolResult::text("ok"))
            }
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn write(target: &str, value: Value, before: Value) -> OperationDraft {
        OperationDraft::new(
            "excel/write-value",
            params(json!({ "target": target, "value": value })),
        )
        .with_before(before)
    }

    #[tokio::test]
    async fn write_value_undo_then_redo() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let executor = RecordingExecutor::default();

        let op = ledger.record(write("A1", json!(5), json!("")));
        assert_eq!(op.status, OperationStatus::Completed);
        assert!(ledger.can_undo());

        assert!(ledger.undo_last(&executor).await?.is_some());
        assert_eq!(ledger.operation(&op.id)?.status, OperationStatus::Undone);

        assert!(ledger.redo_last(&executor).await?.is_some());
        assert_eq!(ledger.operation(&op.id)?.status, OperationStatus::Redone);

        assert_eq!(
            executor.calls(),
            vec![
                ("excel/write-value".to_owned(), Some(json!(""))),
                ("excel/write-value".to_owned(), Some(json!(5))),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn undo_n_then_redo_n() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let executor = RecordingExecutor::default();
        let ids: Vec<_> = (0..5)
            .map(|i| ledger.record(write(&format!("A{i}"), json!(i), json!(null))).id)
            .collect();

        for _ in 0..5 {
            assert!(ledger.undo_last(&executor).await?.is_some());
        }
        assert!(!ledger.can_undo());
        assert!(ledger.undo_last(&executor).await?.is_none());

        for _ in 0..5 {
            assert!(ledger.redo_last(&executor).await?.is_some());
        }
        assert!(!ledger.can_redo());
        for id in &ids {
            assert_eq!(ledger.operation(id)?.status, OperationStatus::Redone);
        }

        // Redo replays in original order.
        let redone: Vec<_> = executor.calls()[5..].iter().map(|(_, v)| v.clone()).collect();
        assert_eq!(redone, (0..5).map(|i| Some(json!(i))).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn recording_after_undo_clears_redo() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let executor = RecordingExecutor::default();
        ledger.record(write("A1", json!(1), json!("")));
        assert!(ledger.undo_last(&executor).await?.is_some());
        assert!(ledger.can_redo());

        ledger.record(write("A2", json!(2), json!("")));
        assert!(!ledger.can_redo());
        assert!(ledger.redo_last(&executor).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn missing_inverse_fails_and_leaves_ledger_unchanged() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let executor = RecordingExecutor::default();
        ledger.record(write("A1", json!(1), json!("")));
        let opaque = ledger.record(OperationDraft::new("excel/merge-cells", params(json!({}))));
        assert_eq!(opaque.kind, OperationKind::Other("merge-cells".into()));
        let before = ledger.snapshot();

        let err = ledger.undo_last(&executor).await.unwrap_err();
        assert!(matches!(err, LedgerError::NoInverseDefined { ref operation_id, .. } if *operation_id == opaque.id));
        assert_eq!(ledger.snapshot(), before);
        assert!(executor.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn non_undoable_operations_are_skipped() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let executor = RecordingExecutor::default();
        let first = ledger.record(write("A1", json!(1), json!("")));
        let skipped = ledger.record(OperationDraft::new("excel/merge-cells", params(json!({}))).non_undoable());

        assert!(ledger.undo_last(&executor).await?.is_some());
        assert_eq!(ledger.operation(&first.id)?.status, OperationStatus::Undone);
        assert_eq!(ledger.operation(&skipped.id)?.status, OperationStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn failed_operations_are_never_undone() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let executor = RecordingExecutor::default();
        let failed = ledger.record(write("A1", json!(1), json!("")).failed());
        assert!(failed.inverse.is_none());
        assert!(!ledger.can_undo());
        assert!(ledger.undo_last(&executor).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn failed_inverse_keeps_operation_completed() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let executor = RecordingExecutor::failing_on(json!("old"));
        let op = ledger.record(write("A1", json!("new"), json!("old")));

        let err = ledger.undo_last(&executor).await.unwrap_err();
        assert!(matches!(err, LedgerError::InverseFailed { ref operation_id, .. } if *operation_id == op.id));
        assert_eq!(ledger.operation(&op.id)?.status, OperationStatus::Completed);
        assert!(!ledger.can_redo());
        Ok(())
    }

    #[tokio::test]
    async fn fill_row_batch_undoes_in_reverse() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let executor = RecordingExecutor::default();

        ledger.start_batch("fill row")?;
        let ids: Vec<_> = ["A1", "B1", "C1"]
            .iter()
            .enumerate()
            .map(|(i, target)| ledger.record(write(target, json!(i), json!(format!("old{i}")))).id)
            .collect();
        let batch_id = ledger.end_batch().expect("batch has members");

        let report = ledger.undo_batch(&batch_id, &executor).await?;
        assert!(report.is_complete());
        assert_eq!(report.undone, ids.iter().rev().cloned().collect::<Vec<_>>());
        assert_eq!(ledger.batch(&batch_id)?.status, BatchStatus::Undone);
        assert_eq!(
            executor.calls().into_iter().map(|(_, v)| v).collect::<Vec<_>>(),
            vec![Some(json!("old2")), Some(json!("old1")), Some(json!("old0"))]
        );

        assert!(ledger.redo_last(&executor).await?.is_some());
        assert_eq!(ledger.batch(&batch_id)?.status, BatchStatus::Completed);
        for id in &ids {
            assert_eq!(ledger.operation(id)?.status, OperationStatus::Redone);
        }
        Ok(())
    }

    #[tokio::test]
    async fn batch_undo_stops_at_first_failing_inverse() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        // k = 5; inverse #3 (k-2) fails.
        let executor = RecordingExecutor::failing_on(json!("old3"));

        ledger.start_batch("five writes")?;
        let ids: Vec<_> = (1..=5)
            .map(|i| ledger.record(write(&format!("A{i}"), json!(i), json!(format!("old{i}")))).id)
            .collect();
        let batch_id = ledger.end_batch().expect("batch has members");

        let report = ledger.undo_batch(&batch_id, &executor).await?;
        assert!(!report.is_complete());
        assert_eq!(report.undone, vec![ids[4].clone(), ids[3].clone()]);
        assert_eq!(report.blocked.as_ref().map(|b| &b.operation_id), Some(&ids[2]));

        assert_eq!(ledger.operation(&ids[4])?.status, OperationStatus::Undone);
        assert_eq!(ledger.operation(&ids[3])?.status, OperationStatus::Undone);
        for id in &ids[..3] {
            assert_eq!(ledger.operation(id)?.status, OperationStatus::Completed);
        }
        assert_eq!(ledger.batch(&batch_id)?.status, BatchStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn undo_last_on_batch_member_undoes_whole_batch() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let executor = RecordingExecutor::default();
        let solo = ledger.record(write("Z9", json!(0), json!("")));

        ledger.start_batch("pair")?;
        let first = ledger.record(write("A1", json!(1), json!("")));
        let second = ledger.record(write("A2", json!(2), json!("")));
        let batch_id = ledger.end_batch().expect("batch has members");

        let undone = ledger.undo_last(&executor).await?;
        let Some(Undone::Batch(report)) = undone else {
            panic!("expected a batch undo, got {undone:?}");
        };
        assert_eq!(report.undone, vec![second.id, first.id]);
        assert!(report.is_complete());
        assert_eq!(ledger.batch(&batch_id)?.status, BatchStatus::Undone);
        assert_eq!(ledger.operation(&solo.id)?.status, OperationStatus::Completed);
        assert_eq!(ledger.peek_redo(), Some(RedoEntry::Batch(batch_id)));
        Ok(())
    }

    #[tokio::test]
    async fn undo_after_partial_batch_undo_reports_only_remaining_members() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        ledger.start_batch("three writes")?;
        let ids: Vec<_> = (1..=3)
            .map(|i| ledger.record(write(&format!("A{i}"), json!(i), json!(format!("old{i}")))).id)
            .collect();
        let batch_id = ledger.end_batch().expect("batch has members");

        let blocked = RecordingExecutor::failing_on(json!("old2"));
        let partial = ledger.undo_batch(&batch_id, &blocked).await?;
        assert_eq!(partial.undone, vec![ids[2].clone()]);

        let executor = RecordingExecutor::default();
        let undone = ledger.undo_last(&executor).await?;
        let Some(Undone::Batch(report)) = undone else {
            panic!("expected a batch undo, got {undone:?}");
        };
        assert_eq!(report.undone, vec![ids[1].clone(), ids[0].clone()]);

        let redone = ledger.redo_last(&executor).await?;
        assert_eq!(
            redone,
            Some(Redone::Batch {
                batch_id,
                operations: ids.clone(),
            })
        );
        // The single entry left by the partial undo is stale now.
        assert_eq!(ledger.peek_redo(), Some(RedoEntry::Operation(ids[2].clone())));
        assert_eq!(ledger.redo_last(&executor).await?, None);
        assert!(!ledger.can_redo());
        Ok(())
    }

    #[tokio::test]
    async fn redo_failure_keeps_entry() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let op = ledger.record(write("A1", json!("new"), json!("old")));
        assert!(ledger.undo_last(&RecordingExecutor::default()).await?.is_some());

        let failing = RecordingExecutor::failing_on(json!("new"));
        let err = ledger.redo_last(&failing).await.unwrap_err();
        assert!(matches!(err, LedgerError::RedoFailed { .. }));
        assert_eq!(ledger.operation(&op.id)?.status, OperationStatus::Undone);
        assert!(ledger.can_redo());
        Ok(())
    }

    #[test]
    fn batch_bracket_rules() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        assert!(ledger.end_batch().is_none());

        let batch_id = ledger.start_batch("outer")?;
        assert!(matches!(
            ledger.start_batch("inner"),
            Err(LedgerError::BatchAlreadyOpen(ref id)) if *id == batch_id
        ));
        // Nothing recorded: the batch is discarded.
        assert!(ledger.end_batch().is_none());
        assert!(matches!(ledger.batch(&batch_id), Err(LedgerError::BatchNotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn open_batch_cannot_be_undone() -> anyhow::Result<()> {
        let ledger = OperationLedger::default();
        let batch_id = ledger.start_batch("pending")?;
        ledger.record(write("A1", json!(1), json!("")));
        let err = ledger
            .undo_batch(&batch_id, &RecordingExecutor::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::BatchStillOpen(_)));
        Ok(())
    }

    #[test]
    fn eviction_is_oldest_first_and_drops_broken_batches() -> anyhow::Result<()> {
        let ledger = OperationLedger::new(LedgerConfig { capacity: 3 });
        ledger.start_batch("pair")?;
        let first = ledger.record(write("A1", json!(1), json!(""))).id;
        let second = ledger.record(write("A2", json!(2), json!(""))).id;
        let batch_id = ledger.end_batch().expect("batch has members");

        ledger.record(write("A3", json!(3), json!("")));
        ledger.record(write("A4", json!(4), json!("")));

        assert_eq!(ledger.len(), 3);
        assert!(ledger.operation(&first).is_err());
        assert!(ledger.batch(&batch_id).is_err());
        assert_eq!(ledger.operation(&second)?.batch_id, None);
        Ok(())
    }

    #[test]
    fn snapshot_restores_state() {
        let ledger = OperationLedger::default();
        ledger.record(write("A1", json!(1), json!("")));
        let snapshot = ledger.snapshot();

        let json = serde_json::to_value(&snapshot).unwrap();
        let back: LedgerSnapshot = serde_json::from_value(json).unwrap();
        let restored = OperationLedger::from_snapshot(LedgerConfig::default(), InverseRules::default(), back);
        assert_eq!(restored.snapshot(), snapshot);
        assert!(restored.can_undo());
    }
}
