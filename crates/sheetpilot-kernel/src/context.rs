use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use sheetpilot_approval::{ApprovalGate, GateEvent};
use sheetpilot_events::{NotificationBus, NotificationFilter};
use sheetpilot_ledger::{BatchUndoReport, LedgerError, OperationLedger, Redone, Undone};
use sheetpilot_protocol::{
    ApprovalId, ApprovalResponse, ApprovalTicket, BackendId, BatchId, Category, CoreResult,
    Notification, NotificationDraft, NotificationId, NotificationPayload, Operation, OperationId,
    Priority, SessionId, SubscriptionId, ToolBackend, ToolCall, ToolCapability,
};
use sheetpilot_store::PersistQueue;
use sheetpilot_tools::{DispatchResult, SessionInfo, ToolDispatcher};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, info, instrument, warn};

const LEDGER_SOURCE: &str = "ledger";

pub fn ledger_key(session_id: &SessionId) -> String {
    format!("ledger/{session_id}")
}

/// One conversation: its own dispatcher, ledger, bus and approval gate.
///
/// Calls that touch backends or the ledger are serialised so a session has
/// at most one in flight. Approval resolution and notification reads are
/// not serialised; they must stay usable while a call is suspended.
pub struct SessionContext {
    session_id: SessionId,
    dispatcher: ToolDispatcher,
    in_flight: Mutex<()>,
    initialized: AtomicBool,
    persist: Option<Arc<PersistQueue>>,
    approval_forwarder: JoinHandle<()>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.approval_forwarder.abort();
    }
}

impl SessionContext {
    /// Must be called inside a tokio runtime.
    pub(crate) fn new(dispatcher: ToolDispatcher, persist: Option<Arc<PersistQueue>>) -> Self {
        let session_id = dispatcher.session_id().clone();
        let approval_forwarder = tokio::spawn(forward_gate_events(
            dispatcher.gate().subscribe(),
            dispatcher.bus(),
        ));
        Self {
            session_id,
            dispatcher,
            in_flight: Mutex::new(()),
            initialized: AtomicBool::new(false),
            persist,
            approval_forwarder,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn ledger(&self) -> Arc<OperationLedger> {
        self.dispatcher.ledger()
    }

    pub fn bus(&self) -> Arc<NotificationBus> {
        self.dispatcher.bus()
    }

    pub fn gate(&self) -> Arc<ApprovalGate> {
        self.dispatcher.gate()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn mark_initialized(&self) -> bool {
        !self.initialized.swap(true, Ordering::AcqRel)
    }

    pub async fn register_backend(&self, backend: Arc<dyn ToolBackend>) -> CoreResult<SessionInfo> {
        self.dispatcher.register_backend(backend).await
    }

    pub fn disconnect(&self, backend_id: &BackendId) -> bool {
        self.dispatcher.disconnect(backend_id)
    }

    pub fn backends(&self) -> Vec<SessionInfo> {
        self.dispatcher.sessions()
    }

    pub fn capabilities(&self) -> Vec<ToolCapability> {
        self.dispatcher.list_capabilities()
    }

    #[instrument(skip(self, call), fields(session_id = %self.session_id, tool = %call.name))]
    pub async fn invoke(&self, call: ToolCall) -> CoreResult<DispatchResult> {
        let _guard = self.in_flight.lock().await;
        let result = self.dispatcher.invoke(call).await?;
        if result
            .report()
            .is_some_and(|report| report.operation_id.is_some())
        {
            self.persist_ledger();
        }
        Ok(result)
    }

    /// Undo the newest undoable operation, or its whole batch.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn undo(&self) -> CoreResult<bool> {
        let _guard = self.in_flight.lock().await;
        let undone = match self.ledger().undo_last(&self.dispatcher).await {
            Ok(undone) => undone,
            Err(error) => return Err(self.ledger_failure(error)),
        };
        let Some(undone) = undone else {
            return Ok(false);
        };
        match undone {
            Undone::Operation(operation_id) => {
                self.publish_ledger("operation-undone", NotificationPayload::OperationUndone {
                    operation_id,
                });
            }
            Undone::Batch(report) => self.publish_batch_undone(&report),
        }
        self.persist_ledger();
        Ok(true)
    }

    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn redo(&self) -> CoreResult<bool> {
        let _guard = self.in_flight.lock().await;
        let redone = match self.ledger().redo_last(&self.dispatcher).await {
            Ok(redone) => redone,
            Err(error) => return Err(self.ledger_failure(error)),
        };
        let Some(redone) = redone else {
            return Ok(false);
        };
        let operation_ids = match redone {
            Redone::Operation(operation_id) => vec![operation_id],
            Redone::Batch { operations, .. } => operations,
        };
        for operation_id in operation_ids {
            self.publish_ledger("operation-redone", NotificationPayload::OperationRedone {
                operation_id,
            });
        }
        self.persist_ledger();
        Ok(true)
    }

    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn undo_batch(&self, batch_id: &BatchId) -> CoreResult<BatchUndoReport> {
        let _guard = self.in_flight.lock().await;
        let report = match self.ledger().undo_batch(batch_id, &self.dispatcher).await {
            Ok(report) => report,
            Err(error) => return Err(self.ledger_failure(error)),
        };
        if !report.is_complete() {
            warn!(%batch_id, undone = report.undone.len(), "batch undo stopped early");
        }
        self.publish_batch_undone(&report);
        self.persist_ledger();
        Ok(report)
    }

    fn publish_batch_undone(&self, report: &BatchUndoReport) {
        self.publish_ledger("batch-undone", NotificationPayload::BatchUndone {
            batch_id: report.batch_id.clone(),
            undone: report.undone.clone(),
            blocked: report
                .blocked
                .as_ref()
                .map(|blocked| blocked.operation_id.clone()),
        });
    }

    pub async fn start_batch(&self, description: impl Into<String>) -> CoreResult<BatchId> {
        let _guard = self.in_flight.lock().await;
        Ok(self.ledger().start_batch(description)?)
    }

    pub async fn end_batch(&self) -> Option<BatchId> {
        let _guard = self.in_flight.lock().await;
        let batch_id = self.ledger().end_batch();
        if batch_id.is_some() {
            self.persist_ledger();
        }
        batch_id
    }

    /// Newest first.
    pub fn history(&self, limit: usize) -> Vec<Operation> {
        self.ledger().history(limit)
    }

    pub fn subscribe<F>(&self, filter: NotificationFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus().subscribe(filter, callback)
    }

    pub fn unsubscribe(&self, subscription_id: &SubscriptionId) -> bool {
        self.bus().unsubscribe(subscription_id)
    }

    pub fn subscribe_stream(
        &self,
        filter: NotificationFilter,
    ) -> impl Stream<Item = Notification> + Send + use<> {
        self.bus().subscribe_stream(filter)
    }

    pub fn notifications(&self, filter: &NotificationFilter) -> Vec<Notification> {
        self.bus().query(filter)
    }

    pub fn mark_read(&self, notification_id: &NotificationId) -> bool {
        self.bus().mark_read(notification_id)
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalTicket> {
        self.gate().pending()
    }

    pub fn resolve_approval(&self, approval_id: &ApprovalId, response: ApprovalResponse) -> bool {
        self.gate().resolve(approval_id, response)
    }

    pub fn cancel_approval(&self, approval_id: &ApprovalId, reason: impl Into<String>) -> bool {
        self.gate().cancel(approval_id, reason)
    }

    fn publish_ledger(&self, event: &str, payload: NotificationPayload) {
        self.bus()
            .publish(NotificationDraft::new(LEDGER_SOURCE, event, payload).category(Category::ledger()));
    }

    fn ledger_failure(&self, error: LedgerError) -> sheetpilot_protocol::CoreError {
        warn!(session_id = %self.session_id, %error, "ledger operation failed");
        let operation_id: Option<OperationId> = error.operation_id().cloned();
        self.bus().publish(
            NotificationDraft::new(
                LEDGER_SOURCE,
                "ledger-error",
                NotificationPayload::Custom {
                    data: json!({ "message": error.to_string(), "operation_id": operation_id }),
                },
            )
            .category(Category::error())
            .priority(Priority::High)
            .title("Undo/redo failed")
            .message(error.to_string()),
        );
        error.into()
    }

    fn persist_ledger(&self) {
        let Some(queue) = &self.persist else {
            return;
        };
        let snapshot = match serde_json::to_value(self.ledger().snapshot()) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(%error, "failed serializing ledger snapshot");
                return;
            }
        };
        if let Err(error) = queue.enqueue(ledger_key(&self.session_id), snapshot) {
            warn!(%error, "failed enqueueing ledger snapshot");
        } else {
            debug!(session_id = %self.session_id, "ledger snapshot enqueued");
        }
    }
}

async fn forward_gate_events(mut events: broadcast::Receiver<GateEvent>, bus: Arc<NotificationBus>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "approval event forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let draft = match event {
            GateEvent::Requested(ticket) => {
                let priority = ticket.request.priority.unwrap_or(Priority::High);
                NotificationDraft::new(
                    "approvals",
                    "approval-requested",
                    NotificationPayload::ApprovalRequested {
                        approval_id: ticket.approval_id,
                        kind: ticket.request.kind,
                        title: ticket.request.title.clone(),
                    },
                )
                .title(ticket.request.title)
                .priority(priority)
                .action("approve", "Approve")
                .action("deny", "Deny")
            }
            GateEvent::Resolved {
                approval_id,
                outcome,
            } => NotificationDraft::new(
                "approvals",
                "approval-resolved",
                NotificationPayload::ApprovalResolved {
                    approval_id,
                    outcome: outcome.label().to_owned(),
                },
            )
            .priority(Priority::Low),
        };
        bus.publish(draft.category(Category::approval()));
    }
    info!("approval event forwarder stopped");
}
