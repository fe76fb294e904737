use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sheetpilot_approval::ApprovalGate;
use sheetpilot_events::NotificationBus;
use sheetpilot_ledger::OperationLedger;
use sheetpilot_policy::{PolicyEngine, RiskLevel};
use sheetpilot_protocol::{
    ApprovalKind, ApprovalOutcome, ApprovalRequest, BackendId, CallId, Category, CoreError,
    CoreResult, InverseCall, NotificationDraft, NotificationPayload, OperationDraft,
    OperationExecutor, OperationId, Priority, SessionId, ToolBackend, ToolCall, ToolCapability,
    ToolResult,
};
use tracing::{debug, info, instrument, warn};

/// One registered backend as seen from outside the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub backend_id: BackendId,
    pub capabilities: Vec<ToolCapability>,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

struct BackendSession {
    info: SessionInfo,
    handle: Arc<dyn ToolBackend>,
}

#[derive(Default)]
struct Catalog {
    sessions: IndexMap<BackendId, BackendSession>,
    /// Capability name to owning backend. Later registrations take over.
    routes: IndexMap<String, BackendId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionReport {
    pub call_id: CallId,
    pub tool_name: String,
    pub backend_id: BackendId,
    pub result: ToolResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchResult {
    Executed(ToolExecutionReport),
    NotApproved {
        tool_name: String,
        outcome: ApprovalOutcome,
    },
}

impl DispatchResult {
    pub fn report(&self) -> Option<&ToolExecutionReport> {
        match self {
            Self::Executed(report) => Some(report),
            Self::NotApproved { .. } => None,
        }
    }
}

/// Routes tool calls to backends, gating, recording and announcing them.
#[derive(Clone)]
pub struct ToolDispatcher {
    session_id: SessionId,
    catalog: Arc<RwLock<Catalog>>,
    policy: Arc<dyn PolicyEngine>,
    ledger: Arc<OperationLedger>,
    bus: Arc<NotificationBus>,
    gate: Arc<ApprovalGate>,
}

impl ToolDispatcher {
    pub fn new(
        policy: Arc<dyn PolicyEngine>,
        ledger: Arc<OperationLedger>,
        bus: Arc<NotificationBus>,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            session_id: SessionId::generate(),
            catalog: Arc::new(RwLock::new(Catalog::default())),
            policy,
            ledger,
            bus,
            gate,
        }
    }

    /// Session the policy engine classifies calls for.
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn ledger(&self) -> Arc<OperationLedger> {
        self.ledger.clone()
    }

    pub fn bus(&self) -> Arc<NotificationBus> {
        self.bus.clone()
    }

    pub fn gate(&self) -> Arc<ApprovalGate> {
        self.gate.clone()
    }

    /// Register a backend and route its capabilities to it.
    ///
    /// Re-registering the same backend id replaces its session.
    #[instrument(skip(self, backend), fields(backend = %backend.backend_id()))]
    pub async fn register_backend(&self, backend: Arc<dyn ToolBackend>) -> CoreResult<SessionInfo> {
        let backend_id = backend.backend_id();
        let capabilities = backend.capabilities().await?;
        let now = Utc::now();
        let info = SessionInfo {
            session_id: SessionId::generate(),
            backend_id: backend_id.clone(),
            capabilities: capabilities.clone(),
            connected: true,
            created_at: now,
            last_active_at: now,
        };

        {
            let mut catalog = self.catalog.write();
            catalog.routes.retain(|_, owner| *owner != backend_id);
            for capability in &capabilities {
                if let Some(previous) = catalog
                    .routes
                    .insert(capability.name.clone(), backend_id.clone())
                    && previous != backend_id
                {
                    debug!(capability = %capability.name, %previous, "capability taken over");
                }
            }
            catalog.sessions.insert(
                backend_id.clone(),
                BackendSession {
                    info: info.clone(),
                    handle: backend,
                },
            );
        }

        info!(capability_count = capabilities.len(), "backend registered");
        self.bus.publish(
            NotificationDraft::new(
                backend_id.as_str(),
                "backend-connected",
                NotificationPayload::BackendConnected {
                    backend_id: backend_id.clone(),
                    capability_count: capabilities.len(),
                },
            )
            .category(Category::system()),
        );
        Ok(info)
    }

    /// Mark a backend disconnected. Its routes stay so later calls report
    /// the backend as unavailable rather than unknown.
    pub fn disconnect(&self, backend_id: &BackendId) -> bool {
        let changed = {
            let mut catalog = self.catalog.write();
            match catalog.sessions.get_mut(backend_id) {
                Some(session) if session.info.connected => {
                    session.info.connected = false;
                    true
                }
                _ => false,
            }
        };
        if changed {
            info!(%backend_id, "backend disconnected");
            self.bus.publish(
                NotificationDraft::new(
                    backend_id.as_str(),
                    "backend-disconnected",
                    NotificationPayload::BackendDisconnected {
                        backend_id: backend_id.clone(),
                    },
                )
                .category(Category::system())
                .priority(Priority::High),
            );
        }
        changed
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.catalog
            .read()
            .sessions
            .values()
            .map(|session| session.info.clone())
            .collect()
    }

    /// Capabilities of connected backends, in registration order.
    pub fn list_capabilities(&self) -> Vec<ToolCapability> {
        let catalog = self.catalog.read();
        let routes = &catalog.routes;
        catalog
            .sessions
            .values()
            .filter(|session| session.info.connected)
            .flat_map(|session| {
                session.info.capabilities.iter().filter(move |capability| {
                    routes.get(&capability.name) == Some(&session.info.backend_id)
                })
            })
            .cloned()
            .collect()
    }

    fn route(&self, name: &str) -> CoreResult<(BackendId, Arc<dyn ToolBackend>)> {
        let catalog = self.catalog.read();
        let backend_id = catalog
            .routes
            .get(name)
            .ok_or_else(|| CoreError::CapabilityNotFound(name.to_owned()))?;
        match catalog.sessions.get(backend_id) {
            Some(session) if session.info.connected => {
                Ok((backend_id.clone(), session.handle.clone()))
            }
            _ => Err(CoreError::BackendUnavailable(backend_id.clone())),
        }
    }

    fn touch(&self, backend_id: &BackendId) {
        if let Some(session) = self.catalog.write().sessions.get_mut(backend_id) {
            session.info.last_active_at = Utc::now();
        }
    }

    /// Route and execute without policy, ledger or notifications.
    ///
    /// Backend errors are folded into error results.
    pub async fn execute_raw(&self, call: &ToolCall) -> CoreResult<(BackendId, ToolResult)> {
        let (backend_id, backend) = self.route(&call.name)?;
        let result = match backend.execute(call).await {
            Ok(result) => result,
            Err(error) => {
                warn!(%backend_id, tool = %call.name, %error, "backend execution failed");
                ToolResult::error(error.to_string())
            }
        };
        self.touch(&backend_id);
        Ok((backend_id, result))
    }

    #[instrument(skip(self, call), fields(session_id = %self.session_id, tool = %call.name, call_id = %call.call_id))]
    pub async fn invoke(&self, mut call: ToolCall) -> CoreResult<DispatchResult> {
        self.route(&call.name)?;

        let classification = self.policy.classify(&self.session_id, &call.name).await;
        if classification.requires_approval {
            let priority = match classification.risk {
                RiskLevel::High => Priority::High,
                RiskLevel::Medium | RiskLevel::Low => Priority::Normal,
            };
            let request = ApprovalRequest::new(
                ApprovalKind::Action,
                format!("Run {}", call.name),
                Value::Object(call.arguments.clone()),
            )
            .with_priority(priority);
            let outcome = self.gate.request_approval(request, None).await;
            match &outcome {
                ApprovalOutcome::Approved { .. } => {}
                ApprovalOutcome::Modified { payload, .. } => match payload {
                    Value::Object(arguments) => call.arguments = arguments.clone(),
                    other => {
                        return Err(CoreError::InvalidArguments(format!(
                            "approved arguments must be an object, got {other}"
                        )));
                    }
                },
                ApprovalOutcome::Denied { .. } | ApprovalOutcome::Cancelled { .. } => {
                    info!(outcome = outcome.label(), "tool call not approved");
                    return Ok(DispatchResult::NotApproved {
                        tool_name: call.name,
                        outcome,
                    });
                }
            }
        }

        let started = Instant::now();
        let (backend_id, result) = self.execute_raw(&call).await?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(duration_ms, is_error = result.is_error, "tool execution finished");

        let operation_id = classification
            .is_side_effecting()
            .then(|| self.record(&call, &result));

        self.bus.publish(
            NotificationDraft::new(
                backend_id.as_str(),
                "tool-executed",
                NotificationPayload::ToolExecuted {
                    call_id: call.call_id.clone(),
                    tool_name: call.name.clone(),
                    backend_id: backend_id.clone(),
                    is_error: result.is_error,
                    operation_id: operation_id.clone(),
                },
            )
            .category(Category::new(call.namespace()))
            .priority(if result.is_error {
                Priority::Critical
            } else {
                Priority::Normal
            }),
        );

        Ok(DispatchResult::Executed(ToolExecutionReport {
            call_id: call.call_id,
            tool_name: call.name,
            backend_id,
            result,
            operation_id,
            duration_ms,
        }))
    }

    fn record(&self, call: &ToolCall, result: &ToolResult) -> OperationId {
        let mut draft = OperationDraft::from_call(call);
        if let Some(before) = result.structured_field("before") {
            draft = draft.with_before(before.clone());
        }
        if let Some(after) = result.structured_field("after") {
            draft = draft.with_after(after.clone());
        }
        if let Some(inverse) = result.structured_field("inverse") {
            match serde_json::from_value::<InverseCall>(inverse.clone()) {
                Ok(inverse) => draft = draft.with_inverse(inverse),
                Err(error) => warn!(%error, "ignoring malformed inverse reported by backend"),
            }
        }
        if result.structured_field("undoable") == Some(&Value::Bool(false)) {
            draft = draft.non_undoable();
        }
        if result.is_error {
            draft = draft.failed();
        }

        let operation = self.ledger.record(draft);
        self.bus.publish(
            NotificationDraft::new(
                "ledger",
                "operation-recorded",
                NotificationPayload::OperationRecorded {
                    operation_id: operation.id.clone(),
                    kind: operation.kind.clone(),
                    status: operation.status,
                },
            )
            .category(Category::ledger())
            .priority(Priority::Low),
        );
        operation.id
    }
}

#[async_trait]
impl OperationExecutor for ToolDispatcher {
    async fn execute(&self, call: ToolCall) -> CoreResult<ToolResult> {
        let (_, result) = self.execute_raw(&call).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::grid::{DEFAULT_SHEET, InMemoryGridBackend};
    use serde_json::json;
    use sheetpilot_approval::{ApprovalMode, GateConfig};
    use sheetpilot_events::{BusConfig, NotificationFilter};
    use sheetpilot_ledger::LedgerConfig;
    use sheetpilot_policy::StaticPolicyEngine;
    use sheetpilot_protocol::{ApprovalResponse, ApprovalSurface, ApprovalTicket, OperationStatus};

    struct ScriptedSurface {
        response: ApprovalResponse,
        seen: Mutex<Vec<ApprovalTicket>>,
    }

    #[async_trait]
    impl ApprovalSurface for ScriptedSurface {
        async fn present(&self, ticket: ApprovalTicket) -> CoreResult<ApprovalResponse> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(ticket);
            }
            Ok(self.response.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolBackend for Failing {
        fn backend_id(&self) -> BackendId {
            BackendId::from("flaky")
        }

        async fn capabilities(&self) -> CoreResult<Vec<ToolCapability>> {
            Ok(vec![ToolCapability::new("flaky/write-value", "Write")])
        }

        async fn execute(&self, _call: &ToolCall) -> CoreResult<ToolResult> {
            Err(CoreError::Execution("connection reset".into()))
        }
    }

    fn dispatcher_with(gate: ApprovalGate) -> ToolDispatcher {
        ToolDispatcher::new(
            Arc::new(StaticPolicyEngine::default()),
            Arc::new(OperationLedger::new(LedgerConfig::default())),
            Arc::new(NotificationBus::new(BusConfig::default())),
            Arc::new(gate),
        )
    }

    async fn excel() -> anyhow::Result<(ToolDispatcher, Arc<InMemoryGridBackend>)> {
        let dispatcher = dispatcher_with(ApprovalGate::new(GateConfig {
            mode: ApprovalMode::AutoApprove,
            ..GateConfig::default()
        }));
        let grid = Arc::new(InMemoryGridBackend::new("excel", "excel"));
        dispatcher.register_backend(grid.clone()).await?;
        Ok((dispatcher, grid))
    }

    fn executed(result: DispatchResult) -> ToolExecutionReport {
        match result {
            DispatchResult::Executed(report) => report,
            DispatchResult::NotApproved { outcome, .. } => panic!("not approved: {outcome:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_namespace_is_capability_not_found() -> anyhow::Result<()> {
        let (dispatcher, _) = excel().await?;
        let err = dispatcher
            .invoke(ToolCall::from_value("ai/analyze-intent", json!({ "text": "sum" })))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CapabilityNotFound(name) if name == "ai/analyze-intent"));
        Ok(())
    }

    #[tokio::test]
    async fn disconnected_backend_is_unavailable() -> anyhow::Result<()> {
        let (dispatcher, _) = excel().await?;
        assert!(dispatcher.disconnect(&BackendId::from("excel")));
        assert!(!dispatcher.disconnect(&BackendId::from("excel")));
        assert!(dispatcher.list_capabilities().is_empty());

        let err = dispatcher
            .invoke(ToolCall::from_value("excel/read-range", json!({ "target": "A1" })))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BackendUnavailable(id) if id.as_str() == "excel"));
        Ok(())
    }

    #[tokio::test]
    async fn reads_are_not_recorded_and_writes_are() -> anyhow::Result<()> {
        let (dispatcher, _) = excel().await?;
        let read = executed(
            dispatcher
                .invoke(ToolCall::from_value("excel/read-range", json!({ "target": "A1" })))
                .await?,
        );
        assert!(read.operation_id.is_none());
        assert!(dispatcher.ledger().is_empty());

        let write = executed(
            dispatcher
                .invoke(ToolCall::from_value(
                    "excel/write-value",
                    json!({ "target": "A1", "value": 5 }),
                ))
                .await?,
        );
        let operation_id = write.operation_id.expect("write is recorded");
        let operation = dispatcher.ledger().operation(&operation_id)?;
        assert_eq!(operation.before, Some(json!("")));
        assert_eq!(operation.after, Some(json!(5)));
        assert_eq!(operation.status, OperationStatus::Completed);
        assert!(operation.inverse.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn failed_calls_are_recorded_as_failed() -> anyhow::Result<()> {
        let (dispatcher, grid) = excel().await?;
        grid.lock_cell(DEFAULT_SHEET, "A1");
        let report = executed(
            dispatcher
                .invoke(ToolCall::from_value(
                    "excel/write-value",
                    json!({ "target": "A1", "value": 1 }),
                ))
                .await?,
        );
        assert!(report.result.is_error);
        let operation = dispatcher
            .ledger()
            .operation(&report.operation_id.expect("recorded"))?;
        assert_eq!(operation.status, OperationStatus::Failed);
        assert!(!dispatcher.ledger().can_undo());
        Ok(())
    }

    #[tokio::test]
    async fn backend_errors_become_error_results() -> anyhow::Result<()> {
        let (dispatcher, _) = excel().await?;
        dispatcher.register_backend(Arc::new(Failing)).await?;
        let report = executed(
            dispatcher
                .invoke(ToolCall::from_value("flaky/write-value", json!({ "target": "A1" })))
                .await?,
        );
        assert!(report.result.is_error);
        assert!(
            report
                .result
                .error_text()
                .is_some_and(|text| text.contains("connection reset"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn denied_gated_call_is_not_executed() -> anyhow::Result<()> {
        let surface = Arc::new(ScriptedSurface {
            response: ApprovalResponse::deny("keep it"),
            seen: Mutex::new(Vec::new()),
        });
        let dispatcher = dispatcher_with(ApprovalGate::new(GateConfig::default()).with_surface(surface.clone()));
        let grid = Arc::new(InMemoryGridBackend::new("excel", "excel"));
        dispatcher.register_backend(grid.clone()).await?;
        dispatcher
            .invoke(ToolCall::from_value("excel/write-value", json!({ "target": "A1", "value": 1 })))
            .await?;

        let result = dispatcher
            .invoke(ToolCall::from_value("excel/clear-range", json!({ "target": "A1" })))
            .await?;
        assert!(matches!(
            result,
            DispatchResult::NotApproved { outcome: ApprovalOutcome::Denied { .. }, .. }
        ));
        assert_eq!(grid.value(DEFAULT_SHEET, "A1"), Some(json!(1)));
        assert_eq!(dispatcher.ledger().len(), 1);

        let seen = surface.seen.lock().map(|seen| seen.len()).unwrap_or_default();
        assert_eq!(seen, 1);
        Ok(())
    }

    #[tokio::test]
    async fn modified_approval_replaces_arguments() -> anyhow::Result<()> {
        let surface = Arc::new(ScriptedSurface {
            response: ApprovalResponse::approve_with(json!({ "target": "B1" })),
            seen: Mutex::new(Vec::new()),
        });
        let dispatcher = dispatcher_with(ApprovalGate::new(GateConfig::default()).with_surface(surface));
        let grid = Arc::new(InMemoryGridBackend::new("excel", "excel"));
        dispatcher.register_backend(grid.clone()).await?;
        for target in ["A1", "B1"] {
            dispatcher
                .invoke(ToolCall::from_value("excel/write-value", json!({ "target": target, "value": 1 })))
                .await?;
        }

        executed(
            dispatcher
                .invoke(ToolCall::from_value("excel/clear-range", json!({ "target": "A1" })))
                .await?,
        );
        assert_eq!(grid.value(DEFAULT_SHEET, "A1"), Some(json!(1)));
        assert_eq!(grid.value(DEFAULT_SHEET, "B1"), None);
        Ok(())
    }

    #[tokio::test]
    async fn tool_executed_notification_uses_namespace_and_priority() -> anyhow::Result<()> {
        let (dispatcher, grid) = excel().await?;
        grid.lock_cell(DEFAULT_SHEET, "C3");
        dispatcher
            .invoke(ToolCall::from_value("excel/read-range", json!({ "target": "A1" })))
            .await?;
        dispatcher
            .invoke(ToolCall::from_value("excel/write-value", json!({ "target": "C3", "value": 1 })))
            .await?;

        let executed = dispatcher
            .bus()
            .query(&NotificationFilter::all().event("tool-executed"));
        assert_eq!(executed.len(), 2);
        assert!(executed.iter().all(|n| n.category.as_str() == "excel"));
        assert!(executed.iter().all(|n| n.source == "excel"));
        assert_eq!(executed[0].priority, Priority::Normal);
        assert_eq!(executed[1].priority, Priority::Critical);
        Ok(())
    }

    #[tokio::test]
    async fn dispatcher_replays_undo_and_redo() -> anyhow::Result<()> {
        let (dispatcher, grid) = excel().await?;
        dispatcher
            .invoke(ToolCall::from_value("excel/write-value", json!({ "target": "A1", "value": 5 })))
            .await?;
        let ledger = dispatcher.ledger();

        assert!(ledger.undo_last(&dispatcher).await?.is_some());
        assert_eq!(grid.value(DEFAULT_SHEET, "A1"), None);
        assert!(ledger.redo_last(&dispatcher).await?.is_some());
        assert_eq!(grid.value(DEFAULT_SHEET, "A1"), Some(json!(5)));
        Ok(())
    }

    #[tokio::test]
    async fn reregistration_moves_capability_ownership() -> anyhow::Result<()> {
        let (dispatcher, _) = excel().await?;
        let other = Arc::new(InMemoryGridBackend::new("excel-2", "excel"));
        dispatcher.register_backend(other.clone()).await?;

        dispatcher
            .invoke(ToolCall::from_value("excel/write-value", json!({ "target": "A1", "value": 9 })))
            .await?;
        assert_eq!(other.value(DEFAULT_SHEET, "A1"), Some(json!(9)));
        assert_eq!(dispatcher.sessions().len(), 2);
        assert_eq!(dispatcher.list_capabilities().len(), 10);
        Ok(())
    }
}
