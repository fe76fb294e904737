//! JSON-RPC method routing for a session context.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use sheetpilot_events::NotificationFilter;
use sheetpilot_protocol::{
    ApprovalId, ApprovalResponse, BatchId, CoreError, Envelope, ErrorCode, NotificationId,
    Priority, ResponseMessage, RpcError, ToolCall,
};
use sheetpilot_tools::DispatchResult;
use tracing::{debug, instrument};

use crate::context::SessionContext;

pub const SERVER_NAME: &str = "sheetpilot";
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

type Params = Map<String, Value>;
type MethodResult = Result<Value, RpcError>;

fn invalid(message: impl Into<String>) -> RpcError {
    RpcError::new(ErrorCode::InvalidArguments, message)
}

fn optional<T: DeserializeOwned>(params: &Params, key: &str) -> Result<Option<T>, RpcError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|error| invalid(format!("`{key}`: {error}"))),
    }
}

fn required<T: DeserializeOwned>(params: &Params, key: &str) -> Result<T, RpcError> {
    optional(params, key)?.ok_or_else(|| invalid(format!("missing parameter `{key}`")))
}

fn to_value<T: serde::Serialize>(value: &T) -> MethodResult {
    serde_json::to_value(value).map_err(|error| CoreError::from(error).to_rpc_error())
}

impl SessionContext {
    /// Route one envelope. Requests get exactly one response; notifications
    /// and stray responses get none.
    #[instrument(skip(self, envelope), fields(session_id = %self.session_id(), method = envelope.method()))]
    pub async fn handle_envelope(&self, envelope: Envelope) -> Option<Envelope> {
        match envelope {
            Envelope::Request(request) => {
                let response = match self.dispatch(&request.method, &request.params).await {
                    Ok(result) => ResponseMessage::result(request.id, result),
                    Err(error) => {
                        debug!(code = error.code, message = %error.message, "request failed");
                        ResponseMessage::error(request.id, error)
                    }
                };
                Some(Envelope::Response(response))
            }
            Envelope::Notification(notification) => {
                let params = notification.params.unwrap_or_default();
                if let Err(error) = self.dispatch(&notification.method, &params).await {
                    debug!(code = error.code, message = %error.message, "notification dropped");
                }
                None
            }
            Envelope::Response(response) => {
                debug!(id = %response.id, "ignoring unsolicited response");
                None
            }
        }
    }

    async fn dispatch(&self, method: &str, params: &Params) -> MethodResult {
        if method == "initialize" {
            return self.initialize();
        }
        if !self.is_initialized() {
            return Err(CoreError::NotInitialized.to_rpc_error());
        }

        match method {
            "notifications/initialized" => Ok(Value::Null),
            "tools/list" => Ok(json!({ "tools": self.capabilities() })),
            "tools/call" => self.tools_call(params).await,
            "ledger/undo" => {
                let undone = self.undo().await.map_err(|e| e.to_rpc_error())?;
                Ok(json!({ "undone": undone }))
            }
            "ledger/redo" => {
                let redone = self.redo().await.map_err(|e| e.to_rpc_error())?;
                Ok(json!({ "redone": redone }))
            }
            "ledger/undoBatch" => {
                let batch_id: BatchId = required(params, "batchId")?;
                let report = self.undo_batch(&batch_id).await.map_err(|e| e.to_rpc_error())?;
                to_value(&report)
            }
            "ledger/startBatch" => {
                let description: Option<String> = optional(params, "description")?;
                let batch_id = self
                    .start_batch(description.unwrap_or_default())
                    .await
                    .map_err(|e| e.to_rpc_error())?;
                Ok(json!({ "batchId": batch_id }))
            }
            "ledger/endBatch" => Ok(json!({ "batchId": self.end_batch().await })),
            "ledger/history" => {
                let limit: Option<usize> = optional(params, "limit")?;
                let ledger = self.ledger();
                Ok(json!({
                    "operations": self.history(limit.unwrap_or(DEFAULT_HISTORY_LIMIT)),
                    "canUndo": ledger.can_undo(),
                    "canRedo": ledger.can_redo(),
                }))
            }
            "notifications/list" => {
                let filter = Self::notification_filter(params)?;
                Ok(json!({
                    "notifications": self.notifications(&filter),
                    "unread": self.bus().unread_count(),
                }))
            }
            "notifications/markRead" => {
                let marked = match optional::<NotificationId>(params, "id")? {
                    Some(id) => usize::from(self.mark_read(&id)),
                    None => self.bus().mark_all_read(),
                };
                Ok(json!({ "marked": marked }))
            }
            "approvals/list" => Ok(json!({ "approvals": self.pending_approvals() })),
            "approvals/resolve" => {
                let approval_id: ApprovalId = required(params, "approvalId")?;
                let approved: bool = required(params, "approved")?;
                let reason: Option<String> = optional(params, "reason")?;
                let payload: Option<Value> = optional(params, "payload")?;
                let response = ApprovalResponse {
                    approved,
                    payload,
                    reason,
                };
                Ok(json!({ "resolved": self.resolve_approval(&approval_id, response) }))
            }
            other => Err(CoreError::MethodNotFound(other.to_owned()).to_rpc_error()),
        }
    }

    fn initialize(&self) -> MethodResult {
        if !self.mark_initialized() {
            debug!("session re-initialized");
        }
        Ok(json!({
            "sessionId": self.session_id(),
            "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
            "capabilities": {
                "tools": self.capabilities().len(),
                "ledger": true,
                "approvals": true,
            },
        }))
    }

    async fn tools_call(&self, params: &Params) -> MethodResult {
        let name: String = required(params, "name")?;
        let arguments: Option<Map<String, Value>> = optional(params, "arguments")?;
        let call = ToolCall::new(name, arguments.unwrap_or_default());

        match self.invoke(call).await.map_err(|e| e.to_rpc_error())? {
            DispatchResult::Executed(report) => to_value(&report),
            DispatchResult::NotApproved { tool_name, outcome } => Err(RpcError::new(
                ErrorCode::NotApproved,
                format!("{tool_name} was not approved ({})", outcome.label()),
            )
            .with_data(to_value(&outcome)?)),
        }
    }

    fn notification_filter(params: &Params) -> Result<NotificationFilter, RpcError> {
        let mut filter = NotificationFilter::all();
        if let Some(source) = optional::<String>(params, "source")? {
            filter = filter.source(source);
        }
        if let Some(event) = optional::<String>(params, "event")? {
            filter = filter.event(&event);
        }
        if let Some(category) = optional::<String>(params, "category")? {
            filter = filter.category(category.as_str());
        }
        if let Some(priority) = optional::<Priority>(params, "priority")? {
            filter = filter.priority(priority);
        }
        if optional::<bool>(params, "unreadOnly")?.unwrap_or(false) {
            filter = filter.unread_only();
        }
        Ok(filter)
    }
}
