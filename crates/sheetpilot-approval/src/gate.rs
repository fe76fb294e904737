use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sheetpilot_protocol::{
    ApprovalId, ApprovalKind, ApprovalOutcome, ApprovalRequest, ApprovalResponse,
    ApprovalSurface, ApprovalTicket, CoreResult,
};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::error::{ApprovalError, ApprovalResult};
use crate::schema::InputSchema;

/// Whether requests reach a human. Auto-approval must be chosen explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Interactive,
    AutoApprove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub mode: ApprovalMode,
    /// Deadline applied when a request does not carry its own; `None` waits
    /// indefinitely.
    pub default_timeout_ms: Option<u64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::Interactive,
            default_timeout_ms: Some(300_000),
        }
    }
}

/// Lifecycle events of approval tickets.
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    Requested(ApprovalTicket),
    Resolved {
        approval_id: ApprovalId,
        outcome: ApprovalOutcome,
    },
}

/// Result of an elicitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ElicitationOutcome {
    Data { data: Map<String, Value> },
    Cancelled { reason: String },
}

enum Resolution {
    Response(ApprovalResponse),
    Cancelled(String),
}

struct Waiter {
    ticket: ApprovalTicket,
    resolved: Arc<AtomicBool>,
    sender: oneshot::Sender<Resolution>,
}

enum Race {
    External(Result<Resolution, oneshot::error::RecvError>),
    Deadline,
    Presented(CoreResult<ApprovalResponse>),
}

/// Drops the waiter if the requesting future is abandoned mid-wait.
struct PendingGuard<'a> {
    gate: &'a ApprovalGate,
    approval_id: ApprovalId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.gate.pending.lock().remove(&self.approval_id);
    }
}

/// Correlates approval requests with their single resolution.
///
/// Each request gets a pending waiter keyed by a fresh id. The waiter is
/// settled by the approval surface, by an external [`resolve`](Self::resolve)
/// or [`cancel`](Self::cancel), or by the deadline, whichever comes first.
/// Later attempts are no-ops.
pub struct ApprovalGate {
    config: GateConfig,
    surface: Option<Arc<dyn ApprovalSurface>>,
    pending: Mutex<HashMap<ApprovalId, Waiter>>,
    events: broadcast::Sender<GateEvent>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("config", &self.config)
            .field("surface", &self.surface.is_some())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl ApprovalGate {
    pub fn new(config: GateConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            surface: None,
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn with_surface(mut self, surface: Arc<dyn ApprovalSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn mode(&self) -> ApprovalMode {
        self.config.mode
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.events.subscribe()
    }

    /// Outstanding tickets, oldest first.
    pub fn pending(&self) -> Vec<ApprovalTicket> {
        let mut tickets: Vec<_> = self
            .pending
            .lock()
            .values()
            .map(|waiter| waiter.ticket.clone())
            .collect();
        tickets.sort_by_key(|ticket| ticket.created_at);
        tickets
    }

    /// Ask for approval and suspend until resolved or timed out.
    #[instrument(skip(self, request), fields(kind = ?request.kind, title = %request.title))]
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
        timeout: Option<Duration>,
    ) -> ApprovalOutcome {
        if self.config.mode == ApprovalMode::AutoApprove {
            debug!("auto-approving request");
            return ApprovalOutcome::Approved {
                payload: request.payload,
            };
        }

        let timeout = timeout.or(self.config.default_timeout_ms.map(Duration::from_millis));
        let created_at = Utc::now();
        let ticket = ApprovalTicket {
            approval_id: ApprovalId::generate(),
            deadline: timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .map(|t| created_at + t),
            request,
            created_at,
        };
        let approval_id = ticket.approval_id.clone();
        let original = ticket.request.payload.clone();

        if timeout == Some(Duration::ZERO) {
            info!(%approval_id, "approval deadline already elapsed");
            return ApprovalOutcome::timeout();
        }

        let (sender, mut receiver) = oneshot::channel();
        self.pending.lock().insert(
            approval_id.clone(),
            Waiter {
                ticket: ticket.clone(),
                resolved: Arc::new(AtomicBool::new(false)),
                sender,
            },
        );
        let _pending = PendingGuard {
            gate: self,
            approval_id: approval_id.clone(),
        };
        let _ = self.events.send(GateEvent::Requested(ticket.clone()));
        debug!(%approval_id, "approval pending");

        let surface = self.surface.clone();
        let presentation = async move {
            match surface {
                Some(surface) => surface.present(ticket).await,
                None => std::future::pending().await,
            }
        };
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let race = tokio::select! {
            biased;
            external = &mut receiver => Race::External(external),
            () = deadline => Race::Deadline,
            presented = presentation => Race::Presented(presented),
        };

        let outcome = match race {
            Race::External(resolution) => Self::interpret(&original, resolution),
            Race::Deadline => {
                if self.claim(&approval_id).is_some() {
                    ApprovalOutcome::timeout()
                } else {
                    Self::interpret(&original, receiver.await)
                }
            }
            Race::Presented(presented) => {
                if self.claim(&approval_id).is_some() {
                    match presented {
                        Ok(response) => ApprovalOutcome::from_response(&original, response),
                        Err(error) => {
                            warn!(%approval_id, %error, "approval surface failed");
                            ApprovalOutcome::Cancelled {
                                reason: format!("approval surface failed: {error}"),
                            }
                        }
                    }
                } else {
                    Self::interpret(&original, receiver.await)
                }
            }
        };

        info!(%approval_id, outcome = outcome.label(), "approval resolved");
        let _ = self.events.send(GateEvent::Resolved {
            approval_id,
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Settle a pending request from outside (a UI, an HTTP call).
    /// Returns false for unknown, expired or already-settled ids.
    pub fn resolve(&self, approval_id: &ApprovalId, response: ApprovalResponse) -> bool {
        self.settle(approval_id, Resolution::Response(response))
    }

    pub fn cancel(&self, approval_id: &ApprovalId, reason: impl Into<String>) -> bool {
        self.settle(approval_id, Resolution::Cancelled(reason.into()))
    }

    fn settle(&self, approval_id: &ApprovalId, resolution: Resolution) -> bool {
        let Some(sender) = self.claim(approval_id) else {
            debug!(%approval_id, "ignoring stale approval resolution");
            return false;
        };
        sender.send(resolution).is_ok()
    }

    /// Take the waiter out of the pending map and flip its resolved flag.
    /// Exactly one caller wins.
    fn claim(&self, approval_id: &ApprovalId) -> Option<oneshot::Sender<Resolution>> {
        let waiter = self.pending.lock().remove(approval_id)?;
        if waiter.resolved.swap(true, Ordering::SeqCst) || waiter.sender.is_closed() {
            return None;
        }
        Some(waiter.sender)
    }

    fn interpret(
        original: &Value,
        resolution: Result<Resolution, oneshot::error::RecvError>,
    ) -> ApprovalOutcome {
        match resolution {
            Ok(Resolution::Response(response)) => ApprovalOutcome::from_response(original, response),
            Ok(Resolution::Cancelled(reason)) => ApprovalOutcome::Cancelled { reason },
            Err(_) => ApprovalOutcome::Cancelled {
                reason: "approval waiter dropped".to_owned(),
            },
        }
    }

    /// Request structured input from a human and validate it against `schema`.
    #[instrument(skip(self, schema, message))]
    pub async fn request_input(
        &self,
        schema: &InputSchema,
        message: impl Into<String>,
        timeout: Option<Duration>,
    ) -> ApprovalResult<ElicitationOutcome> {
        let message = message.into();
        let payload = json!({ "message": message, "schema": schema, "data": {} });
        let request = ApprovalRequest::new(ApprovalKind::Elicitation, message, payload);

        let outcome = self.request_approval(request, timeout).await;
        let data = match outcome {
            ApprovalOutcome::Modified { payload, .. } => payload,
            ApprovalOutcome::Approved { payload } => payload.get("data").cloned().unwrap_or_default(),
            ApprovalOutcome::Denied { reason } => {
                return Ok(ElicitationOutcome::Cancelled {
                    reason: reason.unwrap_or_else(|| "declined".to_owned()),
                });
            }
            ApprovalOutcome::Cancelled { reason } => {
                return Ok(ElicitationOutcome::Cancelled { reason });
            }
        };
        let Value::Object(data) = data else {
            return Err(ApprovalError::MalformedInput);
        };
        schema.validate(&data).map_err(ApprovalError::Validation)?;
        Ok(ElicitationOutcome::Data { data })
    }
}
