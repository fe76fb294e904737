//! Notification types published on the bus.

use crate::approval::ApprovalKind;
use crate::ids::{ApprovalId, BackendId, BatchId, CallId, NotificationId, OperationId};
use crate::operation::{OperationKind, OperationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Notification category. Tool notifications use the capability namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn error() -> Self {
        Self::new("error")
    }

    pub fn system() -> Self {
        Self::new("system")
    }

    pub fn ledger() -> Self {
        Self::new("ledger")
    }

    pub fn approval() -> Self {
        Self::new("approval")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_error(&self) -> bool {
        self.0 == "error"
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Category {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Typed payload of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationPayload {
    ToolExecuted {
        call_id: CallId,
        tool_name: String,
        backend_id: BackendId,
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation_id: Option<OperationId>,
    },
    OperationRecorded {
        operation_id: OperationId,
        kind: OperationKind,
        status: OperationStatus,
    },
    OperationUndone {
        operation_id: OperationId,
    },
    OperationRedone {
        operation_id: OperationId,
    },
    BatchUndone {
        batch_id: BatchId,
        undone: Vec<OperationId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocked: Option<OperationId>,
    },
    ApprovalRequested {
        approval_id: ApprovalId,
        kind: ApprovalKind,
        title: String,
    },
    ApprovalResolved {
        approval_id: ApprovalId,
        outcome: String,
    },
    BackendConnected {
        backend_id: BackendId,
        capability_count: usize,
    },
    BackendDisconnected {
        backend_id: BackendId,
    },
    Custom {
        #[serde(default)]
        data: Value,
    },
}

impl NotificationPayload {
    /// Human-readable one-line rendering.
    pub fn render(&self) -> String {
        match self {
            Self::ToolExecuted {
                tool_name,
                backend_id,
                is_error,
                ..
            } => {
                if *is_error {
                    format!("{tool_name} failed on {backend_id}")
                } else {
                    format!("{tool_name} completed on {backend_id}")
                }
            }
            Self::OperationRecorded {
                operation_id,
                kind,
                status,
            } => format!("recorded {kind} operation {operation_id} ({status:?})"),
            Self::OperationUndone { operation_id } => format!("undid operation {operation_id}"),
            Self::OperationRedone { operation_id } => format!("redid operation {operation_id}"),
            Self::BatchUndone {
                batch_id,
                undone,
                blocked,
            } => match blocked {
                Some(blocked) => format!(
                    "batch {batch_id} partially undone ({} operations), blocked at {blocked}",
                    undone.len()
                ),
                None => format!("batch {batch_id} undone ({} operations)", undone.len()),
            },
            Self::ApprovalRequested { title, .. } => format!("approval requested: {title}"),
            Self::ApprovalResolved {
                approval_id,
                outcome,
            } => format!("approval {approval_id} {outcome}"),
            Self::BackendConnected {
                backend_id,
                capability_count,
            } => format!("backend {backend_id} connected with {capability_count} capabilities"),
            Self::BackendDisconnected { backend_id } => {
                format!("backend {backend_id} disconnected")
            }
            Self::Custom { data } => data.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub id: String,
    pub label: String,
}

/// A filtered, fan-out event describing a state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub source: String,
    pub event: String,
    pub category: Category,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub payload: NotificationPayload,
    pub read: bool,
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_dismiss_ms: Option<u64>,
    #[serde(default)]
    pub actions: Vec<NotificationAction>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Materialize a draft. Critical and error-category notifications are
    /// persistent unless the draft says otherwise.
    pub fn from_draft(draft: NotificationDraft, created_at: DateTime<Utc>) -> Self {
        let persistent = draft
            .persistent
            .unwrap_or(draft.priority == Priority::Critical || draft.category.is_error());
        let message = draft.message.unwrap_or_else(|| draft.payload.render());
        Self {
            id: NotificationId::generate(),
            source: draft.source,
            title: draft.title.unwrap_or_else(|| draft.event.clone()),
            event: draft.event,
            category: draft.category,
            priority: draft.priority,
            message,
            payload: draft.payload,
            read: false,
            persistent,
            auto_dismiss_ms: draft.auto_dismiss_ms,
            actions: draft.actions,
            created_at,
        }
    }

    /// Whether the auto-dismiss delay has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.auto_dismiss_ms.is_some_and(|delay| {
            let elapsed = now.signed_duration_since(self.created_at);
            elapsed.num_milliseconds() >= i64::try_from(delay).unwrap_or(i64::MAX)
        })
    }
}

/// What a publisher hands to the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    pub source: String,
    pub event: String,
    pub category: Category,
    pub priority: Priority,
    pub title: Option<String>,
    pub message: Option<String>,
    pub payload: NotificationPayload,
    pub persistent: Option<bool>,
    pub auto_dismiss_ms: Option<u64>,
    pub actions: Vec<NotificationAction>,
}

impl NotificationDraft {
    pub fn new(
        source: impl Into<String>,
        event: impl Into<String>,
        payload: NotificationPayload,
    ) -> Self {
        Self {
            source: source.into(),
            event: event.into(),
            category: Category::system(),
            priority: Priority::Normal,
            title: None,
            message: None,
            payload,
            persistent: None,
            auto_dismiss_ms: None,
            actions: Vec::new(),
        }
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn auto_dismiss_ms(mut self, delay_ms: u64) -> Self {
        self.auto_dismiss_ms = Some(delay_ms);
        self
    }

    pub fn action(mut self, id: impl Into<String>, label: impl Into<String>) -> Self {
        self.actions.push(NotificationAction {
            id: id.into(),
            label: label.into(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn custom() -> NotificationPayload {
        NotificationPayload::Custom {
            data: serde_json::json!({ "k": 1 }),
        }
    }

    #[test]
    fn critical_and_error_notifications_are_persistent() {
        let now = Utc::now();
        let critical = Notification::from_draft(
            NotificationDraft::new("test", "boom", custom()).priority(Priority::Critical),
            now,
        );
        assert!(critical.persistent);

        let error = Notification::from_draft(
            NotificationDraft::new("test", "boom", custom()).category(Category::error()),
            now,
        );
        assert!(error.persistent);

        let normal = Notification::from_draft(NotificationDraft::new("test", "ok", custom()), now);
        assert!(!normal.persistent);
        assert_eq!(normal.title, "ok");
    }

    #[test]
    fn explicit_persistence_overrides_policy() {
        let n = Notification::from_draft(
            NotificationDraft::new("test", "boom", custom())
                .priority(Priority::Critical)
                .persistent(false),
            Utc::now(),
        );
        assert!(!n.persistent);
    }

    #[test]
    fn auto_dismiss_expiry() {
        let created = Utc::now();
        let n = Notification::from_draft(
            NotificationDraft::new("test", "toast", custom()).auto_dismiss_ms(500),
            created,
        );
        assert!(!n.is_expired(created + Duration::milliseconds(100)));
        assert!(n.is_expired(created + Duration::milliseconds(500)));
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn payload_renders_tool_failure() {
        let payload = NotificationPayload::ToolExecuted {
            call_id: CallId::from("c1"),
            tool_name: "excel/write-value".into(),
            backend_id: BackendId::from("excel"),
            is_error: true,
            operation_id: None,
        };
        assert_eq!(payload.render(), "excel/write-value failed on excel");
    }
}
