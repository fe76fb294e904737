//! Human-in-the-loop approval types.

use crate::ids::ApprovalId;
use crate::notification::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the human is being asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// A risk-bearing tool call.
    Action,
    /// A proposed generative call, before it runs.
    SamplingRequest,
    /// A generated result, before it is returned.
    SamplingResult,
    /// Missing structured input; the payload carries the schema.
    Elicitation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub kind: ApprovalKind,
    pub title: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl ApprovalRequest {
    pub fn new(kind: ApprovalKind, title: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            title: title.into(),
            payload,
            model_hint: None,
            priority: None,
        }
    }

    pub fn with_model_hint(mut self, model: impl Into<String>) -> Self {
        self.model_hint = Some(model.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// The surface's answer. `payload`, when present, replaces the request payload
/// (a modification for approvals, the entered data for elicitation).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            ..Self::default()
        }
    }

    pub fn approve_with(payload: Value) -> Self {
        Self {
            approved: true,
            payload: Some(payload),
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            payload: None,
            reason: Some(reason.into()),
        }
    }
}

/// An outstanding request as handed to the approval surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub approval_id: ApprovalId,
    pub request: ApprovalRequest,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

/// How an approval request ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved {
        payload: Value,
    },
    Modified {
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Denied {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Cancelled {
        reason: String,
    },
}

impl ApprovalOutcome {
    pub const TIMEOUT: &'static str = "timeout";

    pub fn timeout() -> Self {
        Self::Cancelled {
            reason: Self::TIMEOUT.to_owned(),
        }
    }

    /// Interpret a surface response against the original payload.
    pub fn from_response(original: &Value, response: ApprovalResponse) -> Self {
        match (response.approved, response.payload) {
            (false, _) => Self::Denied {
                reason: response.reason,
            },
            (true, Some(payload)) if payload != *original => Self::Modified {
                payload,
                reason: response.reason,
            },
            (true, _) => Self::Approved {
                payload: original.clone(),
            },
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. } | Self::Modified { .. })
    }

    /// The payload to proceed with, if approved.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Approved { payload } | Self::Modified { payload, .. } => Some(payload),
            Self::Denied { .. } | Self::Cancelled { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Approved { .. } => "approved",
            Self::Modified { .. } => "modified",
            Self::Denied { .. } => "denied",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Approved { .. } => None,
            Self::Modified { reason, .. } | Self::Denied { reason } => reason.as_deref(),
            Self::Cancelled { reason } => Some(reason),
        }
    }
}
