//! # sheetpilot-protocol: shared contract for the orchestration core
//!
//! This crate defines the value types, wire envelope, error taxonomy, and
//! collaborator ports that every other sheetpilot crate depends on.
//!
//! It is intentionally dependency-light (no tokio, no axum) so it can be used
//! as a pure contract crate by backends living outside this workspace.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (SessionId, BackendId, OperationId, ...)
//! - [`tool`]: ToolCapability, ToolCall, ToolResult
//! - [`operation`]: Operation, OperationKind, OperationBatch, InverseCall
//! - [`notification`]: Notification, Priority, Category, NotificationPayload
//! - [`approval`]: ApprovalRequest, ApprovalResponse, ApprovalTicket, ApprovalOutcome
//! - [`envelope`]: Request / Response / Notification envelope and error codes
//! - [`ports`]: Collaborator boundaries (tool backends, approval surface, storage, replay)
//! - [`error`]: CoreError, CoreResult

pub mod approval;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod notification;
pub mod operation;
pub mod ports;
pub mod tool;

// Re-export the most commonly used types at the crate root.
pub use approval::{
    ApprovalKind, ApprovalOutcome, ApprovalRequest, ApprovalResponse, ApprovalTicket,
};
pub use envelope::{
    Envelope, ErrorCode, JSONRPC_VERSION, NotificationMessage, RequestId, RequestMessage,
    ResponseMessage, ResponsePayload, RpcError,
};
pub use error::{CoreError, CoreResult};
pub use ids::{
    ApprovalId, BackendId, BatchId, CallId, NotificationId, OperationId, SessionId,
    SubscriptionId,
};
pub use notification::{
    Category, Notification, NotificationAction, NotificationDraft, NotificationPayload, Priority,
};
pub use operation::{
    BatchStatus, InverseCall, Operation, OperationBatch, OperationDraft, OperationKind,
    OperationStatus,
};
pub use ports::{ApprovalSurface, KeyValueStore, OperationExecutor, ToolBackend};
pub use tool::{ContentItem, ToolCall, ToolCapability, ToolResult};
