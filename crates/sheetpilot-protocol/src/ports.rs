//! Collaborator ports of the orchestration core.
//!
//! These traits are the only boundary between the core and the outside:
//! tool backends, the human approval surface, key/value persistence, and the
//! executor the ledger uses to replay inverse and original calls.
//!
//! Object-safety note: traits use `async-trait` for async dyn-dispatch.

use crate::approval::{ApprovalResponse, ApprovalTicket};
use crate::error::CoreResult;
use crate::ids::BackendId;
use crate::tool::{ToolCall, ToolCapability, ToolResult};
use async_trait::async_trait;
use serde_json::Value;

/// A tool backend: owns a set of capabilities and executes calls to them.
///
/// Returning `Err` and returning a result with `is_error` are both execution
/// failures; the dispatcher folds the former into the latter.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    fn backend_id(&self) -> BackendId;

    /// Capabilities announced at registration.
    async fn capabilities(&self) -> CoreResult<Vec<ToolCapability>>;

    async fn execute(&self, call: &ToolCall) -> CoreResult<ToolResult>;
}

/// The external surface that shows approval and elicitation requests to a
/// human (a UI, a CLI prompt, an auto-approval stub).
#[async_trait]
pub trait ApprovalSurface: Send + Sync {
    async fn present(&self, ticket: ApprovalTicket) -> CoreResult<ApprovalResponse>;
}

/// Injectable key/value persistence.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> CoreResult<()>;
    async fn delete(&self, key: &str) -> CoreResult<bool>;
    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> CoreResult<Vec<String>>;
}

/// Executes a ledger replay (an inverse on undo, the original call on redo).
///
/// An `Ok` result with `is_error` set counts as a failed replay.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, call: ToolCall) -> CoreResult<ToolResult>;
}
