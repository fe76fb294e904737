//! Error types for the orchestration core.

use crate::envelope::{ErrorCode, RpcError};
use crate::ids::{BackendId, OperationId};
use thiserror::Error;

/// Errors surfaced by routing, protocol handling, and collaborator ports.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("session not initialized")]
    NotInitialized,
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(BackendId),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("operation {operation_id} failed: {message}")]
    Operation {
        operation_id: OperationId,
        message: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound,
            Self::InvalidArguments(_) => ErrorCode::InvalidArguments,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::CapabilityNotFound(_) => ErrorCode::CapabilityNotFound,
            Self::BackendUnavailable(_) => ErrorCode::BackendUnavailable,
            Self::Operation { .. } => ErrorCode::LedgerError,
            Self::Execution(_) | Self::Storage(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        RpcError::new(self.code(), self.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
