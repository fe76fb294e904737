use sheetpilot_protocol::{BatchId, CoreError, OperationId, OperationKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no inverse defined for operation {operation_id} ({kind})")]
    NoInverseDefined {
        operation_id: OperationId,
        kind: OperationKind,
    },
    #[error("inverse of operation {operation_id} failed: {message}")]
    InverseFailed {
        operation_id: OperationId,
        message: String,
    },
    #[error("redo of operation {operation_id} failed: {message}")]
    RedoFailed {
        operation_id: OperationId,
        message: String,
    },
    #[error("undo of batch {batch_id} stopped at operation {operation_id}: {reason}")]
    BatchIncomplete {
        batch_id: BatchId,
        operation_id: OperationId,
        reason: String,
    },
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),
    #[error("batch {0} is still open")]
    BatchStillOpen(BatchId),
    #[error("batch {0} is already open")]
    BatchAlreadyOpen(BatchId),
    #[error("batch {0} is already undone")]
    BatchAlreadyUndone(BatchId),
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),
}

impl LedgerError {
    /// The operation the error is about, if any.
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            Self::NoInverseDefined { operation_id, .. }
            | Self::InverseFailed { operation_id, .. }
            | Self::RedoFailed { operation_id, .. }
            | Self::BatchIncomplete { operation_id, .. }
            | Self::OperationNotFound(operation_id) => Some(operation_id),
            Self::BatchNotFound(_)
            | Self::BatchStillOpen(_)
            | Self::BatchAlreadyOpen(_)
            | Self::BatchAlreadyUndone(_) => None,
        }
    }
}

impl From<LedgerError> for CoreError {
    fn from(error: LedgerError) -> Self {
        match error.operation_id().cloned() {
            Some(operation_id) => CoreError::Operation {
                operation_id,
                message: error.to_string(),
            },
            None => CoreError::InvalidArguments(error.to_string()),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
