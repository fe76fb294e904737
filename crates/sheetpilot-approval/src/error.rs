use sheetpilot_protocol::CoreError;
use thiserror::Error;

use crate::schema::FieldError;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("input validation failed: {}", join_errors(.0))]
    Validation(Vec<FieldError>),
    #[error("elicitation response is not an object")]
    MalformedInput,
    #[error(transparent)]
    Core(#[from] CoreError),
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ApprovalError> for CoreError {
    fn from(error: ApprovalError) -> Self {
        match error {
            ApprovalError::Core(core) => core,
            other => CoreError::InvalidArguments(other.to_string()),
        }
    }
}

pub type ApprovalResult<T> = Result<T, ApprovalError>;
