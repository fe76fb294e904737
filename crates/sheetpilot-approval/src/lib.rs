//! Human-in-the-loop approval gate.
//!
//! Actions, sampling requests, sampling results and elicitations all go
//! through one correlation mechanism: a pending waiter per request, settled
//! once by the approval surface, an external resolution, or the deadline.

pub mod error;
pub mod gate;
pub mod sampling;
pub mod schema;

pub use error::{ApprovalError, ApprovalResult};
pub use gate::{ApprovalGate, ApprovalMode, ElicitationOutcome, GateConfig, GateEvent};
pub use sampling::{SamplingFlow, SamplingOutcome, SamplingStage};
pub use schema::{FieldError, FieldSchema, FieldType, InputSchema};
