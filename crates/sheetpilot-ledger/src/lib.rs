//! Operation ledger: records side-effecting calls, synthesizes their
//! inverses, and drives linear undo/redo with atomic batches.
//!
//! The ledger never calls a backend itself. Undo and redo replay through a
//! caller-supplied [`OperationExecutor`](sheetpilot_protocol::OperationExecutor).

pub mod error;
pub mod inverse;
pub mod ledger;

pub use error::{LedgerError, LedgerResult};
pub use inverse::{InverseRule, InverseRules};
pub use ledger::{
    BatchUndoReport, BlockedOperation, DEFAULT_LEDGER_CAPACITY, LedgerConfig, LedgerSnapshot,
    OperationLedger, RedoEntry, Redone, Undone,
};
