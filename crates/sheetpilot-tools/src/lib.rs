//! Tool dispatch: backend sessions, capability routing, policy gating and
//! ledger recording around every call, plus an in-memory grid backend.

pub mod dispatcher;
pub mod grid;

pub use dispatcher::{DispatchResult, SessionInfo, ToolDispatcher, ToolExecutionReport};
pub use grid::{Cell, DEFAULT_SHEET, InMemoryGridBackend, MAX_RANGE_CELLS, parse_target};
