//! Kernel composition: one [`SessionContext`] per conversation, each owning
//! its own dispatcher, ledger, notification bus and approval gate, plus the
//! JSON-RPC router that drives a context from envelopes.

pub mod config;
pub mod context;
pub mod kernel;
pub mod router;

pub use config::{KernelConfig, PersistenceConfig};
pub use context::{SessionContext, ledger_key};
pub use kernel::{Kernel, KernelBuilder};
pub use router::{DEFAULT_HISTORY_LIMIT, SERVER_NAME};
