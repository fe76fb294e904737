//! Key/value persistence behind the `KeyValueStore` port, and the
//! asynchronous queue that saves ledger snapshots off the call path.

pub mod error;
pub mod file;
pub mod memory;
pub mod queue;

pub use error::{StoreError, StoreResult};
pub use file::FileKeyValueStore;
pub use memory::MemoryKeyValueStore;
pub use queue::{PersistQueue, QueueConfig};
