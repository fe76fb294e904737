//! Notification bus: filtered fan-out to subscribers plus a bounded ring of
//! retained notifications that can be queried, marked read and purged.

pub mod bus;
pub mod filter;

pub use bus::{BusConfig, NotificationBus, NotificationCallback};
pub use filter::{EventFilter, NotificationFilter, NotificationPredicate};
