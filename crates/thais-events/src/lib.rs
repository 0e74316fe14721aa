//! Core event types shared across thais crates
//!
//! This crate holds the identifiers, logical time, fired-event notifications
//! and the observer trait, so the scheduler, the bridge and the runner can all
//! agree on them without depending on each other.

mod ids;
mod notifications;
mod observer;
mod time;

pub use ids::{ConnectionId, EventId, Priority};
pub use notifications::{CallbackFault, EventFired, EventState, FaultKind};
pub use observer::{EventObserver, FnObserver};
pub use time::LogicalTime;
