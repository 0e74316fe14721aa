//! Event scheduling engine for a tick-driven game world shard.
//!
//! Game logic and connection tasks submit [`ScheduleRequest`]s through a
//! cloneable [`SchedulerHandle`]. A single task drives the [`Scheduler`]'s
//! dispatch loop, which fires due events in `(due time, priority, submission)`
//! order against the shard's world state and notifies registered observers.

mod clock;
mod error;
mod event;
mod handle;
mod queue;
mod scheduler;
mod stats;

pub use clock::ShardClock;
pub use error::SchedulerError;
pub use event::{Callback, CallbackResult, EventMeta, FireContext, ScheduleRequest, When};
pub use handle::SchedulerHandle;
pub use queue::EventSummary;
pub use scheduler::{LoopState, Scheduler};
pub use stats::{SchedulerStats, StatsSnapshot};

pub use thais_events::{
    CallbackFault, ConnectionId, EventFired, EventId, EventObserver, EventState, FaultKind,
    FnObserver, LogicalTime, Priority,
};
