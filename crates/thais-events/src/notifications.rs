use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConnectionId, EventId, LogicalTime};

/// Lifecycle state of an event.
///
/// `Pending` can move to `Cancelled` or `Fired`. Both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventState {
    Pending,
    Cancelled,
    Fired,
}

impl EventState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EventState::Pending)
    }
}

/// Notification raised after an event's callback completed successfully
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFired {
    pub id: EventId,
    pub label: Option<String>,
    /// Connection whose packet caused the event, if any
    pub origin: Option<ConnectionId>,
    pub requested_at: LogicalTime,
    pub due_at: LogicalTime,
    pub fired_at: LogicalTime,
    /// Outbound payload produced by the callback, routed back to `origin`
    pub output: Option<Vec<u8>>,
}

impl EventFired {
    /// How far behind its due time the event actually fired
    pub fn lateness(&self) -> Duration {
        self.fired_at.saturating_since(self.due_at)
    }
}

/// How a callback failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// The callback returned an error
    Failed(String),
    /// The callback panicked
    Panicked(String),
}

/// A callback raised an error while firing. Reported to observers, never fatal.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("callback for {id} failed at {fired_at}: {kind:?}")]
pub struct CallbackFault {
    pub id: EventId,
    pub label: Option<String>,
    pub origin: Option<ConnectionId>,
    pub fired_at: LogicalTime,
    pub kind: FaultKind,
}
