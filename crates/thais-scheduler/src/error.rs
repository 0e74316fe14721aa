use thais_events::EventId;

/// Errors surfaced by the scheduler to its callers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// An event with this id is still pending. Indicates a caller bug.
    #[error("event {0} is already scheduled")]
    DuplicateId(EventId),

    /// A relative delay was negative
    #[error("invalid delay of {0}ms: delays must not be negative")]
    InvalidDelay(i64),

    /// The queue's internal ordering is broken. Fatal to the dispatch loop.
    #[error("event queue corrupted: {0}")]
    QueueCorruption(String),

    /// The dispatch loop has stopped, nothing scheduled now would ever fire
    #[error("scheduler has stopped")]
    Stopped,
}
