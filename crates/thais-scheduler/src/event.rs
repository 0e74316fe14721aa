use std::fmt;
use std::time::Duration;

use thais_events::{ConnectionId, EventId, EventState, LogicalTime, Priority};

use crate::error::SchedulerError;
use crate::handle::SchedulerHandle;

/// What a callback hands back: an optional outbound payload for the
/// originating connection, or an error that is reported as a fault.
pub type CallbackResult = anyhow::Result<Option<Vec<u8>>>;

/// Deferred work owned by an event until it fires or is cancelled
pub type Callback<S> = Box<dyn FnOnce(&mut S, &FireContext<'_, S>) -> CallbackResult + Send>;

/// When an event becomes eligible to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    /// Relative delay in milliseconds from the moment of scheduling
    Delay(i64),
    /// Absolute logical time. Times in the past fire on the next cycle.
    At(LogicalTime),
}

impl When {
    pub fn after(delay: Duration) -> Self {
        When::Delay(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
    }

    pub fn resolve(self, now: LogicalTime) -> Result<LogicalTime, SchedulerError> {
        match self {
            When::Delay(ms) if ms < 0 => Err(SchedulerError::InvalidDelay(ms)),
            When::Delay(ms) => Ok(now.after_millis(ms.unsigned_abs())),
            When::At(at) => Ok(at),
        }
    }
}

/// Immutable description of a scheduled event
#[derive(Debug, Clone)]
pub struct EventMeta {
    pub id: EventId,
    pub due_at: LogicalTime,
    pub requested_at: LogicalTime,
    pub priority: Priority,
    pub origin: Option<ConnectionId>,
    pub label: Option<String>,
}

/// A schedulable unit of work
pub struct Event<S> {
    pub(crate) meta: EventMeta,
    pub(crate) state: EventState,
    callback: Callback<S>,
}

impl<S> Event<S> {
    pub(crate) fn new(meta: EventMeta, callback: Callback<S>) -> Self {
        Self {
            meta,
            state: EventState::Pending,
            callback,
        }
    }

    pub(crate) fn id(&self) -> EventId {
        self.meta.id
    }

    pub(crate) fn due_at(&self) -> LogicalTime {
        self.meta.due_at
    }

    pub(crate) fn meta(&self) -> &EventMeta {
        &self.meta
    }

    pub(crate) fn state(&self) -> EventState {
        self.state
    }

    /// `Pending -> Cancelled`. No-op once terminal.
    pub(crate) fn mark_cancelled(&mut self) {
        if !self.state.is_terminal() {
            self.state = EventState::Cancelled;
        }
    }

    /// `Pending -> Fired`, taken when the dispatch loop claims the event.
    /// No-op once terminal.
    pub(crate) fn mark_fired(&mut self) {
        if !self.state.is_terminal() {
            self.state = EventState::Fired;
        }
    }

    /// Consume the event for firing. The callback leaves with it.
    pub(crate) fn into_parts(self) -> (EventMeta, Callback<S>) {
        (self.meta, self.callback)
    }
}

impl<S> fmt::Debug for Event<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("meta", &self.meta)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Context lent to a callback while it runs on the dispatch loop
pub struct FireContext<'a, S> {
    pub(crate) meta: &'a EventMeta,
    pub(crate) fired_at: LogicalTime,
    pub(crate) handle: &'a SchedulerHandle<S>,
}

impl<'a, S> FireContext<'a, S> {
    pub fn id(&self) -> EventId {
        self.meta.id
    }

    pub fn label(&self) -> Option<&str> {
        self.meta.label.as_deref()
    }

    pub fn origin(&self) -> Option<ConnectionId> {
        self.meta.origin
    }

    pub fn due_at(&self) -> LogicalTime {
        self.meta.due_at
    }

    /// The logical instant of the dispatch cycle firing this event
    pub fn fired_at(&self) -> LogicalTime {
        self.fired_at
    }

    /// Handle for scheduling follow-up events, e.g. the next tick of a timer
    pub fn handle(&self) -> &SchedulerHandle<S> {
        self.handle
    }
}

/// A request to schedule one event, built up fluently
pub struct ScheduleRequest<S> {
    pub(crate) when: When,
    pub(crate) priority: Priority,
    pub(crate) id: Option<EventId>,
    pub(crate) origin: Option<ConnectionId>,
    pub(crate) label: Option<String>,
    pub(crate) callback: Callback<S>,
}

impl<S> ScheduleRequest<S> {
    pub fn new<F>(when: When, callback: F) -> Self
    where
        F: FnOnce(&mut S, &FireContext<'_, S>) -> CallbackResult + Send + 'static,
    {
        Self::boxed(when, Box::new(callback))
    }

    /// Build a request around a callback that is already boxed
    pub fn boxed(when: When, callback: Callback<S>) -> Self {
        Self {
            when,
            priority: Priority::default(),
            id: None,
            origin: None,
            label: None,
            callback,
        }
    }

    pub fn after_millis<F>(delay_ms: i64, callback: F) -> Self
    where
        F: FnOnce(&mut S, &FireContext<'_, S>) -> CallbackResult + Send + 'static,
    {
        Self::new(When::Delay(delay_ms), callback)
    }

    pub fn at<F>(due_at: LogicalTime, callback: F) -> Self
    where
        F: FnOnce(&mut S, &FireContext<'_, S>) -> CallbackResult + Send + 'static,
    {
        Self::new(When::At(due_at), callback)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Use a caller-chosen id instead of an allocated one.
    ///
    /// Scheduling fails with `DuplicateId` if another pending event holds the
    /// id. The allocator skips ids that are pending, so allocated ids never
    /// collide with caller-chosen ones.
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_origin(mut self, origin: ConnectionId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn when(&self) -> When {
        self.when
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl<S> fmt::Debug for ScheduleRequest<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleRequest")
            .field("when", &self.when)
            .field("priority", &self.priority)
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_delay_is_rejected() {
        let now = LogicalTime::from_millis(500);
        assert_eq!(
            When::Delay(-1).resolve(now),
            Err(SchedulerError::InvalidDelay(-1))
        );
    }

    #[test]
    fn test_delay_is_relative_to_now() {
        let now = LogicalTime::from_millis(500);
        assert_eq!(When::Delay(0).resolve(now), Ok(now));
        assert_eq!(
            When::Delay(250).resolve(now),
            Ok(LogicalTime::from_millis(750))
        );
    }

    #[test]
    fn test_absolute_time_in_the_past_is_allowed() {
        let now = LogicalTime::from_millis(500);
        let past = LogicalTime::from_millis(10);
        assert_eq!(When::At(past).resolve(now), Ok(past));
    }

    fn pending_event() -> Event<()> {
        let meta = EventMeta {
            id: EventId::from_raw(1),
            due_at: LogicalTime::from_millis(10),
            requested_at: LogicalTime::ZERO,
            priority: Priority::NORMAL,
            origin: None,
            label: None,
        };
        Event::new(meta, Box::new(|_, _| Ok(None)))
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let mut event = pending_event();
        assert_eq!(event.state(), EventState::Pending);
        event.mark_cancelled();
        event.mark_cancelled();
        assert_eq!(event.state(), EventState::Cancelled);
        event.mark_fired();
        assert_eq!(event.state(), EventState::Cancelled);
    }

    #[test]
    fn test_fired_is_terminal() {
        let mut event = pending_event();
        event.mark_fired();
        assert_eq!(event.state(), EventState::Fired);
        assert!(event.state().is_terminal());
        event.mark_cancelled();
        assert_eq!(event.state(), EventState::Fired);
    }

    #[test]
    fn test_after_duration() {
        assert_eq!(When::after(Duration::from_millis(40)), When::Delay(40));
    }
}
