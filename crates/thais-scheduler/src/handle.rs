use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thais_events::{ConnectionId, EventId, LogicalTime};
use tokio::sync::Notify;
use tracing::{error, trace};

use crate::clock::ShardClock;
use crate::error::SchedulerError;
use crate::event::{CallbackResult, Event, EventMeta, FireContext, ScheduleRequest, When};
use crate::queue::{EventQueue, EventSummary};
use crate::stats::{SchedulerStats, StatsSnapshot};

/// State shared between the dispatch loop and every handle
pub(crate) struct Shared<S> {
    queue: Mutex<EventQueue<S>>,
    pub(crate) wake: Notify,
    pub(crate) clock: ShardClock,
    pub(crate) stats: SchedulerStats,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl<S> Shared<S> {
    pub(crate) fn new(clock: ShardClock) -> Self {
        Self {
            queue: Mutex::new(EventQueue::new()),
            wake: Notify::new(),
            clock,
            stats: SchedulerStats::default(),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock_queue(&self) -> Result<MutexGuard<'_, EventQueue<S>>, SchedulerError> {
        self.queue
            .lock()
            .map_err(|_| SchedulerError::QueueCorruption("event queue lock poisoned".into()))
    }

    /// Next allocated id that is not held by a pending event. Caller-chosen
    /// ids may sit anywhere in the range, so the counter skips over them.
    fn allocate_id(&self, queue: &EventQueue<S>) -> EventId {
        loop {
            let id = EventId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
            if !queue.contains(id) {
                return id;
            }
        }
    }

    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Cloneable, thread-safe entry point for scheduling and cancelling events.
///
/// Many connection tasks hold one of these while a single dispatch loop owns
/// the [`Scheduler`](crate::Scheduler) itself.
pub struct SchedulerHandle<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for SchedulerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> SchedulerHandle<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>) -> Self {
        Self { shared }
    }

    /// Submit an event. Returns its id without waiting for it to fire.
    pub fn schedule(&self, request: ScheduleRequest<S>) -> Result<EventId, SchedulerError> {
        let result = self.try_schedule(request);
        if result.is_err() {
            SchedulerStats::bump(&self.shared.stats.rejected);
        }
        result
    }

    fn try_schedule(&self, request: ScheduleRequest<S>) -> Result<EventId, SchedulerError> {
        let ScheduleRequest {
            when,
            priority,
            id,
            origin,
            label,
            callback,
        } = request;

        let now = self.shared.clock.now();
        let due_at = when.resolve(now)?;

        let (id, earliest) = {
            let mut queue = self.shared.lock_queue()?;
            if self.shared.is_stopped() {
                return Err(SchedulerError::Stopped);
            }
            let id = match id {
                Some(id) => id,
                None => self.shared.allocate_id(&queue),
            };
            let meta = EventMeta {
                id,
                due_at,
                requested_at: now,
                priority,
                origin,
                label,
            };
            (id, queue.insert(Event::new(meta, callback))?)
        };

        SchedulerStats::bump(&self.shared.stats.scheduled);
        if earliest {
            self.shared.wake.notify_one();
        }
        trace!(target: "scheduler", "Scheduled {} due {} ({}) at {}", id, due_at, priority, now);
        Ok(id)
    }

    /// Schedule `callback` to run after `delay`
    pub fn schedule_after<F>(&self, delay: Duration, callback: F) -> Result<EventId, SchedulerError>
    where
        F: FnOnce(&mut S, &FireContext<'_, S>) -> CallbackResult + Send + 'static,
    {
        self.schedule(ScheduleRequest::new(When::after(delay), callback))
    }

    /// Schedule `callback` to run at an absolute logical time
    pub fn schedule_at<F>(&self, due_at: LogicalTime, callback: F) -> Result<EventId, SchedulerError>
    where
        F: FnOnce(&mut S, &FireContext<'_, S>) -> CallbackResult + Send + 'static,
    {
        self.schedule(ScheduleRequest::at(due_at, callback))
    }

    /// Request cancellation.
    ///
    /// Returns `true` if the event was still pending, in which case its
    /// callback will never run. Returns `false` if it already fired, is firing
    /// right now, was cancelled before, or never existed. Never interrupts a
    /// running callback.
    pub fn cancel(&self, id: EventId) -> bool {
        let removed = match self.shared.lock_queue() {
            Ok(mut queue) => queue.remove(id),
            Err(e) => {
                error!(target: "scheduler", "Cannot cancel {}: {}", id, e);
                false
            }
        };
        if removed {
            SchedulerStats::bump(&self.shared.stats.cancelled);
        }
        removed
    }

    /// Cancel every pending event that originated from `origin`
    pub fn cancel_origin(&self, origin: ConnectionId) -> Vec<EventId> {
        let removed = match self.shared.lock_queue() {
            Ok(mut queue) => queue.remove_by_origin(origin),
            Err(e) => {
                error!(target: "scheduler", "Cannot cancel events from {}: {}", origin, e);
                Vec::new()
            }
        };
        SchedulerStats::add(&self.shared.stats.cancelled, removed.len());
        removed
    }

    /// Whether the event is still waiting to fire
    pub fn is_pending(&self, id: EventId) -> bool {
        self.shared
            .lock_queue()
            .map(|queue| queue.contains(id))
            .unwrap_or(false)
    }

    pub fn peek_earliest(&self) -> Option<EventSummary> {
        self.shared
            .lock_queue()
            .ok()
            .and_then(|mut queue| queue.peek_earliest())
    }

    pub fn pending(&self) -> usize {
        self.shared.lock_queue().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn now(&self) -> LogicalTime {
        self.shared.clock.now()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}
