//! The dispatch loop.
//!
//! A [`Scheduler`] owns the shard's world state and its event queue. Exactly
//! one task drives it through [`Scheduler::run`], so callbacks mutate the world
//! strictly one after another without any locking. Everyone else talks to it
//! through [`SchedulerHandle`]s.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thais_events::{CallbackFault, EventFired, EventId, EventObserver, FaultKind, LogicalTime};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clock::ShardClock;
use crate::error::SchedulerError;
use crate::event::{Event, FireContext};
use crate::handle::{SchedulerHandle, Shared};
use crate::queue::EventSummary;
use crate::stats::{SchedulerStats, StatsSnapshot};

/// Where the dispatch loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Deciding what to do next
    Idle,
    /// Suspended until the earliest due time, a wake-up, or the stop signal
    Waiting,
    /// Running callbacks for a batch of due events
    Firing,
    /// Terminal
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Waiting => "waiting",
            LoopState::Firing => "firing",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub struct Scheduler<S> {
    shared: Arc<Shared<S>>,
    handle: SchedulerHandle<S>,
    world: S,
    observers: Vec<Box<dyn EventObserver>>,
    loop_state: LoopState,
}

impl<S: Send + 'static> Scheduler<S> {
    /// Create a scheduler owning `world`, with a clock starting now
    pub fn new(world: S) -> Self {
        Self::with_clock(world, ShardClock::start())
    }

    pub fn with_clock(world: S, clock: ShardClock) -> Self {
        let shared = Arc::new(Shared::new(clock));
        let handle = SchedulerHandle::new(Arc::clone(&shared));
        Self {
            shared,
            handle,
            world,
            observers: Vec::new(),
            loop_state: LoopState::Idle,
        }
    }

    pub fn handle(&self) -> SchedulerHandle<S> {
        self.handle.clone()
    }

    /// Register an observer for fired events and callback faults
    pub fn subscribe(&mut self, observer: impl EventObserver) {
        self.subscribe_boxed(Box::new(observer));
    }

    pub fn subscribe_boxed(&mut self, observer: Box<dyn EventObserver>) {
        self.observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn world(&self) -> &S {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut S {
        &mut self.world
    }

    pub fn into_world(self) -> S {
        self.world
    }

    pub fn state(&self) -> LoopState {
        self.loop_state
    }

    pub fn now(&self) -> LogicalTime {
        self.shared.clock.now()
    }

    pub fn clock(&self) -> ShardClock {
        self.shared.clock
    }

    pub fn peek_earliest(&self) -> Option<EventSummary> {
        self.handle.peek_earliest()
    }

    pub fn pending(&self) -> usize {
        self.handle.pending()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Run one firing step at logical instant `now`.
    ///
    /// Every event due at or before `now` fires in ascending
    /// `(due_at, priority, submission)` order. Events scheduled by those
    /// callbacks wait for the next step even when already due. Returns how many
    /// events were popped.
    pub fn fire_due(&mut self, now: LogicalTime) -> Result<usize, SchedulerError> {
        if self.loop_state == LoopState::Stopped {
            return Err(SchedulerError::Stopped);
        }
        self.loop_state = LoopState::Firing;

        let due = match self.shared.lock_queue().and_then(|mut queue| queue.pop_due(now)) {
            Ok(due) => due,
            Err(e) => {
                error!(target: "scheduler", "Fatal queue fault at {}: {}", now, e);
                self.stop();
                return Err(e);
            }
        };

        let count = due.len();
        if count > 0 {
            debug!(target: "scheduler", "Firing {} event(s) at {}", count, now);
        }
        for event in due {
            self.fire_one(event, now);
        }

        SchedulerStats::bump(&self.shared.stats.cycles);
        self.loop_state = LoopState::Idle;
        Ok(count)
    }

    fn fire_one(&mut self, event: Event<S>, now: LogicalTime) {
        let (meta, callback) = event.into_parts();
        let ctx = FireContext {
            meta: &meta,
            fired_at: now,
            handle: &self.handle,
        };

        let world = &mut self.world;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(world, &ctx)));

        let kind = match outcome {
            Ok(Ok(output)) => {
                SchedulerStats::bump(&self.shared.stats.fired);
                let fired = EventFired {
                    id: meta.id,
                    label: meta.label.clone(),
                    origin: meta.origin,
                    requested_at: meta.requested_at,
                    due_at: meta.due_at,
                    fired_at: now,
                    output,
                };
                self.notify_observers(meta.id, |observer| observer.on_event_fired(&fired));
                return;
            }
            Ok(Err(err)) => FaultKind::Failed(format!("{err:#}")),
            Err(payload) => FaultKind::Panicked(panic_message(payload.as_ref())),
        };

        SchedulerStats::bump(&self.shared.stats.faults);
        let fault = CallbackFault {
            id: meta.id,
            label: meta.label,
            origin: meta.origin,
            fired_at: now,
            kind,
        };
        warn!(target: "scheduler", "{}", fault);
        self.notify_observers(fault.id, |observer| observer.on_callback_fault(&fault));
    }

    /// Call every observer in registration order. A panicking observer is
    /// logged and skipped so the rest of the batch still fires.
    fn notify_observers<F>(&mut self, id: EventId, mut call: F)
    where
        F: FnMut(&mut dyn EventObserver),
    {
        for (index, observer) in self.observers.iter_mut().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(observer.as_mut())));
            if let Err(payload) = outcome {
                SchedulerStats::bump(&self.shared.stats.observer_panics);
                error!(
                    target: "scheduler",
                    "Observer #{} panicked while handling {}: {}",
                    index,
                    id,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    /// Drive the dispatch loop until `stop` carries `true` or its sender is
    /// dropped.
    ///
    /// Returns `Err` only for a fatal queue fault. Callback failures are
    /// reported to observers and the loop keeps going.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        if self.loop_state == LoopState::Stopped {
            return Err(SchedulerError::Stopped);
        }
        let shared = Arc::clone(&self.shared);
        info!(target: "scheduler", "Dispatch loop started at {}", shared.clock.now());

        loop {
            if *stop.borrow() {
                break;
            }

            self.loop_state = LoopState::Idle;
            let next = match shared.lock_queue() {
                Ok(mut queue) => queue.peek_earliest(),
                Err(e) => {
                    error!(target: "scheduler", "Fatal queue fault: {}", e);
                    self.stop();
                    return Err(e);
                }
            };
            let now = shared.clock.now();

            if let Some(next) = next {
                if next.due_at <= now {
                    self.fire_due(now)?;
                    // Let connection tasks in between busy cycles
                    tokio::task::yield_now().await;
                    continue;
                }
            }

            self.loop_state = LoopState::Waiting;
            let deadline = next.map(|n| shared.clock.instant_at(n.due_at));

            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        info!(target: "scheduler", "Stop signal sender dropped");
                        break;
                    }
                }
                _ = shared.wake.notified() => {}
                _ = sleep_until_deadline(deadline) => {}
            }
        }

        self.stop();
        info!(target: "scheduler", "Dispatch loop stopped at {} ({})", shared.clock.now(), shared.stats.snapshot());
        Ok(())
    }

    fn stop(&mut self) {
        self.loop_state = LoopState::Stopped;
        self.shared.mark_stopped();
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use thais_events::FnObserver;

    use crate::event::ScheduleRequest;

    #[tokio::test(start_paused = true)]
    async fn test_fire_due_runs_callbacks_against_world() {
        let mut scheduler = Scheduler::new(Vec::<u64>::new());
        let handle = scheduler.handle();
        for due in [30, 10, 20] {
            handle
                .schedule_at(LogicalTime::from_millis(due), move |world: &mut Vec<u64>, _| {
                    world.push(due);
                    Ok(None)
                })
                .unwrap();
        }

        assert_eq!(scheduler.fire_due(LogicalTime::from_millis(20)).unwrap(), 2);
        assert_eq!(scheduler.world(), &vec![10, 20]);
        assert_eq!(scheduler.fire_due(LogicalTime::from_millis(30)).unwrap(), 1);
        assert_eq!(scheduler.world(), &vec![10, 20, 30]);
        assert_eq!(scheduler.state(), LoopState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_output_and_origin() {
        let mut scheduler = Scheduler::new(());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        scheduler.subscribe(FnObserver(move |fired: &EventFired| {
            let _ = tx.send(fired.clone());
        }));

        let origin = thais_events::ConnectionId::from_raw(9);
        scheduler
            .handle()
            .schedule(
                ScheduleRequest::after_millis(0, |_, _| Ok(Some(b"pong".to_vec())))
                    .with_origin(origin)
                    .with_label("ping"),
            )
            .unwrap();
        scheduler.fire_due(scheduler.now()).unwrap();

        let fired = rx.try_recv().unwrap();
        assert_eq!(fired.origin, Some(origin));
        assert_eq!(fired.label.as_deref(), Some("ping"));
        assert_eq!(fired.output.as_deref(), Some(&b"pong"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callback_becomes_fault() {
        struct Faults(tokio::sync::mpsc::UnboundedSender<CallbackFault>);
        impl EventObserver for Faults {
            fn on_event_fired(&mut self, _fired: &EventFired) {}
            fn on_callback_fault(&mut self, fault: &CallbackFault) {
                let _ = self.0.send(fault.clone());
            }
        }

        let mut scheduler = Scheduler::new(0u32);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        scheduler.subscribe(Faults(tx));
        let handle = scheduler.handle();
        handle
            .schedule_after(Duration::ZERO, |_: &mut u32, _| panic!("boom"))
            .unwrap();
        handle
            .schedule_after(Duration::ZERO, |world: &mut u32, _| {
                *world += 1;
                Ok(None)
            })
            .unwrap();

        assert_eq!(scheduler.fire_due(scheduler.now()).unwrap(), 2);
        assert_eq!(*scheduler.world(), 1);
        let fault = rx.try_recv().unwrap();
        assert_eq!(fault.kind, FaultKind::Panicked("boom".into()));
        assert_eq!(scheduler.stats().faults, 1);
        assert_eq!(scheduler.stats().fired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_observer_is_skipped() {
        let mut scheduler = Scheduler::new(0u32);
        scheduler.subscribe(FnObserver(|_: &EventFired| panic!("observer bug")));
        let handle = scheduler.handle();
        for _ in 0..3 {
            handle
                .schedule_after(Duration::ZERO, |world: &mut u32, _| {
                    *world += 1;
                    Ok(None)
                })
                .unwrap();
        }

        assert_eq!(scheduler.fire_due(scheduler.now()).unwrap(), 3);
        assert_eq!(*scheduler.world(), 3);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.state(), LoopState::Idle);
        assert_eq!(scheduler.stats().observer_panics, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_on_stop_and_refuses_new_events() {
        let mut scheduler = Scheduler::new(());
        let handle = scheduler.handle();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let result = scheduler.run(stop_rx).await;
            (result, scheduler.state())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop_tx.send(true).unwrap();

        let (result, state) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state, LoopState::Stopped);
        assert_eq!(
            handle.schedule_after(Duration::ZERO, |_, _| Ok(None)),
            Err(SchedulerError::Stopped)
        );
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "callback panicked");
    }
}
