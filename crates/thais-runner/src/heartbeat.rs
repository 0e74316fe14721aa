//! Recurring world tick
//!
//! The heartbeat is an ordinary event that schedules its own successor when
//! it fires, so it shares the queue, the ordering and the cancellation rules
//! with every other event.

use thais_events::{EventId, LogicalTime, Priority};
use thais_scheduler::{ScheduleRequest, SchedulerError, SchedulerHandle};
use tracing::{debug, trace};

pub const HEARTBEAT_LABEL: &str = "world-tick";

/// World state driven by a [`ShardRunner`](crate::ShardRunner)
pub trait ShardWorld: Send + 'static {
    /// Called on every heartbeat. `tick` counts up from 1.
    fn on_tick(&mut self, tick: u64, now: LogicalTime) -> anyhow::Result<()>;
}

/// Schedule the first heartbeat `interval_ms` from now
pub fn start_heartbeat<S: ShardWorld>(
    handle: &SchedulerHandle<S>,
    interval_ms: u64,
) -> Result<EventId, SchedulerError> {
    let first = handle.now().after_millis(interval_ms);
    handle.schedule(heartbeat_request(interval_ms, 1, first))
}

fn heartbeat_request<S: ShardWorld>(
    interval_ms: u64,
    tick: u64,
    due_at: LogicalTime,
) -> ScheduleRequest<S> {
    ScheduleRequest::at(due_at, move |world: &mut S, ctx| {
        // Successors are due on the original cadence even when this tick ran late
        let next = ctx.due_at().after_millis(interval_ms);
        match ctx.handle().schedule(heartbeat_request(interval_ms, tick + 1, next)) {
            Ok(id) => trace!(target: "scheduler", "Heartbeat {} queued as {}", tick + 1, id),
            Err(SchedulerError::Stopped) => debug!(target: "scheduler", "Heartbeat ends at tick {}", tick),
            Err(e) => return Err(e.into()),
        }
        world.on_tick(tick, ctx.fired_at())?;
        Ok(None)
    })
    .with_priority(Priority::HIGH)
    .with_label(HEARTBEAT_LABEL)
}
