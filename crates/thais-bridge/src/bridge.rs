use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thais_events::{CallbackFault, ConnectionId, EventFired, EventId, EventObserver};
use thais_scheduler::{ScheduleRequest, SchedulerError, SchedulerHandle, When};
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::packet::{DecodeError, PacketDecoder, PacketIntent};
use crate::registry::ConnectionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to decode packet from {connection}: {source}")]
    Decode {
        connection: ConnectionId,
        #[source]
        source: DecodeError,
    },

    #[error("failed to schedule action for {connection}: {source}")]
    Schedule {
        connection: ConnectionId,
        #[source]
        source: SchedulerError,
    },
}

/// What one inbound packet turned into
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub immediate: usize,
    pub scheduled: Vec<EventId>,
    pub disconnected: bool,
}

/// Counters shared by the bridge and its observer
#[derive(Debug, Default)]
pub struct BridgeStats {
    packets: AtomicU64,
    decode_errors: AtomicU64,
    immediate: AtomicU64,
    scheduled: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    send_failures: AtomicU64,
}

impl BridgeStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn immediate(&self) -> u64 {
        self.immediate.load(Ordering::Relaxed)
    }

    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Replies and fired-event payloads that reached their connection
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Fired-event payloads whose connection was already gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }
}

impl fmt::Display for BridgeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packets: {} | Decode errors: {} | Immediate: {} | Scheduled: {} | Delivered: {} | Dropped: {} | Send failures: {}",
            self.packets(),
            self.decode_errors(),
            self.immediate(),
            self.scheduled(),
            self.delivered(),
            self.dropped(),
            self.send_failures()
        )
    }
}

/// Sits between connection tasks and the scheduler.
///
/// Connection tasks call [`on_packet_received`](Self::on_packet_received);
/// the dispatch loop reaches back through the [`BridgeObserver`] returned by
/// [`observer`](Self::observer).
pub struct DispatchBridge<S> {
    scheduler: SchedulerHandle<S>,
    decoder: Arc<dyn PacketDecoder<S>>,
    registry: ConnectionRegistry,
    stats: Arc<BridgeStats>,
}

impl<S> Clone for DispatchBridge<S> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            decoder: Arc::clone(&self.decoder),
            registry: self.registry.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<S> DispatchBridge<S> {
    pub fn new(scheduler: SchedulerHandle<S>, decoder: Arc<dyn PacketDecoder<S>>) -> Self {
        Self {
            scheduler,
            decoder,
            registry: ConnectionRegistry::new(),
            stats: Arc::new(BridgeStats::default()),
        }
    }

    /// Observer to subscribe on the scheduler so fired payloads reach clients
    pub fn observer(&self) -> BridgeObserver {
        BridgeObserver {
            registry: self.registry.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn register(&self, connection: Arc<dyn Connection>) {
        let id = connection.id();
        if self.registry.insert(connection).is_some() {
            warn!(target: "bridge", "Connection {} registered twice, replacing the old one", id);
        } else {
            debug!(target: "bridge", "Registered {}", id);
        }
    }

    /// Forget a connection and cancel everything it still has queued.
    ///
    /// Returns the ids of the cancelled events.
    pub fn on_connection_closed(&self, id: ConnectionId) -> Vec<EventId> {
        if let Some(connection) = self.registry.remove(id) {
            connection.close();
        }
        let cancelled = self.scheduler.cancel_origin(id);
        debug!(
            target: "bridge",
            "Connection {} closed, cancelled {} pending event(s)",
            id,
            cancelled.len()
        );
        cancelled
    }

    /// Decode one packet and act on every intent in it.
    ///
    /// Intents are applied in order. If scheduling one fails the remaining
    /// intents are skipped and the error is returned; anything already applied
    /// stays applied. Reply send failures are logged and counted only.
    pub fn on_packet_received(
        &self,
        connection: &Arc<dyn Connection>,
        packet: &[u8],
    ) -> Result<DispatchOutcome, BridgeError> {
        let id = connection.id();
        BridgeStats::bump(&self.stats.packets);

        let intents = self.decoder.decode(packet).map_err(|source| {
            BridgeStats::bump(&self.stats.decode_errors);
            debug!(target: "bridge", "Undecodable packet from {}: {}", id, source);
            BridgeError::Decode {
                connection: id,
                source,
            }
        })?;

        let mut outcome = DispatchOutcome::default();
        for intent in intents {
            match intent {
                PacketIntent::Immediate(action) => {
                    BridgeStats::bump(&self.stats.immediate);
                    outcome.immediate += 1;
                    if let Some(reply) = action() {
                        self.reply(connection.as_ref(), &reply);
                    }
                }
                PacketIntent::Delayed {
                    delay_ms,
                    priority,
                    label,
                    action,
                } => {
                    let mut request = ScheduleRequest::boxed(When::Delay(delay_ms), action)
                        .with_priority(priority)
                        .with_origin(id);
                    if let Some(label) = label {
                        request = request.with_label(label);
                    }
                    let event = self
                        .scheduler
                        .schedule(request)
                        .map_err(|source| BridgeError::Schedule {
                            connection: id,
                            source,
                        })?;
                    BridgeStats::bump(&self.stats.scheduled);
                    trace!(target: "bridge", "{} scheduled {} in {}ms", id, event, delay_ms);
                    outcome.scheduled.push(event);
                }
                PacketIntent::Disconnect => {
                    self.on_connection_closed(id);
                    connection.close();
                    outcome.disconnected = true;
                    break;
                }
            }
        }
        Ok(outcome)
    }

    fn reply(&self, connection: &dyn Connection, bytes: &[u8]) {
        match connection.send(bytes) {
            Ok(()) => BridgeStats::bump(&self.stats.delivered),
            Err(e) => {
                BridgeStats::bump(&self.stats.send_failures);
                warn!(target: "bridge", "Reply lost: {}", e);
            }
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn scheduler(&self) -> &SchedulerHandle<S> {
        &self.scheduler
    }
}

/// Routes fired-event payloads back to the originating connection
pub struct BridgeObserver {
    registry: ConnectionRegistry,
    stats: Arc<BridgeStats>,
}

impl EventObserver for BridgeObserver {
    fn on_event_fired(&mut self, fired: &EventFired) {
        let (Some(origin), Some(output)) = (fired.origin, fired.output.as_deref()) else {
            return;
        };

        let connection = match self.registry.get(origin) {
            Some(connection) if connection.is_open() => connection,
            _ => {
                BridgeStats::bump(&self.stats.dropped);
                debug!(target: "bridge", "Dropping output of {}: {} is gone", fired.id, origin);
                return;
            }
        };

        match connection.send(output) {
            Ok(()) => BridgeStats::bump(&self.stats.delivered),
            Err(e) => {
                BridgeStats::bump(&self.stats.send_failures);
                warn!(target: "bridge", "Output of {} not delivered: {}", fired.id, e);
            }
        }
    }

    fn on_callback_fault(&mut self, fault: &CallbackFault) {
        if let Some(origin) = fault.origin {
            debug!(target: "bridge", "Action {} for {} failed, nothing sent", fault.id, origin);
        }
    }
}
