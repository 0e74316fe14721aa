//! Time-ordered queue of pending events.
//!
//! Events are ordered by `(due_at, priority, sequence)`. The sequence number is
//! handed out on insertion, so events that share a due time and priority come
//! out in the order they went in.
//!
//! The heap only holds sort keys. Payloads live in an index keyed by id, which
//! makes cancellation O(1): the event is dropped from the index right away and
//! its heap slot goes stale, to be skipped the next time it surfaces.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use thais_events::{ConnectionId, EventId, LogicalTime, Priority};
use tracing::{debug, trace};

use crate::error::SchedulerError;
use crate::event::Event;

/// Stale heap slots tolerated before the heap is rebuilt from the index
const COMPACT_SLACK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotKey {
    due_at: LogicalTime,
    priority: Priority,
    sequence: u64,
    id: EventId,
}

impl SlotKey {
    fn sort_key(&self) -> (LogicalTime, Priority, u64) {
        (self.due_at, self.priority, self.sequence)
    }
}

impl Ord for SlotKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for SlotKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Live<S> {
    key: SlotKey,
    event: Event<S>,
}

/// Summary of the earliest pending event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSummary {
    pub id: EventId,
    pub due_at: LogicalTime,
    pub priority: Priority,
}

pub struct EventQueue<S> {
    heap: BinaryHeap<Reverse<SlotKey>>,
    live: HashMap<EventId, Live<S>>,
    next_sequence: u64,
}

impl<S> EventQueue<S> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Insert a pending event.
    ///
    /// Returns whether the event is now the earliest in the queue, which is
    /// when a waiting dispatch loop needs waking.
    pub fn insert(&mut self, event: Event<S>) -> Result<bool, SchedulerError> {
        let id = event.id();
        if self.live.contains_key(&id) {
            return Err(SchedulerError::DuplicateId(id));
        }

        let key = SlotKey {
            due_at: event.due_at(),
            priority: event.meta().priority,
            sequence: self.next_sequence,
            id,
        };
        self.next_sequence += 1;

        let earliest = match self.peek_earliest() {
            None => true,
            Some(current) => {
                (key.due_at, key.priority) < (current.due_at, current.priority)
            }
        };

        self.heap.push(Reverse(key));
        self.live.insert(id, Live { key, event });
        Ok(earliest)
    }

    /// The event with the smallest sort key, or `None` when nothing is pending.
    ///
    /// Stale slots left behind by cancellations are discarded on the way.
    pub fn peek_earliest(&mut self) -> Option<EventSummary> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.is_current(top) {
                return Some(EventSummary {
                    id: top.id,
                    due_at: top.due_at,
                    priority: top.priority,
                });
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every pending event due at or before `now`, in
    /// ascending sort-key order.
    pub fn pop_due(&mut self, now: LogicalTime) -> Result<Vec<Event<S>>, SchedulerError> {
        let mut due = Vec::new();
        let mut previous: Option<SlotKey> = None;

        while let Some(Reverse(top)) = self.heap.peek() {
            if top.due_at > now {
                break;
            }
            let Some(Reverse(key)) = self.heap.pop() else {
                break;
            };
            if !self.is_current(&key) {
                trace!(target: "scheduler", "Discarding stale slot for {}", key.id);
                continue;
            }

            if let Some(prev) = previous {
                if key < prev {
                    return Err(SchedulerError::QueueCorruption(format!(
                        "{} popped after {} but sorts before it",
                        key.id, prev.id
                    )));
                }
            }

            let Some(mut live) = self.live.remove(&key.id) else {
                return Err(SchedulerError::QueueCorruption(format!(
                    "{} vanished from the index while popping",
                    key.id
                )));
            };
            if live.event.due_at() != key.due_at {
                return Err(SchedulerError::QueueCorruption(format!(
                    "{} is indexed for {} but its heap slot says {}",
                    key.id,
                    live.event.due_at(),
                    key.due_at
                )));
            }

            previous = Some(key);
            live.event.mark_fired();
            due.push(live.event);
        }

        Ok(due)
    }

    /// Cancel a pending event. Returns `false` if it was absent or already
    /// terminal, which is not an error.
    pub fn remove(&mut self, id: EventId) -> bool {
        let Some(mut live) = self.live.remove(&id) else {
            return false;
        };
        live.event.mark_cancelled();
        trace!(target: "scheduler", "Cancelled {} ({:?})", id, live.event.state());
        drop(live);

        self.maybe_compact();
        true
    }

    /// Pending events that originated from `origin`, in no particular order
    pub fn pending_for(&self, origin: ConnectionId) -> Vec<EventId> {
        self.live
            .iter()
            .filter(|(_, live)| live.event.meta().origin == Some(origin))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Cancel every pending event that originated from `origin`
    pub fn remove_by_origin(&mut self, origin: ConnectionId) -> Vec<EventId> {
        let ids = self.pending_for(origin);
        for id in &ids {
            if let Some(mut live) = self.live.remove(id) {
                live.event.mark_cancelled();
            }
        }
        self.maybe_compact();
        ids
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn is_current(&self, key: &SlotKey) -> bool {
        self.live
            .get(&key.id)
            .is_some_and(|live| live.key.sequence == key.sequence)
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() <= self.live.len() * 2 + COMPACT_SLACK {
            return;
        }
        let before = self.heap.len();
        self.heap = self.live.values().map(|live| Reverse(live.key)).collect();
        debug!(target: "scheduler", "Compacted event heap from {} to {} slots", before, self.heap.len());
    }
}

impl<S> Default for EventQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}
