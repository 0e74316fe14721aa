use std::collections::HashMap;

use thais_events::{ConnectionId, LogicalTime};
use thais_runner::ShardWorld;
use tracing::trace;

/// State of the demo shard, mutated only from the dispatch loop
#[derive(Debug, Default)]
pub struct GameWorld {
    pub tick: u64,
    pub last_tick_at: LogicalTime,
    actions: HashMap<ConnectionId, u32>,
}

impl GameWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one completed action for `player` and return its new total
    pub fn record_action(&mut self, player: ConnectionId) -> u32 {
        let count = self.actions.entry(player).or_default();
        *count = count.saturating_add(1);
        *count
    }

    pub fn actions_of(&self, player: ConnectionId) -> u32 {
        self.actions.get(&player).copied().unwrap_or(0)
    }

    pub fn total_actions(&self) -> u64 {
        self.actions.values().map(|&n| u64::from(n)).sum()
    }
}

impl ShardWorld for GameWorld {
    fn on_tick(&mut self, tick: u64, now: LogicalTime) -> anyhow::Result<()> {
        self.tick = tick;
        self.last_tick_at = now;
        trace!(target: "world", "Tick {} at {}", tick, now);
        Ok(())
    }
}
