use std::time::Duration;

use thais_events::LogicalTime;
use tokio::time::Instant;

/// Far enough out that nothing in a running shard will ever reach it
const END_OF_TIME: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Monotonic shard clock mapping tokio instants to logical milliseconds.
///
/// Built on `tokio::time::Instant`, so a paused test runtime drives it
/// deterministically.
#[derive(Debug, Clone, Copy)]
pub struct ShardClock {
    epoch: Instant,
}

impl ShardClock {
    /// Start a clock whose logical zero is now
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> LogicalTime {
        let elapsed = self.epoch.elapsed().as_millis();
        LogicalTime::from_millis(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    /// The tokio instant at which `at` is reached
    pub fn instant_at(&self, at: LogicalTime) -> Instant {
        let offset = Duration::from_millis(at.as_millis()).min(END_OF_TIME);
        self.epoch + offset
    }
}

impl Default for ShardClock {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_paused_time() {
        let clock = ShardClock::start();
        assert_eq!(clock.now(), LogicalTime::ZERO);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(clock.now(), LogicalTime::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_at_round_trips() {
        let clock = ShardClock::start();
        let target = LogicalTime::from_millis(75);
        tokio::time::sleep_until(clock.instant_at(target)).await;
        assert_eq!(clock.now(), target);
    }
}
