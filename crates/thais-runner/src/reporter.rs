use std::time::Duration;

use thais_scheduler::SchedulerHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Periodically logs scheduler statistics until told to stop
pub struct StatsReporter;

impl StatsReporter {
    pub fn spawn<S: Send + 'static>(
        handle: SchedulerHandle<S>,
        every: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!(
                            target: "scheduler",
                            "[Stats @ {}] Pending: {} | {}",
                            handle.now(),
                            handle.pending(),
                            handle.stats()
                        );
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
