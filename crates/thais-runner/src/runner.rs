//! Shard lifecycle: build a scheduler around a world, run its dispatch loop
//! and shut it down cleanly.

use std::sync::Arc;
use std::time::Duration;

use thais_bridge::{DispatchBridge, PacketDecoder};
use thais_events::EventObserver;
use thais_scheduler::{Scheduler, SchedulerError, SchedulerHandle, ShardClock, StatsSnapshot};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::SchedulerConfig;
use crate::heartbeat::{start_heartbeat, ShardWorld};
use crate::reporter::StatsReporter;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("World state not specified - use .with_world()")]
    MissingWorld,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("dispatch loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What is left of a shard after it stopped
#[derive(Debug)]
pub struct ShardReport<S> {
    pub world: S,
    pub stats: StatsSnapshot,
}

pub struct ShardRunnerBuilder<S> {
    world: Option<S>,
    observers: Vec<Box<dyn EventObserver>>,
    shutdown_rx: Option<watch::Receiver<bool>>,
    config: SchedulerConfig,
    clock: Option<ShardClock>,
    handle_ctrl_c: bool,
}

impl<S: ShardWorld> ShardRunnerBuilder<S> {
    pub fn new() -> Self {
        Self {
            world: None,
            observers: Vec::new(),
            shutdown_rx: None,
            config: SchedulerConfig::default(),
            clock: None,
            handle_ctrl_c: true,
        }
    }

    pub fn with_world(mut self, world: S) -> Self {
        self.world = Some(world);
        self
    }

    /// Add an observer. Observers are notified in the order they were added.
    pub fn with_observer(mut self, observer: impl EventObserver) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Stop when this channel carries `true`
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    pub fn with_clock(mut self, clock: ShardClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Whether Ctrl+C stops the shard. On by default.
    pub fn handle_ctrl_c(mut self, enabled: bool) -> Self {
        self.handle_ctrl_c = enabled;
        self
    }

    pub fn build(self) -> Result<ShardRunner<S>, BuildError> {
        let world = self.world.ok_or(BuildError::MissingWorld)?;
        let mut scheduler = Scheduler::with_clock(world, self.clock.unwrap_or_default());
        for observer in self.observers {
            scheduler.subscribe_boxed(observer);
        }
        Ok(ShardRunner {
            scheduler,
            shutdown_rx: self.shutdown_rx,
            config: self.config,
            handle_ctrl_c: self.handle_ctrl_c,
        })
    }
}

impl<S: ShardWorld> Default for ShardRunnerBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns one shard's scheduler until [`run`](Self::run) consumes it
pub struct ShardRunner<S> {
    scheduler: Scheduler<S>,
    shutdown_rx: Option<watch::Receiver<bool>>,
    config: SchedulerConfig,
    handle_ctrl_c: bool,
}

impl<S: ShardWorld> ShardRunner<S> {
    pub fn builder() -> ShardRunnerBuilder<S> {
        ShardRunnerBuilder::new()
    }

    pub fn handle(&self) -> SchedulerHandle<S> {
        self.scheduler.handle()
    }

    pub fn clock(&self) -> ShardClock {
        self.scheduler.clock()
    }

    pub fn subscribe(&mut self, observer: impl EventObserver) {
        self.scheduler.subscribe(observer);
    }

    /// Create a dispatch bridge feeding this shard and route its fired
    /// payloads back to connections
    pub fn bridge(&mut self, decoder: Arc<dyn PacketDecoder<S>>) -> DispatchBridge<S> {
        let bridge = DispatchBridge::new(self.scheduler.handle(), decoder);
        self.scheduler.subscribe(bridge.observer());
        bridge
    }

    /// Run the dispatch loop until Ctrl+C or the shutdown channel fires.
    ///
    /// Returns the final world state, or the fatal error that stopped the
    /// loop on its own.
    pub async fn run(self) -> Result<ShardReport<S>, RunError> {
        let ShardRunner {
            mut scheduler,
            shutdown_rx,
            config,
            handle_ctrl_c,
        } = self;
        let handle = scheduler.handle();

        if config.world_tick_ms > 0 {
            start_heartbeat(&handle, config.world_tick_ms)?;
            info!(target: "scheduler", "World heartbeat every {}ms", config.world_tick_ms);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let reporter = (config.stats_interval_ms > 0).then(|| {
            StatsReporter::spawn(
                handle.clone(),
                Duration::from_millis(config.stats_interval_ms),
                stop_rx.clone(),
            )
        });

        let mut dispatch = tokio::spawn(async move {
            let result = scheduler.run(stop_rx).await;
            (result, scheduler)
        });

        let finished = tokio::select! {
            _ = wait_for_ctrl_c(handle_ctrl_c) => {
                info!("Received Ctrl+C, stopping shard");
                None
            }
            _ = wait_for_shutdown(shutdown_rx) => {
                info!("Shutdown requested, stopping shard");
                None
            }
            joined = &mut dispatch => Some(joined),
        };

        let _ = stop_tx.send(true);
        let (result, scheduler) = match finished {
            Some(joined) => joined?,
            None => dispatch.await?,
        };
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }

        if let Err(e) = result {
            error!(target: "scheduler", "Dispatch loop failed: {}", e);
            return Err(e.into());
        }

        let stats = scheduler.stats();
        info!(target: "scheduler", "Shard stopped. {}", stats);
        Ok(ShardReport {
            world: scheduler.into_world(),
            stats,
        })
    }
}

async fn wait_for_ctrl_c(enabled: bool) {
    if !enabled {
        return std::future::pending().await;
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn wait_for_shutdown(shutdown_rx: Option<watch::Receiver<bool>>) {
    let Some(mut shutdown_rx) = shutdown_rx else {
        return std::future::pending().await;
    };
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            // Sender gone without asking for shutdown, keep running
            std::future::pending::<()>().await;
        }
    }
}
